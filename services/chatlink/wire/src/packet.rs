//! Packet framing for the wire protocol.
//!
//! A frame is a `u32` length prefix followed by the fixed header, the command
//! name and the body.

use crate::header::{Flags, Header, PacketKind, CHECKSUMMED_HEADER_BYTES, HEADER_SIZE, WIRE_VERSION};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Maximum frame size (4 MiB default, 32 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
/// Hard maximum frame size limit (32 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Maximum command name length in bytes
pub const MAX_COMMAND_LEN: usize = 256;

/// A single protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind
    pub kind: PacketKind,
    /// Flags
    pub flags: Flags,
    /// Sequence id, unique per session for requests
    pub sequence_id: u32,
    /// Command name, e.g. `login` or `message.push`
    pub command: String,
    /// Opaque body
    pub body: Bytes,
}

impl Packet {
    /// Build a request packet
    pub fn request(command: impl Into<String>, sequence_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Request,
            flags: Flags::empty(),
            sequence_id,
            command: command.into(),
            body: body.into(),
        }
    }

    /// Build a response to `request`, echoing its command and sequence id
    pub fn response_to(request: &Packet, body: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Response,
            flags: Flags::empty(),
            sequence_id: request.sequence_id,
            command: request.command.clone(),
            body: body.into(),
        }
    }

    /// Build a server push packet
    pub fn push(command: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Push,
            flags: Flags::empty(),
            sequence_id: 0,
            command: command.into(),
            body: body.into(),
        }
    }

    /// Set flags
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this packet answers a request with the given command and sequence id
    pub fn answers(&self, command: &str, sequence_id: u32) -> bool {
        self.kind == PacketKind::Response && self.sequence_id == sequence_id && self.command == command
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + HEADER_SIZE + self.command.len() + self.body.len()
    }

    /// Encode packet to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, WireError> {
        if self.command.is_empty() || self.command.len() > MAX_COMMAND_LEN {
            return Err(WireError::Command);
        }

        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(WireError::Size(total_size));
        }

        let mut header = Header {
            version: WIRE_VERSION,
            kind: self.kind,
            flags: self.flags,
            sequence_id: self.sequence_id,
            command_len: self.command.len() as u16,
            checksum: 0,
        };

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_u32((total_size - 4) as u32);

        // Encode once to learn the checksummed prefix, then patch the checksum in.
        header.encode(&mut buf);
        header.checksum = checksum(
            &buf[4..4 + CHECKSUMMED_HEADER_BYTES],
            self.command.as_bytes(),
            &self.body,
        );
        buf.truncate(4);
        header.encode(&mut buf);

        buf.put_slice(self.command.as_bytes());
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }
}

fn checksum(header_prefix: &[u8], command: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.update(command);
    hasher.update(body);
    hasher.finalize()
}

/// Frame decoder for parsing incoming packets
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit, clamped to [`HARD_MAX_FRAME_SIZE`]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one packet from a buffer.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not complete yet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if frame_len < HEADER_SIZE {
            return Err(WireError::Malformed);
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(frame_len).freeze();
        let checksummed_prefix = frame.slice(..CHECKSUMMED_HEADER_BYTES);
        let header = Header::decode(&mut frame)?;

        let command_len = header.command_len as usize;
        if command_len == 0 || command_len > MAX_COMMAND_LEN || frame.len() < command_len {
            return Err(WireError::Command);
        }
        let command_raw = frame.split_to(command_len);
        let body = frame;

        if checksum(&checksummed_prefix, &command_raw, &body) != header.checksum {
            return Err(WireError::Checksum);
        }

        let command = std::str::from_utf8(&command_raw)
            .map_err(|_| WireError::Command)?
            .to_string();

        trace!(
            "Decoded {:?} packet '{}' (seq {}, {} body bytes)",
            header.kind,
            command,
            header.sequence_id,
            body.len()
        );

        Ok(Some(Packet {
            kind: header.kind,
            flags: header.flags,
            sequence_id: header.sequence_id,
            command,
            body,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_decode() {
        let packet = Packet::request("message.send", 7, Bytes::from_static(b"{\"text\":\"hi\"}"))
            .with_flags(Flags::EXPECTS_RESPONSE);
        let encoded = packet.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded.len(), packet.encoded_size());

        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let packet = Packet::push("message.push", Bytes::from_static(b"hello"));
        let encoded = packet.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), encoded.len() - 3);

        buf.extend_from_slice(&encoded[encoded.len() - 3..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(packet));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Packet::request("heartbeat.alive", 1, Bytes::new());
        let second = Packet::request("key.refresh", 2, Bytes::new());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.extend_from_slice(&second.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_corrupted_body_detected() {
        let packet = Packet::push("message.push", Bytes::from_static(b"hello"));
        let encoded = packet.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut buf = BytesMut::from(encoded.as_ref());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert_eq!(FrameDecoder::new().decode(&mut buf), Err(WireError::Checksum));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let packet = Packet::push("message.push", vec![0u8; 128]);
        assert!(matches!(packet.encode(64), Err(WireError::Size(_))));

        let encoded = packet.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let mut decoder = FrameDecoder::with_max_frame_size(64);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }

    #[test]
    fn test_invalid_command_rejected() {
        let empty = Packet::request("", 1, Bytes::new());
        assert_eq!(empty.encode(DEFAULT_MAX_FRAME_SIZE), Err(WireError::Command));

        let long = Packet::request("x".repeat(MAX_COMMAND_LEN + 1), 1, Bytes::new());
        assert_eq!(long.encode(DEFAULT_MAX_FRAME_SIZE), Err(WireError::Command));
    }

    #[test]
    fn test_answers_matches_command_and_sequence() {
        let request = Packet::request("login", 3, Bytes::new());
        let response = Packet::response_to(&request, Bytes::new());
        assert!(response.answers("login", 3));
        assert!(!response.answers("login", 4));
        assert!(!response.answers("logout", 3));
        assert!(!request.answers("login", 3));
    }
}
