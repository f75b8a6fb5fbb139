//! Fixed packet header for the wire protocol.
//!
//! Every frame carries a 16-byte header right after its length prefix. The
//! header is enough to route a packet to a waiting request without touching
//! the body.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Number of leading header bytes covered by the checksum
pub(crate) const CHECKSUMMED_HEADER_BYTES: usize = 12;

/// Packet kinds as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Client-initiated request, may expect a response
    Request = 0x01,
    /// Server response correlated by command and sequence id
    Response = 0x02,
    /// Server-initiated push (messages, notices)
    Push = 0x03,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketKind::Request),
            0x02 => Ok(PacketKind::Response),
            0x03 => Ok(PacketKind::Push),
            _ => Err(WireError::Kind(value)),
        }
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Sender waits for a response with the same command and sequence id
        const EXPECTS_RESPONSE = 1 << 0;
        /// Body is encrypted with the session key
        const ENCRYPTED = 1 << 1;
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version
    pub version: u8,
    /// Packet kind
    pub kind: PacketKind,
    /// Flags
    pub flags: Flags,
    /// Sequence id used for request/response correlation
    pub sequence_id: u32,
    /// Length of the command name that follows the header
    pub command_len: u16,
    /// CRC32 over the first 12 header bytes, the command and the body
    pub checksum: u32,
}

impl Header {
    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.sequence_id);
        buf.put_u16(self.command_len);
        buf.put_u16(0); // reserved
        buf.put_u32(self.checksum);
    }

    /// Decode a header from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Malformed);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let kind = PacketKind::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(WireError::Reserved)?;
        let sequence_id = buf.get_u32();
        let command_len = buf.get_u16();
        if buf.get_u16() != 0 {
            return Err(WireError::Reserved);
        }
        let checksum = buf.get_u32();

        Ok(Self {
            version,
            kind,
            flags,
            sequence_id,
            command_len,
            checksum,
        })
    }
}
