//! Packet framing, header encoding/decoding and checksums for chatlink.
//!
//! This crate provides the low-level wire format spoken between the chatlink
//! client and its server: length-prefixed frames carrying a fixed header, a
//! command name and an opaque body.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Header (16B)         | version, kind, flags, seq, |
//! |                      | command_len, crc32         |
//! +----------------------+----------------------------+
//! | command              | UTF-8, 1..=256 bytes       |
//! +----------------------+----------------------------+
//! | body                 | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod packet;

// Re-export main types
pub use error::WireError;
pub use header::{Flags, Header, PacketKind, HEADER_SIZE, WIRE_VERSION};
pub use packet::{FrameDecoder, Packet, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_COMMAND_LEN};
