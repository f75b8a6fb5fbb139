//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Frame checksum mismatch
    #[error("checksum mismatch")]
    Checksum,

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown packet kind
    #[error("unknown kind {0}")]
    Kind(u8),

    /// Command name is empty, too long or not UTF-8
    #[error("invalid command name")]
    Command,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
