//! Error types shared by the codec and protocol layers

use thiserror::Error;

/// Malformed wire data. Fatal to the call that hit it, never to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XdrError {
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{field} length {len} exceeds limit {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} must be exactly {expected} bytes, got {len}")]
    LengthMismatch {
        field: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("{field} value {value} does not fit the wire format")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("invalid {what} discriminant: {value}")]
    InvalidDiscriminant { what: &'static str, value: u32 },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Semantic failures reported by the server (or detected before sending)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no such file or directory")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("stale file handle")]
    StaleHandle,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("operation not supported")]
    NotSupported,

    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),
}

impl ProtocolError {
    /// Map to libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            ProtocolError::NotFound => libc::ENOENT,
            ProtocolError::AccessDenied => libc::EACCES,
            ProtocolError::NotSupported => libc::EOPNOTSUPP,
            ProtocolError::StaleHandle
            | ProtocolError::Io(_)
            | ProtocolError::VersionMismatch(_) => libc::EIO,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ProtocolError::StaleHandle)
    }
}
