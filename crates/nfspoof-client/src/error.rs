//! Client-side error type

use thiserror::Error;

use nfspoof_core::{ProtocolError, XdrError};

/// Failure of one remote call
///
/// `Clone` so a single-flight leader can hand its outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    Decode(#[from] XdrError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl ClientError {
    pub(crate) fn connection(e: impl std::fmt::Display) -> Self {
        ClientError::Connection(e.to_string())
    }

    /// Map to libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            ClientError::Protocol(e) => e.to_errno(),
            ClientError::Timeout => libc::ETIMEDOUT,
            ClientError::Connection(_) | ClientError::Decode(_) | ClientError::Rpc(_) => {
                libc::EIO
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ClientError::Protocol(e) if e.is_stale())
    }
}
