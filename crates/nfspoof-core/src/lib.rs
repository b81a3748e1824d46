//! nfspoof core - wire codec, RPC envelope, protocol structures and identity state
//!
//! This crate contains the foundational types used by the nfspoof client.
//! It has no dependencies on networking or filesystem code.

pub mod config;
pub mod credential;
pub mod error;
pub mod path;
pub mod protocol;
pub mod rpc;
pub mod types;
pub mod xdr;

pub use config::{
    CacheConfig, Config, ConfigError, IdentityConfig, MountConfig, NetworkConfig, ServerConfig,
    TransferConfig, TransportKind,
};
pub use credential::{Credential, CredentialManager, IdentityUpdate};
pub use error::{ProtocolError, XdrError};
pub use path::PathError;
pub use types::*;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Largest RPC record accepted from the wire (all fragments together)
pub const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

/// Default READ size before the server's preferences are known
pub const DEFAULT_MAX_READ: u32 = 64 * 1024;

/// Default WRITE size before the server's preferences are known
pub const DEFAULT_MAX_WRITE: u32 = 64 * 1024;
