//! nfspoof client - mount an NFS export under any identity
//!
//! This crate provides:
//! - An ONC-RPC transport (TCP record marking or UDP) with xid multiplexing
//! - MOUNT / NFSv2 / NFSv3 protocol clients stamping a chosen AUTH_UNIX identity
//! - A path → handle cache with single-flight resolution
//! - Path-based filesystem callbacks and a FUSE adapter
//!
//! # Architecture
//!
//! Filesystem callbacks are synchronous; the network side is async:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              FUSE threads (sync)                            │
//! │  callbacks block until the answer is ready                  │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ crossbeam-channel
//!                               │ (bounded, backpressure)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tokio runtime (async)                      │
//! │  SpoofFs → HandleCache → NfsClient → Transport              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies travel back on `tokio::sync::oneshot` channels.

pub mod bridge;
pub mod client;
pub mod error;
pub mod fs;
pub mod handle_cache;
pub mod portmap;
pub mod rpc_client;
pub mod session;
pub mod transport;

// FUSE adapter (Unix-only)
#[cfg(unix)]
pub mod fuse;

#[cfg(test)]
mod mock;

pub use bridge::{BridgeHandler, FsBridge, FsRequest};
pub use client::{NfsClient, RemoteFs};
pub use error::ClientError;
pub use fs::{FsError, ListedEntry, PathFilesystem, SpoofFs, SpoofFsOptions};
pub use handle_cache::HandleCache;
pub use rpc_client::{AuthContext, RpcClient};
pub use session::{MountClient, MountSession, SessionError};
pub use transport::{Transport, TransportConfig};

#[cfg(unix)]
pub use fuse::SpoofFuse;

/// Maximum filesystem requests queued on the bridge
pub const MAX_INFLIGHT_REQUESTS: usize = 64;
