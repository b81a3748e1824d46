//! Sync ↔ async bridge
//!
//! FUSE callbacks run on plain threads and must block until their answer is
//! ready; the NFS client is async. Callbacks post an [`FsRequest`] on a
//! bounded crossbeam channel and block on a tokio oneshot for the reply.
//!
//! ```text
//! FUSE thread                         tokio runtime
//! ───────────                         ─────────────
//!     │  FsRequest + oneshot::Sender       │
//!     ├───────────────────────────────────►│  one task per request
//!     │      (crossbeam bounded)           │
//!     │◄──────────────[blocks]─────────────┤
//!     │      oneshot::Receiver             │
//! ```
//!
//! The handler loop lives on its own thread and only spawns, so a slow
//! request never holds up the ones behind it. Every request is bounded by
//! the bridge timeout; a request that runs out answers `ETIMEDOUT`.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use nfspoof_core::{Attributes, FsStats, SetAttributes};

use crate::fs::{FsError, ListedEntry, PathFilesystem};
use crate::MAX_INFLIGHT_REQUESTS;

type Reply<T> = oneshot::Sender<Result<T, FsError>>;

/// Request from a filesystem callback to the async runtime
#[derive(Debug)]
pub enum FsRequest {
    Open { path: String, flags: i32, reply: Reply<()> },
    Release { path: String, reply: Reply<()> },
    Read { path: String, offset: u64, size: u32, reply: Reply<Bytes> },
    Write { path: String, offset: u64, data: Vec<u8>, reply: Reply<u32> },
    GetAttr { path: String, reply: Reply<Attributes> },
    ReadDir { path: String, reply: Reply<Vec<ListedEntry>> },
    Mkdir { path: String, mode: u32, reply: Reply<Attributes> },
    Rmdir { path: String, reply: Reply<()> },
    Create { path: String, mode: u32, reply: Reply<Attributes> },
    Unlink { path: String, reply: Reply<()> },
    Rename { from: String, to: String, reply: Reply<()> },
    Symlink { path: String, target: String, reply: Reply<Attributes> },
    ReadLink { path: String, reply: Reply<String> },
    SetAttr { path: String, attrs: SetAttributes, reply: Reply<Attributes> },
    StatFs { path: String, reply: Reply<FsStats> },
    /// Stop the handler loop
    Shutdown,
}

async fn answer<T, F>(reply: Reply<T>, timeout: Duration, operation: F)
where
    F: Future<Output = Result<T, FsError>>,
{
    let result = match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(FsError::Timeout),
    };
    // The caller may have given up already
    let _ = reply.send(result);
}

impl FsRequest {
    fn name(&self) -> &'static str {
        match self {
            FsRequest::Open { .. } => "open",
            FsRequest::Release { .. } => "release",
            FsRequest::Read { .. } => "read",
            FsRequest::Write { .. } => "write",
            FsRequest::GetAttr { .. } => "getattr",
            FsRequest::ReadDir { .. } => "readdir",
            FsRequest::Mkdir { .. } => "mkdir",
            FsRequest::Rmdir { .. } => "rmdir",
            FsRequest::Create { .. } => "create",
            FsRequest::Unlink { .. } => "unlink",
            FsRequest::Rename { .. } => "rename",
            FsRequest::Symlink { .. } => "symlink",
            FsRequest::ReadLink { .. } => "readlink",
            FsRequest::SetAttr { .. } => "setattr",
            FsRequest::StatFs { .. } => "statfs",
            FsRequest::Shutdown => "shutdown",
        }
    }

    /// Run the request against `fs` and send the answer back
    pub async fn dispatch(self, fs: &dyn PathFilesystem, timeout: Duration) {
        match self {
            FsRequest::Open { path, flags, reply } => {
                answer(reply, timeout, fs.open(&path, flags)).await
            }
            FsRequest::Release { path, reply } => answer(reply, timeout, fs.release(&path)).await,
            FsRequest::Read {
                path,
                offset,
                size,
                reply,
            } => answer(reply, timeout, fs.read(&path, offset, size)).await,
            FsRequest::Write {
                path,
                offset,
                data,
                reply,
            } => answer(reply, timeout, fs.write(&path, offset, &data)).await,
            FsRequest::GetAttr { path, reply } => answer(reply, timeout, fs.getattr(&path)).await,
            FsRequest::ReadDir { path, reply } => answer(reply, timeout, fs.readdir(&path)).await,
            FsRequest::Mkdir { path, mode, reply } => {
                answer(reply, timeout, fs.mkdir(&path, mode)).await
            }
            FsRequest::Rmdir { path, reply } => answer(reply, timeout, fs.rmdir(&path)).await,
            FsRequest::Create { path, mode, reply } => {
                answer(reply, timeout, fs.create(&path, mode)).await
            }
            FsRequest::Unlink { path, reply } => answer(reply, timeout, fs.unlink(&path)).await,
            FsRequest::Rename { from, to, reply } => {
                answer(reply, timeout, fs.rename(&from, &to)).await
            }
            FsRequest::Symlink {
                path,
                target,
                reply,
            } => answer(reply, timeout, fs.symlink(&path, &target)).await,
            FsRequest::ReadLink { path, reply } => {
                answer(reply, timeout, fs.readlink(&path)).await
            }
            FsRequest::SetAttr { path, attrs, reply } => {
                answer(reply, timeout, fs.setattr(&path, attrs)).await
            }
            FsRequest::StatFs { path, reply } => answer(reply, timeout, fs.statfs(&path)).await,
            FsRequest::Shutdown => {}
        }
    }
}

/// Blocking side of the bridge, cloned into every callback thread
#[derive(Clone)]
pub struct FsBridge {
    request_tx: Sender<FsRequest>,
    timeout: Duration,
}

impl FsBridge {
    /// Create a bridge and the handler that serves it
    pub fn new(timeout: Duration) -> (Self, BridgeHandler) {
        let (tx, rx) = bounded(MAX_INFLIGHT_REQUESTS);
        (
            Self {
                request_tx: tx,
                timeout,
            },
            BridgeHandler {
                request_rx: rx,
                timeout,
            },
        )
    }

    pub fn open(&self, path: &str, flags: i32) -> Result<(), FsError> {
        self.call(|reply| FsRequest::Open {
            path: path.to_string(),
            flags,
            reply,
        })
    }

    pub fn release(&self, path: &str) -> Result<(), FsError> {
        self.call(|reply| FsRequest::Release {
            path: path.to_string(),
            reply,
        })
    }

    pub fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, FsError> {
        self.call(|reply| FsRequest::Read {
            path: path.to_string(),
            offset,
            size,
            reply,
        })
    }

    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.call(|reply| FsRequest::Write {
            path: path.to_string(),
            offset,
            data: data.to_vec(),
            reply,
        })
    }

    pub fn getattr(&self, path: &str) -> Result<Attributes, FsError> {
        self.call(|reply| FsRequest::GetAttr {
            path: path.to_string(),
            reply,
        })
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<ListedEntry>, FsError> {
        self.call(|reply| FsRequest::ReadDir {
            path: path.to_string(),
            reply,
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<Attributes, FsError> {
        self.call(|reply| FsRequest::Mkdir {
            path: path.to_string(),
            mode,
            reply,
        })
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.call(|reply| FsRequest::Rmdir {
            path: path.to_string(),
            reply,
        })
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<Attributes, FsError> {
        self.call(|reply| FsRequest::Create {
            path: path.to_string(),
            mode,
            reply,
        })
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.call(|reply| FsRequest::Unlink {
            path: path.to_string(),
            reply,
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.call(|reply| FsRequest::Rename {
            from: from.to_string(),
            to: to.to_string(),
            reply,
        })
    }

    pub fn symlink(&self, path: &str, target: &str) -> Result<Attributes, FsError> {
        self.call(|reply| FsRequest::Symlink {
            path: path.to_string(),
            target: target.to_string(),
            reply,
        })
    }

    pub fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.call(|reply| FsRequest::ReadLink {
            path: path.to_string(),
            reply,
        })
    }

    pub fn setattr(&self, path: &str, attrs: SetAttributes) -> Result<Attributes, FsError> {
        self.call(|reply| FsRequest::SetAttr {
            path: path.to_string(),
            attrs,
            reply,
        })
    }

    pub fn statfs(&self, path: &str) -> Result<FsStats, FsError> {
        self.call(|reply| FsRequest::StatFs {
            path: path.to_string(),
            reply,
        })
    }

    /// Ask the handler loop to stop
    pub fn shutdown(&self) {
        let _ = self.request_tx.try_send(FsRequest::Shutdown);
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> FsRequest) -> Result<T, FsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = make(reply_tx);
        let op = request.name();

        match self.request_tx.send_timeout(request, self.timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                error!("bridge queue full, {} timed out", op);
                return Err(FsError::Timeout);
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                error!("bridge handler gone, dropping {}", op);
                return Err(FsError::Shutdown);
            }
        }

        // Plain thread blocking; never called from inside the runtime
        match reply_rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => {
                error!("reply channel closed for {}", op);
                Err(FsError::Shutdown)
            }
        }
    }
}

/// Async side of the bridge
pub struct BridgeHandler {
    request_rx: Receiver<FsRequest>,
    timeout: Duration,
}

impl BridgeHandler {
    /// Serve requests until shutdown or until every [`FsBridge`] is dropped
    ///
    /// Blocks the calling thread; each request becomes a task on `runtime`.
    pub fn run(self, runtime: Handle, fs: Arc<dyn PathFilesystem>) {
        loop {
            match self.request_rx.recv() {
                Ok(FsRequest::Shutdown) => {
                    debug!("bridge handler received shutdown");
                    break;
                }
                Ok(request) => {
                    trace!("bridge dispatching {}", request.name());
                    let fs = fs.clone();
                    let timeout = self.timeout;
                    runtime.spawn(async move { request.dispatch(fs.as_ref(), timeout).await });
                }
                Err(_) => {
                    debug!("bridge handler: all callers disconnected");
                    break;
                }
            }
        }
    }

    /// [`run`](Self::run) on a dedicated thread
    pub fn spawn(
        self,
        runtime: Handle,
        fs: Arc<dyn PathFilesystem>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("nfspoof-bridge".into())
            .spawn(move || self.run(runtime, fs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{SpoofFs, SpoofFsOptions};
    use crate::handle_cache::HandleCache;
    use crate::mock::{MockRemote, ROOT_ID};
    use nfspoof_core::{CacheConfig, CredentialManager};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn spoof_fs(remote: Arc<MockRemote>) -> Arc<dyn PathFilesystem> {
        let cache = HandleCache::new(remote.clone(), remote.root(), &CacheConfig::default());
        Arc::new(SpoofFs::new(
            Arc::new(cache),
            Arc::new(CredentialManager::default()),
            SpoofFsOptions::default(),
        ))
    }

    #[test]
    fn test_bridge_round_trip() {
        let rt = runtime();
        let remote = Arc::new(MockRemote::new());
        remote.add_file(ROOT_ID, "hello.txt", 0, 0o644, b"hello");
        let (bridge, handler) = FsBridge::new(Duration::from_secs(5));
        let thread = handler.spawn(rt.handle().clone(), spoof_fs(remote)).unwrap();

        assert_eq!(bridge.getattr("/hello.txt").unwrap().size, 5);
        assert_eq!(&bridge.read("/hello.txt", 0, 10).unwrap()[..], b"hello");
        assert_eq!(bridge.getattr("/nope"), Err(FsError::NotFound));
        assert_eq!(bridge.write("/hello.txt", 5, b"!").unwrap(), 1);
        assert_eq!(bridge.getattr("/hello.txt").unwrap().size, 6);
        let attrs = bridge
            .setattr(
                "/hello.txt",
                SetAttributes {
                    mode: Some(0o600),
                    size: Some(4),
                    ..SetAttributes::default()
                },
            )
            .unwrap();
        assert_eq!((attrs.mode, attrs.size), (0o600, 4));
        let listed = bridge.readdir("/").unwrap();
        assert_eq!(listed[0].name, "hello.txt");

        bridge.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_concurrent_callers() {
        let rt = runtime();
        let remote = Arc::new(MockRemote::new());
        remote.add_file(ROOT_ID, "f", 0, 0o644, b"data");
        *remote.lookup_delay.lock() = Some(Duration::from_millis(20));
        let (bridge, handler) = FsBridge::new(Duration::from_secs(5));
        let thread = handler.spawn(rt.handle().clone(), spoof_fs(remote.clone())).unwrap();

        let callers: Vec<_> = (0..6)
            .map(|_| {
                let bridge = bridge.clone();
                thread::spawn(move || bridge.read("/f", 0, 4))
            })
            .collect();
        for caller in callers {
            assert_eq!(&caller.join().unwrap().unwrap()[..], b"data");
        }
        assert_eq!(remote.lookups(), 1);

        bridge.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_request_timeout() {
        let rt = runtime();
        let remote = Arc::new(MockRemote::new());
        remote.add_file(ROOT_ID, "slow", 0, 0o644, b"x");
        *remote.lookup_delay.lock() = Some(Duration::from_secs(5));
        let (bridge, handler) = FsBridge::new(Duration::from_millis(50));
        let thread = handler.spawn(rt.handle().clone(), spoof_fs(remote)).unwrap();

        let err = bridge.getattr("/slow").unwrap_err();
        assert_eq!(err, FsError::Timeout);
        assert_eq!(err.to_errno(), libc::ETIMEDOUT);

        bridge.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_handler_gone() {
        let (bridge, handler) = FsBridge::new(Duration::from_secs(1));
        drop(handler);
        assert_eq!(bridge.getattr("/"), Err(FsError::Shutdown));
    }

    #[test]
    fn test_shutdown_request() {
        let (bridge, handler) = FsBridge::new(Duration::from_secs(1));
        bridge.shutdown();
        let request = handler.request_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(request, FsRequest::Shutdown));
    }
}
