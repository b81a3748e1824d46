//! Path-based filesystem callbacks over the NFS client
//!
//! [`PathFilesystem`] is what a host adapter (FUSE) calls into. [`SpoofFs`]
//! implements it: paths go through the [`HandleCache`], each call is stamped
//! with the credential the [`CredentialManager`] hands out, and reads and
//! writes are split to the negotiated transfer sizes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use nfspoof_core::path::{self, PathError, ROOT};
use nfspoof_core::{
    Attributes, Config, Credential, CredentialManager, FileType, FsStats, NodeInfo, ProtocolError,
    SetAttributes, SetTime,
};

use crate::client::RemoteFs;
use crate::error::ClientError;
use crate::handle_cache::HandleCache;
use crate::session::MountSession;

/// READDIR reply size asked for per page
const READDIR_COUNT: u32 = 8192;

/// Errors surfaced to filesystem callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    AccessDenied,

    #[error("operation not supported")]
    NotSupported,

    #[error("operation timed out")]
    Timeout,

    #[error("read-only mount")]
    ReadOnly,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("filesystem is shutting down")]
    Shutdown,
}

impl FsError {
    /// Convert to libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::NotSupported => libc::EOPNOTSUPP,
            FsError::Timeout => libc::ETIMEDOUT,
            FsError::ReadOnly => libc::EROFS,
            FsError::Path(e) => e.to_errno(),
            FsError::Io(_) => libc::EIO,
            FsError::Shutdown => libc::ESHUTDOWN,
        }
    }
}

impl From<ClientError> for FsError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Protocol(ProtocolError::NotFound) => FsError::NotFound,
            ClientError::Protocol(ProtocolError::AccessDenied) => FsError::AccessDenied,
            ClientError::Protocol(ProtocolError::NotSupported) => FsError::NotSupported,
            ClientError::Timeout => FsError::Timeout,
            other => FsError::Io(other.to_string()),
        }
    }
}

/// One name in a directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub kind: FileType,
}

/// Filesystem operations addressed by mount-relative path
#[async_trait]
pub trait PathFilesystem: Send + Sync {
    /// Check that `path` can be opened with `flags` (`O_*`)
    async fn open(&self, path: &str, flags: i32) -> Result<(), FsError>;
    async fn release(&self, path: &str) -> Result<(), FsError>;
    async fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, FsError>;
    /// Returns the number of bytes written
    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, FsError>;
    async fn getattr(&self, path: &str) -> Result<Attributes, FsError>;
    /// Entries as the server lists them (including `.` and `..` if it sends them)
    async fn readdir(&self, path: &str) -> Result<Vec<ListedEntry>, FsError>;
    async fn mkdir(&self, path: &str, mode: u32) -> Result<Attributes, FsError>;
    async fn rmdir(&self, path: &str) -> Result<(), FsError>;
    async fn create(&self, path: &str, mode: u32) -> Result<Attributes, FsError>;
    async fn unlink(&self, path: &str) -> Result<(), FsError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;
    async fn symlink(&self, path: &str, target: &str) -> Result<Attributes, FsError>;
    async fn readlink(&self, path: &str) -> Result<String, FsError>;
    /// Apply every requested change in a single SETATTR
    async fn setattr(&self, path: &str, attrs: SetAttributes) -> Result<Attributes, FsError>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<Attributes, FsError>;
    async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>)
        -> Result<Attributes, FsError>;
    async fn truncate(&self, path: &str, size: u64) -> Result<Attributes, FsError>;
    async fn utimens(
        &self,
        path: &str,
        atime: Option<SetTime>,
        mtime: Option<SetTime>,
    ) -> Result<Attributes, FsError>;
    async fn statfs(&self, path: &str) -> Result<FsStats, FsError>;
}

/// Transfer limits and mount flags for [`SpoofFs`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpoofFsOptions {
    pub max_read: u32,
    pub max_write: u32,
    pub read_only: bool,
}

impl Default for SpoofFsOptions {
    fn default() -> Self {
        Self {
            max_read: nfspoof_core::DEFAULT_MAX_READ,
            max_write: nfspoof_core::DEFAULT_MAX_WRITE,
            read_only: false,
        }
    }
}

pub struct SpoofFs {
    cache: Arc<HandleCache>,
    credentials: Arc<CredentialManager>,
    options: SpoofFsOptions,
}

impl SpoofFs {
    pub fn new(
        cache: Arc<HandleCache>,
        credentials: Arc<CredentialManager>,
        options: SpoofFsOptions,
    ) -> Self {
        Self {
            cache,
            credentials,
            options,
        }
    }

    /// Filesystem over a mounted session, with its negotiated sizes
    pub fn from_session(session: &MountSession, config: &Config) -> Self {
        let remote: Arc<dyn RemoteFs> = session.client();
        let cache = HandleCache::new(remote, session.root().clone(), &config.cache)
            .with_owner_impersonation(config.identity.impersonate_owner);
        Self::new(
            Arc::new(cache),
            session.credentials().clone(),
            SpoofFsOptions {
                max_read: session.max_read(),
                max_write: session.max_write(),
                read_only: config.mount.read_only,
            },
        )
    }

    pub fn cache(&self) -> &Arc<HandleCache> {
        &self.cache
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    fn remote(&self) -> &Arc<dyn RemoteFs> {
        self.cache.remote()
    }

    fn writable(&self) -> Result<(), FsError> {
        if self.options.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Credential for an operation on `path`, impersonating its owner if enabled
    async fn credential(&self, path: &str) -> Credential {
        if !self.credentials.impersonates_owner() {
            return self.credentials.current();
        }
        let owner = match self.cache.cached_attributes(path) {
            Some(attrs) => Some(attrs),
            None => self
                .cache
                .attributes(path, &self.credentials.current())
                .await
                .ok(),
        };
        self.credentials.credential_for(owner.as_ref())
    }

    /// Canonical path split into parent and a validated name
    fn entry(path: &str) -> Result<(String, String, String), FsError> {
        let path = path::normalize(path)?;
        let (parent, name) = path::split_parent(&path)
            .ok_or(FsError::Path(PathError::Invalid("operation not allowed on the root")))?;
        path::validate_filename(name)?;
        let (parent, name) = (parent.to_string(), name.to_string());
        Ok((path, parent, name))
    }

    async fn store_node(&self, path: &str, node: NodeInfo, cred: &Credential) -> Result<Attributes, FsError> {
        let attrs = match &node.attributes {
            Some(attrs) => attrs.clone(),
            None => self.remote().getattr(&node.handle, cred).await?,
        };
        self.cache.insert(
            path,
            NodeInfo {
                handle: node.handle,
                attributes: Some(attrs.clone()),
            },
        );
        Ok(attrs)
    }

    /// File type of a listed entry, looked up once if the cache has not seen it
    async fn entry_kind(&self, path: &str, cred: &Credential) -> FileType {
        if let Some(attrs) = self.cache.cached_attributes(path) {
            return attrs.kind;
        }
        match self.cache.attributes(path, cred).await {
            Ok(attrs) => attrs.kind,
            Err(e) => {
                debug!("no type for {}: {}", path, e);
                FileType::Regular
            }
        }
    }

    async fn remove_entry(&self, path: &str, directory: bool) -> Result<(), FsError> {
        self.writable()?;
        let (path, parent, name) = Self::entry(path)?;
        let cred = self.credential(&parent).await;
        let remote = self.remote();
        let (cred_ref, name_ref) = (&cred, name.as_str());
        self.cache
            .with_stale_retry(&parent, &cred, |dir| async move {
                if directory {
                    remote.rmdir(&dir, name_ref, cred_ref).await
                } else {
                    remote.remove(&dir, name_ref, cred_ref).await
                }
            })
            .await?;
        self.cache.invalidate(&path);
        Ok(())
    }
}

#[async_trait]
impl PathFilesystem for SpoofFs {
    async fn open(&self, path: &str, flags: i32) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            self.writable()?;
        }
        let cred = self.credential(&path).await;
        self.cache.attributes(&path, &cred).await?;
        debug!("open {} flags {:#o}", path, flags);
        Ok(())
    }

    async fn release(&self, path: &str) -> Result<(), FsError> {
        debug!("release {}", path);
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let path = path::normalize(path)?;
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;

        let mut out = BytesMut::with_capacity(size as usize);
        let mut position = offset;
        let mut remaining = size;
        while remaining > 0 {
            let count = remaining.min(self.options.max_read);
            let at = position;
            let result = self
                .cache
                .with_stale_retry(&path, &cred, |fh| async move {
                    remote.read(&fh, at, count, cred_ref).await
                })
                .await?;
            if let Some(attrs) = result.attributes {
                self.cache.update_attributes(&path, attrs);
            }
            let got = result.data.len() as u32;
            out.extend_from_slice(&result.data);
            if result.eof || got == 0 {
                break;
            }
            position += u64::from(got);
            remaining = remaining.saturating_sub(got);
        }
        debug!("read {} @ {}: {} of {} bytes", path, offset, out.len(), size);
        Ok(out.freeze())
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.writable()?;
        let path = path::normalize(path)?;
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;

        let mut written = 0usize;
        while written < data.len() {
            let end = (written + self.options.max_write as usize).min(data.len());
            let chunk = Bytes::copy_from_slice(&data[written..end]);
            let at = offset + written as u64;
            let result = self
                .cache
                .with_stale_retry(&path, &cred, |fh| {
                    let chunk = chunk.clone();
                    async move { remote.write(&fh, at, chunk, cred_ref).await }
                })
                .await?;
            if let Some(attrs) = result.attributes {
                self.cache.update_attributes(&path, attrs);
            }
            if result.count == 0 {
                warn!("server accepted no bytes writing {} @ {}", path, at);
                return Err(FsError::Io("short write".into()));
            }
            written += result.count as usize;
        }
        debug!("write {} @ {}: {} bytes", path, offset, written);
        Ok(written as u32)
    }

    async fn getattr(&self, path: &str) -> Result<Attributes, FsError> {
        let path = path::normalize(path)?;
        let cred = self.credential(&path).await;
        Ok(self.cache.attributes(&path, &cred).await?)
    }

    async fn readdir(&self, path: &str) -> Result<Vec<ListedEntry>, FsError> {
        let path = path::normalize(path)?;
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;

        let mut entries = Vec::new();
        let mut cookie = 0u64;
        let mut verifier = [0u8; 8];
        loop {
            let (at, verf) = (cookie, verifier);
            let page = self
                .cache
                .with_stale_retry(&path, &cred, |fh| async move {
                    remote.readdir(&fh, at, verf, READDIR_COUNT, cred_ref).await
                })
                .await?;
            let last_cookie = page.entries.last().map(|e| e.cookie);
            let eof = page.eof;
            verifier = page.cookie_verifier;
            entries.extend(page.entries);
            match last_cookie {
                Some(next) if !eof => cookie = next,
                None if !eof => {
                    warn!("empty READDIR page without eof for {}", path);
                    break;
                }
                _ => break,
            }
        }
        debug!("readdir {}: {} entries", path, entries.len());

        let mut listed = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = match entry.name.as_str() {
                "." | ".." => FileType::Directory,
                name if path::validate_filename(name).is_ok() => {
                    self.entry_kind(&path::join(&path, name), &cred).await
                }
                _ => FileType::Regular,
            };
            listed.push(ListedEntry {
                name: entry.name,
                kind,
            });
        }
        Ok(listed)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<Attributes, FsError> {
        self.writable()?;
        let (path, parent, name) = Self::entry(path)?;
        let cred = self.credential(&parent).await;
        let remote = self.remote();
        let attrs = SetAttributes::mode(mode & 0o7777);
        let (cred_ref, name_ref, attrs_ref) = (&cred, name.as_str(), &attrs);
        let node = self
            .cache
            .with_stale_retry(&parent, &cred, |dir| async move {
                remote.mkdir(&dir, name_ref, attrs_ref, cred_ref).await
            })
            .await?;
        self.store_node(&path, node, &cred).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, true).await
    }

    async fn create(&self, path: &str, mode: u32) -> Result<Attributes, FsError> {
        self.writable()?;
        let (path, parent, name) = Self::entry(path)?;
        let cred = self.credential(&parent).await;
        let remote = self.remote();
        let attrs = SetAttributes::mode(mode & 0o7777);
        let (cred_ref, name_ref, attrs_ref) = (&cred, name.as_str(), &attrs);
        let node = self
            .cache
            .with_stale_retry(&parent, &cred, |dir| async move {
                remote.create(&dir, name_ref, attrs_ref, false, cred_ref).await
            })
            .await?;
        self.store_node(&path, node, &cred).await
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, false).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.writable()?;
        let (from, from_parent, from_name) = Self::entry(from)?;
        let (to, to_parent, to_name) = Self::entry(to)?;
        if path::is_within(&to, &from) && to != from {
            return Err(FsError::Path(PathError::Invalid(
                "cannot move a directory into itself",
            )));
        }
        let cred = self.credential(&from_parent).await;
        let cache = &self.cache;
        let remote = self.remote();
        let (cred_ref, from_dir_path, from_ref, to_ref) = (
            &cred,
            from_parent.as_str(),
            from_name.as_str(),
            to_name.as_str(),
        );
        // Either directory may be stale; each gets its own single retry
        self.cache
            .with_stale_retry(&to_parent, &cred, |to_dir| async move {
                let to_dir = &to_dir;
                cache
                    .with_stale_retry(from_dir_path, cred_ref, |dir| async move {
                        remote.rename(&dir, from_ref, to_dir, to_ref, cred_ref).await
                    })
                    .await
            })
            .await?;
        self.cache.rename(&from, &to);
        debug!("rename {} -> {}", from, to);
        Ok(())
    }

    async fn symlink(&self, path: &str, target: &str) -> Result<Attributes, FsError> {
        self.writable()?;
        let (path, parent, name) = Self::entry(path)?;
        if target.len() > nfspoof_core::MAX_PATH_LEN {
            return Err(PathError::PathTooLong(target.len()).into());
        }
        let cred = self.credential(&parent).await;
        let remote = self.remote();
        let (cred_ref, name_ref) = (&cred, name.as_str());
        let node = self
            .cache
            .with_stale_retry(&parent, &cred, |dir| async move {
                remote.symlink(&dir, name_ref, target, cred_ref).await
            })
            .await?;
        self.store_node(&path, node, &cred).await
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        let path = path::normalize(path)?;
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;
        Ok(self
            .cache
            .with_stale_retry(&path, &cred, |fh| async move {
                remote.readlink(&fh, cred_ref).await
            })
            .await?)
    }

    async fn setattr(&self, path: &str, mut attrs: SetAttributes) -> Result<Attributes, FsError> {
        self.writable()?;
        let path = path::normalize(path)?;
        attrs.mode = attrs.mode.map(|mode| mode & 0o7777);
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;
        let attrs_ref = &attrs;
        let updated = self
            .cache
            .with_stale_retry(&path, &cred, |fh| async move {
                remote.setattr(&fh, attrs_ref, cred_ref).await
            })
            .await?;
        let updated = match updated {
            Some(updated) => updated,
            None => {
                self.cache.invalidate(&path);
                return Ok(self.cache.attributes(&path, &cred).await?);
            }
        };
        self.cache.update_attributes(&path, updated.clone());
        Ok(updated)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<Attributes, FsError> {
        self.setattr(path, SetAttributes::mode(mode)).await
    }

    async fn chown(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<Attributes, FsError> {
        self.setattr(
            path,
            SetAttributes {
                uid,
                gid,
                ..SetAttributes::default()
            },
        )
        .await
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<Attributes, FsError> {
        self.setattr(
            path,
            SetAttributes {
                size: Some(size),
                ..SetAttributes::default()
            },
        )
        .await
    }

    async fn utimens(
        &self,
        path: &str,
        atime: Option<SetTime>,
        mtime: Option<SetTime>,
    ) -> Result<Attributes, FsError> {
        self.setattr(
            path,
            SetAttributes {
                atime,
                mtime,
                ..SetAttributes::default()
            },
        )
        .await
    }

    async fn statfs(&self, path: &str) -> Result<FsStats, FsError> {
        let path = if path.is_empty() {
            ROOT.to_string()
        } else {
            path::normalize(path)?
        };
        let cred = self.credential(&path).await;
        let remote = self.remote();
        let cred_ref = &cred;
        Ok(self
            .cache
            .with_stale_retry(&path, &cred, |fh| async move {
                remote.statfs(&fh, cred_ref).await
            })
            .await?)
    }
}
