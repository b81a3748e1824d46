//! Path → file handle cache
//!
//! Paths are canonical (`/a/b`, see [`nfspoof_core::path::normalize`]). Every
//! intermediate directory met while resolving is cached too, bounded by an
//! LRU. Attributes are served from the cache while younger than the
//! configured TTL.
//!
//! Concurrent resolves of the same uncached path by callers presenting the
//! same credential share one LOOKUP chain. Callers with a different
//! credential run their own, so one identity's failure is never handed to
//! another. Failures are never cached.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use nfspoof_core::path::{self, ROOT};
use nfspoof_core::{Attributes, CacheConfig, Credential, FileHandle, NodeInfo};

use crate::client::RemoteFs;
use crate::error::ClientError;

#[derive(Clone)]
struct CacheEntry {
    handle: FileHandle,
    attributes: Option<Attributes>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn fresh_attributes(&self, ttl: Duration) -> Option<&Attributes> {
        match &self.attributes {
            Some(attrs) if self.fetched_at.elapsed() < ttl => Some(attrs),
            _ => None,
        }
    }
}

type FlightKey = (String, Credential);
type FlightResult = Result<FileHandle, ClientError>;

enum Attach {
    Leader,
    Waiter(broadcast::Receiver<FlightResult>),
}

/// Removes the in-flight entry if the leader goes away without finishing
struct Flight<'a> {
    in_flight: &'a DashMap<FlightKey, broadcast::Sender<FlightResult>>,
    key: Option<FlightKey>,
}

impl Flight<'_> {
    fn finish(mut self, result: &FlightResult) {
        if let Some(key) = self.key.take() {
            if let Some((_, sender)) = self.in_flight.remove(&key) {
                let _ = sender.send(result.clone());
            }
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.remove(&key);
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub shared_resolves: AtomicU64,
    pub stale_retries: AtomicU64,
}

pub struct HandleCache {
    remote: Arc<dyn RemoteFs>,
    root: FileHandle,
    entries: Mutex<LruCache<String, CacheEntry>>,
    in_flight: DashMap<FlightKey, broadcast::Sender<FlightResult>>,
    ttl: Duration,
    impersonate_owner: bool,
    stats: CacheStats,
}

impl HandleCache {
    pub fn new(remote: Arc<dyn RemoteFs>, root: FileHandle, config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            remote,
            root,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            ttl: config.attr_ttl(),
            impersonate_owner: false,
            stats: CacheStats::default(),
        }
    }

    /// Run each LOOKUP of a resolve as the owner of the directory searched
    pub fn with_owner_impersonation(mut self, enabled: bool) -> Self {
        self.impersonate_owner = enabled;
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteFs> {
        &self.remote
    }

    pub fn root(&self) -> &FileHandle {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached handle without touching the server
    pub fn cached_handle(&self, path: &str) -> Option<FileHandle> {
        if path == ROOT {
            return Some(self.root.clone());
        }
        self.entries.lock().get(path).map(|e| e.handle.clone())
    }

    /// Cached attributes regardless of age
    pub fn cached_attributes(&self, path: &str) -> Option<Attributes> {
        self.entries
            .lock()
            .peek(path)
            .and_then(|e| e.attributes.clone())
    }

    fn fresh_attributes(&self, path: &str) -> Option<Attributes> {
        self.entries
            .lock()
            .get(path)
            .and_then(|e| e.fresh_attributes(self.ttl).cloned())
    }

    /// Record a handle (and attributes, if known) for `path`
    pub fn insert(&self, path: &str, node: NodeInfo) {
        trace!("cache insert {}", path);
        self.entries.lock().put(
            path.to_string(),
            CacheEntry {
                handle: node.handle,
                attributes: node.attributes,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Refresh the attributes of a cached path
    pub fn update_attributes(&self, path: &str, attributes: Attributes) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.attributes = Some(attributes);
            entry.fetched_at = Instant::now();
        } else if path == ROOT {
            entries.put(
                ROOT.to_string(),
                CacheEntry {
                    handle: self.root.clone(),
                    attributes: Some(attributes),
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Drop `path` and everything below it
    pub fn invalidate(&self, path: &str) {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| path::is_within(key, path))
            .cloned()
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!("invalidated {} cache entries under {}", doomed.len(), path);
        }
    }

    /// Drop the handles along `path` (all ancestors but the root) and below it
    fn invalidate_chain(&self, path: &str) {
        self.invalidate(path);
        let mut entries = self.entries.lock();
        let mut current = path;
        while let Some((parent, _)) = path::split_parent(current) {
            if parent != ROOT {
                entries.pop(parent);
            }
            current = parent;
        }
    }

    /// Forget both sides of a rename
    pub fn rename(&self, from: &str, to: &str) {
        self.invalidate(from);
        self.invalidate(to);
    }

    /// Handle for `path`, resolving uncached components with LOOKUP
    pub async fn resolve(&self, path: &str, cred: &Credential) -> Result<FileHandle, ClientError> {
        if let Some(handle) = self.cached_handle(path) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let key = (path.to_string(), cred.clone());
        loop {
            match self.attach(&key) {
                Attach::Leader => {
                    let flight = Flight {
                        in_flight: &self.in_flight,
                        key: Some(key.clone()),
                    };
                    let result = match self.lookup_chain(path, cred).await {
                        // A cached ancestor went stale: start over from the root
                        Err(e) if e.is_stale() => {
                            debug!("stale ancestor while resolving {}, restarting", path);
                            self.stats.stale_retries.fetch_add(1, Ordering::Relaxed);
                            self.invalidate_chain(path);
                            self.lookup_chain(path, cred).await
                        }
                        other => other,
                    };
                    flight.finish(&result);
                    return result;
                }
                Attach::Waiter(mut receiver) => {
                    self.stats.shared_resolves.fetch_add(1, Ordering::Relaxed);
                    match receiver.recv().await {
                        Ok(result) => return result,
                        // Leader was cancelled; take over
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    fn attach(&self, key: &FlightKey) -> Attach {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => Attach::Waiter(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(sender);
                Attach::Leader
            }
        }
    }

    /// LOOKUP from the deepest cached ancestor down to `path`
    async fn lookup_chain(&self, path: &str, cred: &Credential) -> FlightResult {
        let mut base = path;
        let mut pending = Vec::new();
        let mut handle = loop {
            if let Some(handle) = self.cached_handle(base) {
                break handle;
            }
            match path::split_parent(base) {
                Some((parent, name)) => {
                    pending.push(name);
                    base = parent;
                }
                None => break self.root.clone(),
            }
        };

        let mut current = base.to_string();
        for name in pending.into_iter().rev() {
            let step_cred = self.lookup_credential(&current, cred);
            let node = self.remote.lookup(&handle, name, &step_cred).await?;
            current = path::join(&current, name);
            trace!("resolved {}", current);
            handle = node.handle.clone();
            self.insert(&current, node);
        }
        Ok(handle)
    }

    fn lookup_credential(&self, dir: &str, cred: &Credential) -> Credential {
        if !self.impersonate_owner {
            return cred.clone();
        }
        match self.cached_attributes(dir) {
            Some(attrs) => Credential {
                uid: attrs.uid,
                gid: attrs.gid,
                supplementary_gids: cred.supplementary_gids.clone(),
            },
            None => cred.clone(),
        }
    }

    /// Attributes of `path`, from cache while fresh, else GETATTR
    pub async fn attributes(&self, path: &str, cred: &Credential) -> Result<Attributes, ClientError> {
        if let Some(attrs) = self.fresh_attributes(path) {
            return Ok(attrs);
        }
        let remote = &self.remote;
        let attrs = self
            .with_stale_retry(path, cred, |fh| async move { remote.getattr(&fh, cred).await })
            .await?;
        self.update_attributes(path, attrs.clone());
        Ok(attrs)
    }

    /// Run `op` against the handle of `path`
    ///
    /// A stale-handle failure evicts the path chain, re-resolves from the
    /// root and retries exactly once. Whatever the retry returns is final.
    pub async fn with_stale_retry<T, F, Fut>(
        &self,
        path: &str,
        cred: &Credential,
        op: F,
    ) -> Result<T, ClientError>
    where
        F: Fn(FileHandle) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let handle = self.resolve(path, cred).await?;
        match op(handle).await {
            Err(e) if e.is_stale() => {
                debug!("stale handle for {}, re-resolving", path);
                self.stats.stale_retries.fetch_add(1, Ordering::Relaxed);
                self.invalidate_chain(path);
                let handle = self.resolve(path, cred).await?;
                let result = op(handle).await;
                if matches!(&result, Err(e) if e.is_stale()) {
                    self.invalidate_chain(path);
                }
                result
            }
            other => other,
        }
    }
}
