//! In-memory `RemoteFs` for unit tests
//!
//! Permission checks follow the classic owner/group/other mode bits with no
//! special case for uid 0, like an export with root squashing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use nfspoof_core::{
    Attributes, Credential, DirEntry, DirPage, FileHandle, FileType, FsInfo, FsStats, NfsVersion,
    NodeInfo, ProtocolError, ReadResult, SetAttributes, WriteResult,
};

use crate::client::RemoteFs;
use crate::error::ClientError;

pub const ROOT_ID: u64 = 1;

struct Node {
    attrs: Attributes,
    generation: u32,
    children: BTreeMap<String, u64>,
    data: Vec<u8>,
    target: String,
}

#[derive(Default)]
pub struct Calls {
    pub lookup: AtomicUsize,
    pub getattr: AtomicUsize,
    pub read: AtomicUsize,
    pub write: AtomicUsize,
    pub readdir: AtomicUsize,
}

pub struct MockRemote {
    nodes: Mutex<HashMap<u64, Node>>,
    next_id: Mutex<u64>,
    pub calls: Calls,
    /// Every LOOKUP sleeps this long first
    pub lookup_delay: Mutex<Option<Duration>>,
    /// Largest READ reply the server sends
    pub max_read: usize,
    /// Credentials seen, in call order
    pub seen: Mutex<Vec<Credential>>,
}

fn handle(id: u64, generation: u32) -> FileHandle {
    let mut raw = id.to_be_bytes().to_vec();
    raw.extend_from_slice(&generation.to_be_bytes());
    FileHandle::new(raw)
}

fn err(e: ProtocolError) -> ClientError {
    ClientError::Protocol(e)
}

fn permits(attrs: &Attributes, cred: &Credential, bit: u32) -> bool {
    let shift = if cred.uid == attrs.uid {
        6
    } else if cred.gid == attrs.gid || cred.supplementary_gids.contains(&attrs.gid) {
        3
    } else {
        0
    };
    (attrs.mode >> shift) & bit != 0
}

impl MockRemote {
    /// Root directory owned by 0:0, mode 0755
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                attrs: Attributes::directory(ROOT_ID, 0, 0),
                generation: 0,
                children: BTreeMap::new(),
                data: Vec::new(),
                target: String::new(),
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            next_id: Mutex::new(ROOT_ID + 1),
            calls: Calls::default(),
            lookup_delay: Mutex::new(None),
            max_read: 1 << 20,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> FileHandle {
        handle(ROOT_ID, 0)
    }

    fn add(&self, parent: u64, name: &str, mut attrs: Attributes, data: Vec<u8>) -> u64 {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        attrs.fileid = id;
        let mut nodes = self.nodes.lock();
        nodes.insert(
            id,
            Node {
                attrs,
                generation: 0,
                children: BTreeMap::new(),
                data,
                target: String::new(),
            },
        );
        if let Some(p) = nodes.get_mut(&parent) {
            p.children.insert(name.to_string(), id);
        }
        id
    }

    pub fn add_dir(&self, parent: u64, name: &str, uid: u32, gid: u32, mode: u32) -> u64 {
        let mut attrs = Attributes::directory(0, uid, gid);
        attrs.mode = mode;
        self.add(parent, name, attrs, Vec::new())
    }

    pub fn add_file(&self, parent: u64, name: &str, uid: u32, mode: u32, data: &[u8]) -> u64 {
        let mut attrs = Attributes::file(0, data.len() as u64, uid, uid);
        attrs.mode = mode;
        self.add(parent, name, attrs, data.to_vec())
    }

    /// Invalidate every handle previously given out for `id`
    pub fn make_stale(&self, id: u64) {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.generation += 1;
        }
    }

    pub fn content(&self, id: u64) -> Vec<u8> {
        self.nodes
            .lock()
            .get(&id)
            .map(|n| n.data.clone())
            .unwrap_or_default()
    }

    pub fn lookups(&self) -> usize {
        self.calls.lookup.load(Ordering::SeqCst)
    }

    fn id_of(&self, fh: &FileHandle) -> Result<u64, ClientError> {
        let raw = fh.as_bytes();
        if raw.len() != 12 {
            return Err(err(ProtocolError::StaleHandle));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&raw[..8]);
        let mut generation = [0u8; 4];
        generation.copy_from_slice(&raw[8..]);
        let id = u64::from_be_bytes(id);
        match self.nodes.lock().get(&id) {
            Some(node) if node.generation == u32::from_be_bytes(generation) => Ok(id),
            _ => Err(err(ProtocolError::StaleHandle)),
        }
    }

    fn attrs(&self, id: u64) -> Attributes {
        self.nodes
            .lock()
            .get(&id)
            .map(|n| n.attrs.clone())
            .unwrap_or_else(|| Attributes::file(id, 0, 0, 0))
    }

    fn node_info(&self, id: u64) -> NodeInfo {
        let nodes = self.nodes.lock();
        let node = &nodes[&id];
        NodeInfo {
            handle: handle(id, node.generation),
            attributes: Some(node.attrs.clone()),
        }
    }

    fn record(&self, cred: &Credential) {
        self.seen.lock().push(cred.clone());
    }

    fn check_access(&self, id: u64, cred: &Credential, bit: u32) -> Result<(), ClientError> {
        if permits(&self.attrs(id), cred, bit) {
            Ok(())
        } else {
            Err(err(ProtocolError::AccessDenied))
        }
    }

    fn make(
        &self,
        dir: &FileHandle,
        name: &str,
        kind: FileType,
        mode: u32,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        let parent = self.id_of(dir)?;
        self.check_access(parent, cred, 2)?;
        if self.nodes.lock()[&parent].children.contains_key(name) {
            return Err(err(ProtocolError::Io("NFS3ERR_EXIST".into())));
        }
        let mut attrs = match kind {
            FileType::Directory => Attributes::directory(0, cred.uid, cred.gid),
            _ => Attributes::file(0, 0, cred.uid, cred.gid),
        };
        attrs.kind = kind;
        attrs.mode = mode;
        let id = self.add(parent, name, attrs, Vec::new());
        Ok(self.node_info(id))
    }

    fn unlink(&self, dir: &FileHandle, name: &str, cred: &Credential) -> Result<(), ClientError> {
        let parent = self.id_of(dir)?;
        self.check_access(parent, cred, 2)?;
        let mut nodes = self.nodes.lock();
        let removed = nodes
            .get_mut(&parent)
            .and_then(|p| p.children.remove(name))
            .ok_or_else(|| err(ProtocolError::NotFound))?;
        nodes.remove(&removed);
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MockRemote {
    fn version(&self) -> NfsVersion {
        NfsVersion::V3
    }

    async fn null(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn getattr(&self, fh: &FileHandle, cred: &Credential) -> Result<Attributes, ClientError> {
        self.record(cred);
        self.calls.getattr.fetch_add(1, Ordering::SeqCst);
        let id = self.id_of(fh)?;
        Ok(self.attrs(id))
    }

    async fn setattr(
        &self,
        fh: &FileHandle,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<Option<Attributes>, ClientError> {
        self.record(cred);
        let id = self.id_of(fh)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&id).ok_or_else(|| err(ProtocolError::NotFound))?;
        if cred.uid != node.attrs.uid {
            return Err(err(ProtocolError::AccessDenied));
        }
        if let Some(mode) = attrs.mode {
            node.attrs.mode = mode;
        }
        if let Some(uid) = attrs.uid {
            node.attrs.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.attrs.gid = gid;
        }
        if let Some(size) = attrs.size {
            node.data.resize(size as usize, 0);
            node.attrs.size = size;
        }
        Ok(Some(node.attrs.clone()))
    }

    async fn lookup(
        &self,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        self.record(cred);
        self.calls.lookup.fetch_add(1, Ordering::SeqCst);
        let delay = *self.lookup_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let parent = self.id_of(dir)?;
        self.check_access(parent, cred, 1)?;
        let child = self.nodes.lock()[&parent].children.get(name).copied();
        match child {
            Some(id) => Ok(self.node_info(id)),
            None => Err(err(ProtocolError::NotFound)),
        }
    }

    async fn read(
        &self,
        fh: &FileHandle,
        offset: u64,
        count: u32,
        cred: &Credential,
    ) -> Result<ReadResult, ClientError> {
        self.record(cred);
        self.calls.read.fetch_add(1, Ordering::SeqCst);
        let id = self.id_of(fh)?;
        self.check_access(id, cred, 4)?;
        let data = self.content(id);
        let start = (offset as usize).min(data.len());
        let end = (start + (count as usize).min(self.max_read)).min(data.len());
        Ok(ReadResult {
            data: Bytes::copy_from_slice(&data[start..end]),
            eof: end == data.len(),
            attributes: Some(self.attrs(id)),
        })
    }

    async fn write(
        &self,
        fh: &FileHandle,
        offset: u64,
        data: Bytes,
        cred: &Credential,
    ) -> Result<WriteResult, ClientError> {
        self.record(cred);
        self.calls.write.fetch_add(1, Ordering::SeqCst);
        let id = self.id_of(fh)?;
        self.check_access(id, cred, 2)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&id).ok_or_else(|| err(ProtocolError::NotFound))?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(&data);
        node.attrs.size = node.data.len() as u64;
        Ok(WriteResult {
            count: data.len() as u32,
            attributes: Some(node.attrs.clone()),
        })
    }

    async fn create(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        _guarded: bool,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        self.record(cred);
        self.make(dir, name, FileType::Regular, attrs.mode.unwrap_or(0o644), cred)
    }

    async fn mkdir(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        self.record(cred);
        self.make(dir, name, FileType::Directory, attrs.mode.unwrap_or(0o755), cred)
    }

    async fn symlink(
        &self,
        dir: &FileHandle,
        name: &str,
        target: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        self.record(cred);
        let info = self.make(dir, name, FileType::Symlink, 0o777, cred)?;
        let id = self.id_of(&info.handle)?;
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.target = target.to_string();
        }
        Ok(info)
    }

    async fn remove(&self, dir: &FileHandle, name: &str, cred: &Credential) -> Result<(), ClientError> {
        self.record(cred);
        self.unlink(dir, name, cred)
    }

    async fn rmdir(&self, dir: &FileHandle, name: &str, cred: &Credential) -> Result<(), ClientError> {
        self.record(cred);
        self.unlink(dir, name, cred)
    }

    async fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
        cred: &Credential,
    ) -> Result<(), ClientError> {
        self.record(cred);
        let from = self.id_of(from_dir)?;
        let to = self.id_of(to_dir)?;
        self.check_access(from, cred, 2)?;
        self.check_access(to, cred, 2)?;
        let mut nodes = self.nodes.lock();
        let id = nodes
            .get_mut(&from)
            .and_then(|p| p.children.remove(from_name))
            .ok_or_else(|| err(ProtocolError::NotFound))?;
        if let Some(p) = nodes.get_mut(&to) {
            p.children.insert(to_name.to_string(), id);
        }
        Ok(())
    }

    async fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        _cookie_verifier: [u8; 8],
        _count: u32,
        cred: &Credential,
    ) -> Result<DirPage, ClientError> {
        self.record(cred);
        self.calls.readdir.fetch_add(1, Ordering::SeqCst);
        let id = self.id_of(dir)?;
        self.check_access(id, cred, 4)?;
        let nodes = self.nodes.lock();
        // Two entries per page so paging is exercised
        let entries: Vec<DirEntry> = nodes[&id]
            .children
            .iter()
            .enumerate()
            .skip(cookie as usize)
            .take(2)
            .map(|(i, (name, child))| DirEntry {
                name: name.clone(),
                fileid: *child,
                cookie: i as u64 + 1,
            })
            .collect();
        let eof = cookie as usize + entries.len() >= nodes[&id].children.len();
        Ok(DirPage {
            entries,
            cookie_verifier: [0; 8],
            eof,
        })
    }

    async fn readlink(&self, fh: &FileHandle, cred: &Credential) -> Result<String, ClientError> {
        self.record(cred);
        let id = self.id_of(fh)?;
        Ok(self.nodes.lock()[&id].target.clone())
    }

    async fn statfs(&self, fh: &FileHandle, cred: &Credential) -> Result<FsStats, ClientError> {
        self.record(cred);
        self.id_of(fh)?;
        Ok(FsStats {
            block_size: 512,
            total_bytes: 1 << 30,
            free_bytes: 1 << 29,
            avail_bytes: 1 << 29,
            total_files: 1000,
            free_files: 900,
            avail_files: 900,
        })
    }

    async fn fsinfo(
        &self,
        _fh: &FileHandle,
        _cred: &Credential,
    ) -> Result<Option<FsInfo>, ClientError> {
        Ok(None)
    }
}
