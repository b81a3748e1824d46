//! FUSE adapter
//!
//! Implements `fuser::Filesystem` by turning inode-addressed kernel requests
//! into path-addressed calls on the [`FsBridge`]. Inode numbers are local:
//! allocated on first sight of a path, released when the kernel forgets
//! them. Server file ids are never reported as inode numbers.
//!
//! An open directory handle lists the directory once and pages the kernel
//! through that listing; the inodes it handed out without a lookup are
//! dropped again when the handle is released.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr as FuserAttr, FileType as FuserFileType, Filesystem, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use nfspoof_core::path::{self, ROOT};
use nfspoof_core::{
    Attributes, FileType, MountConfig, SetAttributes, SetTime, Timestamp, MAX_FILENAME_LEN,
};

use crate::bridge::FsBridge;
use crate::fs::FsError;

/// Root inode (FUSE convention)
pub const ROOT_INODE: u64 = 1;

/// Kernel attribute/entry cache lifetime
const TTL: Duration = Duration::from_secs(1);

struct InodeEntry {
    path: String,
    nlookup: u64,
}

struct Inodes {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<String, u64>,
    next: u64,
}

/// Inode ↔ path mapping with kernel lookup counts
pub struct InodeTable {
    inner: RwLock<Inodes>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                path: ROOT.to_string(),
                nlookup: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(ROOT.to_string(), ROOT_INODE);
        Self {
            inner: RwLock::new(Inodes {
                by_ino,
                by_path,
                next: ROOT_INODE + 1,
            }),
        }
    }

    pub fn path(&self, ino: u64) -> Option<String> {
        self.inner.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Inode for `path`, counting one kernel reference
    pub fn lookup(&self, path: &str) -> u64 {
        self.get_or_insert(path, 1)
    }

    /// Inode for `path` if it already has one
    pub fn existing(&self, path: &str) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Inode for `path` without a kernel reference (readdir)
    ///
    /// Released by [`release_unreferenced`](Self::release_unreferenced) unless
    /// a lookup takes a reference first.
    pub fn peek(&self, path: &str) -> u64 {
        self.get_or_insert(path, 0)
    }

    fn get_or_insert(&self, path: &str, references: u64) -> u64 {
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.nlookup += references;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                nlookup: references,
            },
        );
        inner.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Drop `count` kernel references; the inode goes away at zero
    pub fn forget(&self, ino: u64, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.write();
        let remove = match inner.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(count);
                entry.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inner.by_ino.remove(&ino) {
                if inner.by_path.get(&entry.path) == Some(&ino) {
                    inner.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Drop the inodes of `dir`'s children that the kernel holds no reference to
    pub fn release_unreferenced(&self, dir: &str) {
        let mut inner = self.inner.write();
        let Inodes { by_ino, by_path, .. } = &mut *inner;
        by_ino.retain(|&ino, entry| {
            let listed_only = ino != ROOT_INODE
                && entry.nlookup == 0
                && path::split_parent(&entry.path).is_some_and(|(parent, _)| parent == dir);
            if listed_only && by_path.get(&entry.path) == Some(&ino) {
                by_path.remove(&entry.path);
            }
            !listed_only
        });
    }

    /// Detach `path` (and below) from the table; inodes live on until forgotten
    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.write();
        inner.by_path.retain(|p, _| !path::is_within(p, path));
    }

    /// Re-home every path under `from` to `to`
    pub fn rename(&self, from: &str, to: &str) {
        let mut inner = self.inner.write();
        inner.by_path.retain(|p, _| !path::is_within(p, to));
        let moved: Vec<(String, String, u64)> = inner
            .by_path
            .iter()
            .filter_map(|(old, &ino)| path::rebase(old, from, to).map(|new| (old.clone(), new, ino)))
            .collect();
        for (old, new, ino) in moved {
            inner.by_path.remove(&old);
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.path = new.clone();
            }
            inner.by_path.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn fuser_kind(kind: FileType) -> FuserFileType {
    match kind {
        FileType::Regular => FuserFileType::RegularFile,
        FileType::Directory => FuserFileType::Directory,
        FileType::Symlink => FuserFileType::Symlink,
        FileType::BlockDevice => FuserFileType::BlockDevice,
        FileType::CharDevice => FuserFileType::CharDevice,
        FileType::Socket => FuserFileType::Socket,
        FileType::Fifo => FuserFileType::NamedPipe,
    }
}

fn to_fuser_attr(ino: u64, attrs: &Attributes) -> FuserAttr {
    let (major, minor) = attrs.rdev;
    FuserAttr {
        ino,
        size: attrs.size,
        blocks: attrs.used.div_ceil(512),
        atime: attrs.atime.to_system_time(),
        mtime: attrs.mtime.to_system_time(),
        ctime: attrs.ctime.to_system_time(),
        crtime: attrs.ctime.to_system_time(),
        kind: fuser_kind(attrs.kind),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: (major << 8) | (minor & 0xff),
        blksize: 4096,
        flags: 0,
    }
}

fn set_time(time: TimeOrNow) -> SetTime {
    match time {
        TimeOrNow::Now => SetTime::ServerNow,
        TimeOrNow::SpecificTime(t) => SetTime::Client(Timestamp::from_system_time(t)),
    }
}

/// Everything one kernel setattr asks for, sent as a single SETATTR
fn requested_changes(
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> SetAttributes {
    SetAttributes {
        mode,
        uid,
        gid,
        size,
        atime: atime.map(set_time),
        mtime: mtime.map(set_time),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct DirSlot {
    ino: u64,
    kind: FuserFileType,
    name: String,
}

struct OpenDir {
    path: String,
    listing: Option<Vec<DirSlot>>,
}

/// The mounted filesystem as the kernel sees it
pub struct SpoofFuse {
    bridge: FsBridge,
    inodes: InodeTable,
    dirs: HashMap<u64, OpenDir>,
    next_fh: u64,
}

impl SpoofFuse {
    pub fn new(bridge: FsBridge) -> Self {
        Self {
            bridge,
            inodes: InodeTable::new(),
            dirs: HashMap::new(),
            next_fh: 1,
        }
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        path::validate_filename(name).map_err(|e| e.to_errno())?;
        Ok(path::join(&self.path_of(parent)?, name))
    }

    fn reply_entry(&self, path: &str, result: Result<Attributes, FsError>, reply: ReplyEntry) {
        match result {
            Ok(attrs) => {
                let ino = self.inodes.lookup(path);
                reply.entry(&TTL, &to_fuser_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn reply_attr(&self, ino: u64, result: Result<Attributes, FsError>, reply: ReplyAttr) {
        match result {
            Ok(attrs) => reply.attr(&TTL, &to_fuser_attr(ino, &attrs)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn reply_empty(result: Result<(), FsError>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open_dir(&mut self, path: String) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.dirs.insert(fh, OpenDir { path, listing: None });
        fh
    }

    fn close_dir(&mut self, fh: u64) {
        let Some(dir) = self.dirs.remove(&fh) else {
            return;
        };
        if !self.dirs.values().any(|other| other.path == dir.path) {
            self.inodes.release_unreferenced(&dir.path);
        }
    }

    /// `.`, `..` and the server's entries for the directory at `path`
    fn list(&self, ino: u64, path: &str) -> Result<Vec<DirSlot>, i32> {
        let entries = self.bridge.readdir(path).map_err(|e| e.to_errno())?;
        let parent_ino = match path::split_parent(path) {
            Some((parent, _)) => self.inodes.existing(parent).unwrap_or(ROOT_INODE),
            None => ROOT_INODE,
        };
        let mut listing = vec![
            DirSlot {
                ino,
                kind: FuserFileType::Directory,
                name: ".".to_string(),
            },
            DirSlot {
                ino: parent_ino,
                kind: FuserFileType::Directory,
                name: "..".to_string(),
            },
        ];
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.name.len() > MAX_FILENAME_LEN || entry.name.contains('/') {
                warn!("skipping unusable entry name in {}: {:?}", path, entry.name);
                continue;
            }
            let child = path::join(path, &entry.name);
            listing.push(DirSlot {
                ino: self.inodes.peek(&child),
                kind: fuser_kind(entry.kind),
                name: entry.name,
            });
        }
        Ok(listing)
    }

    /// Listing behind an open directory handle
    ///
    /// The directory is listed again only when the handle has no listing yet
    /// or the kernel starts over from offset 0.
    fn dir_listing(&mut self, ino: u64, fh: u64, offset: i64) -> Result<&[DirSlot], i32> {
        let path = self.path_of(ino)?;
        let listed = offset > 0 && self.dirs.get(&fh).is_some_and(|dir| dir.listing.is_some());
        if !listed {
            let listing = self.list(ino, &path)?;
            debug!("listed {} for handle {}: {} entries", path, fh, listing.len());
            self.dirs
                .entry(fh)
                .or_insert_with(|| OpenDir {
                    path,
                    listing: None,
                })
                .listing = Some(listing);
        }
        Ok(self
            .dirs
            .get(&fh)
            .and_then(|dir| dir.listing.as_deref())
            .unwrap_or(&[]))
    }
}

/// Shorthand: evaluate to the value or answer the reply with an errno
macro_rules! try_reply {
    ($expr:expr, $reply:ident) => {
        match $expr {
            Ok(value) => value,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

impl Filesystem for SpoofFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(self.child_path(parent, name), reply);
        trace!("lookup: {}", path);
        let result = self.bridge.getattr(&path);
        self.reply_entry(&path, result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = try_reply!(self.path_of(ino), reply);
        let result = self.bridge.getattr(&path);
        self.reply_attr(ino, result, reply);
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = try_reply!(self.path_of(ino), reply);
        debug!(
            "setattr: {} mode={:?} uid={:?} gid={:?} size={:?}",
            path, mode, uid, gid, size
        );

        let changes = requested_changes(mode, uid, gid, size, atime, mtime);
        let result = if changes.is_empty() {
            self.bridge.getattr(&path)
        } else {
            self.bridge.setattr(&path, changes)
        };
        self.reply_attr(ino, result, reply);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = try_reply!(self.path_of(ino), reply);
        match self.bridge.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(self.child_path(parent, name), reply);
        debug!("mkdir: {} mode={:o}", path, mode);
        let result = self.bridge.mkdir(&path, mode & !umask);
        self.reply_entry(&path, result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(self.child_path(parent, name), reply);
        debug!("unlink: {}", path);
        let result = self.bridge.unlink(&path);
        if result.is_ok() {
            self.inodes.remove(&path);
        }
        Self::reply_empty(result, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(self.child_path(parent, name), reply);
        debug!("rmdir: {}", path);
        let result = self.bridge.rmdir(&path);
        if result.is_ok() {
            self.inodes.remove(&path);
        }
        Self::reply_empty(result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(self.child_path(parent, link_name), reply);
        let target = try_reply!(target.to_str().ok_or(libc::EINVAL), reply);
        debug!("symlink: {} -> {}", path, target);
        let result = self.bridge.symlink(&path, target);
        self.reply_entry(&path, result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE have no NFS equivalent
            reply.error(libc::EINVAL);
            return;
        }
        let from = try_reply!(self.child_path(parent, name), reply);
        let to = try_reply!(self.child_path(newparent, newname), reply);
        debug!("rename: {} -> {}", from, to);
        let result = self.bridge.rename(&from, &to);
        if result.is_ok() {
            self.inodes.rename(&from, &to);
        }
        Self::reply_empty(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = try_reply!(self.path_of(ino), reply);
        match self.bridge.open(&path, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = try_reply!(self.path_of(ino), reply);
        let offset = try_reply!(u64::try_from(offset).map_err(|_| libc::EINVAL), reply);
        trace!("read: {} offset={} size={}", path, offset, size);
        match self.bridge.read(&path, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = try_reply!(self.path_of(ino), reply);
        let offset = try_reply!(u64::try_from(offset).map_err(|_| libc::EINVAL), reply);
        trace!("write: {} offset={} size={}", path, offset, data.len());
        match self.bridge.write(&path, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(self.path_of(ino), reply);
        Self::reply_empty(self.bridge.release(&path), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = try_reply!(self.path_of(ino), reply);
        let fh = self.open_dir(path);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = try_reply!(self.dir_listing(ino, fh, offset), reply);
        let skip = usize::try_from(offset).unwrap_or(0);
        for (index, slot) in listing.iter().enumerate().skip(skip) {
            if reply.add(slot.ino, (index + 1) as i64, slot.kind, &slot.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.close_dir(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| ROOT.to_string());
        match self.bridge.statfs(&path) {
            Ok(stats) => {
                let bsize = stats.block_size.max(1);
                reply.statfs(
                    stats.total_bytes / u64::from(bsize),
                    stats.free_bytes / u64::from(bsize),
                    stats.avail_bytes / u64::from(bsize),
                    stats.total_files,
                    stats.free_files,
                    bsize,
                    MAX_FILENAME_LEN as u32,
                    bsize,
                );
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(self.child_path(parent, name), reply);
        debug!("create: {} mode={:o}", path, mode);
        match self.bridge.create(&path, mode & !umask) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&TTL, &to_fuser_attr(ino, &attrs), 0, 0, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn destroy(&mut self) {
        debug!("filesystem destroyed, stopping bridge");
        self.bridge.shutdown();
    }
}

/// fuser mount options for a configured mount
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("nfspoof".to_string()),
        MountOption::Subtype("nfspoof".to_string()),
        MountOption::AutoUnmount,
    ];
    if config.read_only {
        options.push(MountOption::RO);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}
