//! Core type definitions shared by the protocol client and the bridge
//!
//! These types are version-neutral: the NFSv2 and NFSv3 codecs in
//! [`crate::protocol`] translate their own wire layouts into them.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::ProtocolError;

/// Negotiated NFS protocol version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NfsVersion {
    V2,
    V3,
}

impl NfsVersion {
    /// RPC program version number for the NFS program
    pub const fn number(self) -> u32 {
        match self {
            NfsVersion::V2 => 2,
            NfsVersion::V3 => 3,
        }
    }

    /// MOUNT program version paired with this NFS version
    pub const fn mount_version(self) -> u32 {
        match self {
            NfsVersion::V2 => 1,
            NfsVersion::V3 => 3,
        }
    }

    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            2 => Some(NfsVersion::V2),
            3 => Some(NfsVersion::V3),
            _ => None,
        }
    }

    /// Largest byte position addressable by this version
    pub const fn max_offset(self) -> u64 {
        match self {
            NfsVersion::V2 => u32::MAX as u64,
            NfsVersion::V3 => u64::MAX,
        }
    }

    /// Reject offsets/sizes the wire format cannot carry instead of truncating them
    pub fn check_range(self, offset: u64, len: u64) -> Result<(), ProtocolError> {
        let end = offset.checked_add(len).ok_or_else(|| {
            ProtocolError::VersionMismatch(format!("offset {} + length {} overflows", offset, len))
        })?;
        if end > self.max_offset() {
            return Err(ProtocolError::VersionMismatch(format!(
                "range {}..{} exceeds NFSv{} limit {}",
                offset,
                end,
                self.number(),
                self.max_offset()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for NfsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NFSv{}", self.number())
    }
}

/// Opaque server-issued file handle
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Bytes);

impl FileHandle {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
        Ok(Self(Bytes::from(hex::decode(cleaned)?)))
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", self.to_hex())
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Type of filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
}

/// Second/nanosecond timestamp as carried by NFS
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: u32,
    pub nanos: u32,
}

impl Timestamp {
    pub const fn new(seconds: u32, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(u64::from(self.seconds), self.nanos)
    }

    /// Times outside the 32-bit NFS range are clamped
    pub fn from_system_time(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: u32::try_from(since.as_secs()).unwrap_or(u32::MAX),
            nanos: since.subsec_nanos(),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }
}

/// File attributes, always sourced from the server
///
/// NFSv2 has no `used` field (filled with `blocks * blocksize`) and carries
/// microsecond times (converted to nanoseconds); its 32-bit size and fileid
/// are widened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub kind: FileType,
    /// Permission bits only (`0o7777`)
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub rdev: (u32, u32),
    pub fsid: u64,
    pub fileid: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// Attributes for a regular file owned by `uid:gid` (mostly for tests)
    pub fn file(fileid: u64, size: u64, uid: u32, gid: u32) -> Self {
        Self {
            kind: FileType::Regular,
            mode: 0o644,
            nlink: 1,
            uid,
            gid,
            size,
            used: size,
            rdev: (0, 0),
            fsid: 0,
            fileid,
            atime: Timestamp::default(),
            mtime: Timestamp::default(),
            ctime: Timestamp::default(),
        }
    }

    /// Attributes for a directory owned by `uid:gid` (mostly for tests)
    pub fn directory(fileid: u64, uid: u32, gid: u32) -> Self {
        Self {
            kind: FileType::Directory,
            mode: 0o755,
            nlink: 2,
            size: 4096,
            used: 4096,
            ..Self::file(fileid, 0, uid, gid)
        }
    }
}

/// How a SETATTR time field is set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetTime {
    ServerNow,
    Client(Timestamp),
}

/// Attribute changes for SETATTR / CREATE / MKDIR; `None` leaves a field unchanged
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttributes {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Handle plus (optional) attributes of a looked-up or created object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub handle: FileHandle,
    pub attributes: Option<Attributes>,
}

/// One READDIR entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub fileid: u64,
    pub cookie: u64,
}

/// One page of READDIR output
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    pub cookie_verifier: [u8; 8],
    pub eof: bool,
}

/// READ result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Bytes,
    pub eof: bool,
    pub attributes: Option<Attributes>,
}

/// WRITE result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub count: u32,
    pub attributes: Option<Attributes>,
}

/// Filesystem usage (STATFS / FSSTAT)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

/// Server transfer preferences (NFSv3 FSINFO)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub rtmax: u32,
    pub rtpref: u32,
    pub wtmax: u32,
    pub wtpref: u32,
    pub dtpref: u32,
    pub max_file_size: u64,
}
