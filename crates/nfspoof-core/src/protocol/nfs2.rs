//! NFS version 2 (RFC 1094) argument and result layouts
//!
//! Sizes, offsets and file ids are 32-bit on the wire. Values that do not
//! fit are rejected with [`XdrError::OutOfRange`] rather than truncated.

use bytes::Bytes;

use super::NfsResult;
use crate::error::XdrError;
use crate::types::{
    Attributes, DirEntry, DirPage, FileHandle, FileType, FsStats, SetAttributes, SetTime,
    Timestamp,
};
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

pub const PROGRAM: u32 = 100003;
pub const VERSION: u32 = 2;

/// Fixed handle size (`FHSIZE`)
pub const FHSIZE: usize = 32;

/// Largest READ/WRITE payload (`MAXDATA`)
pub const MAXDATA: usize = 8192;

pub const MAXNAMLEN: usize = 255;
pub const MAXPATHLEN: usize = 1024;

/// Attribute block size reported for `blocks`
const BLOCK_SIZE: u32 = 512;

/// Marks an unset `sattr` field
const UNSET: u32 = u32::MAX;

/// `useconds` value asking the server to use its own clock
const SERVER_TIME_USEC: u32 = 1_000_000;

pub mod proc {
    pub const NULL: u32 = 0;
    pub const GETATTR: u32 = 1;
    pub const SETATTR: u32 = 2;
    pub const ROOT: u32 = 3;
    pub const LOOKUP: u32 = 4;
    pub const READLINK: u32 = 5;
    pub const READ: u32 = 6;
    pub const WRITECACHE: u32 = 7;
    pub const WRITE: u32 = 8;
    pub const CREATE: u32 = 9;
    pub const REMOVE: u32 = 10;
    pub const RENAME: u32 = 11;
    pub const LINK: u32 = 12;
    pub const SYMLINK: u32 = 13;
    pub const MKDIR: u32 = 14;
    pub const RMDIR: u32 = 15;
    pub const READDIR: u32 = 16;
    pub const STATFS: u32 = 17;
}

fn narrow(field: &'static str, value: u64) -> Result<u32, XdrError> {
    u32::try_from(value).map_err(|_| XdrError::OutOfRange { field, value })
}

fn put_handle(encoder: &mut Encoder, handle: &FileHandle) -> Result<(), XdrError> {
    if handle.len() != FHSIZE {
        return Err(XdrError::LengthMismatch {
            field: "fhandle",
            len: handle.len(),
            expected: FHSIZE,
        });
    }
    encoder.put_fixed_opaque(handle.as_bytes());
    Ok(())
}

fn get_handle(decoder: &mut Decoder<'_>) -> Result<FileHandle, XdrError> {
    let raw = decoder.get_fixed_opaque(FHSIZE)?;
    Ok(FileHandle::new(Bytes::copy_from_slice(raw)))
}

fn put_timeval(encoder: &mut Encoder, time: Timestamp) {
    encoder.put_u32(time.seconds);
    encoder.put_u32(time.nanos / 1000);
}

fn get_timeval(decoder: &mut Decoder<'_>) -> Result<Timestamp, XdrError> {
    let seconds = decoder.get_u32()?;
    let usec = decoder.get_u32()?;
    Ok(Timestamp::new(seconds, usec.saturating_mul(1000)))
}

fn file_type_code(kind: FileType) -> u32 {
    match kind {
        FileType::Regular => 1,
        FileType::Directory => 2,
        FileType::BlockDevice => 3,
        FileType::CharDevice => 4,
        FileType::Symlink => 5,
        FileType::Socket => 6,
        FileType::Fifo => 8,
    }
}

fn file_type_from_code(code: u32) -> Result<FileType, XdrError> {
    Ok(match code {
        1 => FileType::Regular,
        2 => FileType::Directory,
        3 => FileType::BlockDevice,
        4 => FileType::CharDevice,
        5 => FileType::Symlink,
        6 => FileType::Socket,
        8 => FileType::Fifo,
        value => {
            return Err(XdrError::InvalidDiscriminant {
                what: "ftype",
                value,
            })
        }
    })
}

/// `fhandle`: exactly 32 bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fh2(pub FileHandle);

impl ToXdr for Fh2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.0)
    }
}

impl FromXdr for Fh2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(get_handle(decoder)?))
    }
}

/// `fattr`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fattr2(pub Attributes);

impl ToXdr for Fattr2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        let a = &self.0;
        encoder.put_u32(file_type_code(a.kind));
        encoder.put_u32(a.mode);
        encoder.put_u32(a.nlink);
        encoder.put_u32(a.uid);
        encoder.put_u32(a.gid);
        encoder.put_u32(narrow("size", a.size)?);
        encoder.put_u32(BLOCK_SIZE);
        encoder.put_u32((a.rdev.0 << 8) | (a.rdev.1 & 0xff));
        encoder.put_u32(narrow("blocks", a.used.div_ceil(u64::from(BLOCK_SIZE)))?);
        encoder.put_u32(narrow("fsid", a.fsid)?);
        encoder.put_u32(narrow("fileid", a.fileid)?);
        put_timeval(encoder, a.atime);
        put_timeval(encoder, a.mtime);
        put_timeval(encoder, a.ctime);
        Ok(())
    }
}

impl FromXdr for Fattr2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let kind = file_type_from_code(decoder.get_u32()?)?;
        let mode = decoder.get_u32()? & 0o7777;
        let nlink = decoder.get_u32()?;
        let uid = decoder.get_u32()?;
        let gid = decoder.get_u32()?;
        let size = u64::from(decoder.get_u32()?);
        let blocksize = u64::from(decoder.get_u32()?);
        let rdev = decoder.get_u32()?;
        let blocks = u64::from(decoder.get_u32()?);
        Ok(Self(Attributes {
            kind,
            mode,
            nlink,
            uid,
            gid,
            size,
            used: blocks * blocksize,
            rdev: (rdev >> 8, rdev & 0xff),
            fsid: u64::from(decoder.get_u32()?),
            fileid: u64::from(decoder.get_u32()?),
            atime: get_timeval(decoder)?,
            mtime: get_timeval(decoder)?,
            ctime: get_timeval(decoder)?,
        }))
    }
}

/// `sattr`; every unset field is sent as all-ones
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sattr2(pub SetAttributes);

fn put_set_time(encoder: &mut Encoder, time: Option<SetTime>) {
    match time {
        None => {
            encoder.put_u32(UNSET);
            encoder.put_u32(UNSET);
        }
        Some(SetTime::ServerNow) => {
            encoder.put_u32(Timestamp::now().seconds);
            encoder.put_u32(SERVER_TIME_USEC);
        }
        Some(SetTime::Client(t)) => put_timeval(encoder, t),
    }
}

fn get_set_time(decoder: &mut Decoder<'_>) -> Result<Option<SetTime>, XdrError> {
    let seconds = decoder.get_u32()?;
    let usec = decoder.get_u32()?;
    Ok(match (seconds, usec) {
        (UNSET, UNSET) => None,
        (_, SERVER_TIME_USEC) => Some(SetTime::ServerNow),
        (seconds, usec) => Some(SetTime::Client(Timestamp::new(
            seconds,
            usec.saturating_mul(1000),
        ))),
    })
}

fn get_settable(decoder: &mut Decoder<'_>) -> Result<Option<u32>, XdrError> {
    Ok(match decoder.get_u32()? {
        UNSET => None,
        value => Some(value),
    })
}

impl ToXdr for Sattr2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        let s = &self.0;
        encoder.put_u32(s.mode.unwrap_or(UNSET));
        encoder.put_u32(s.uid.unwrap_or(UNSET));
        encoder.put_u32(s.gid.unwrap_or(UNSET));
        let size = match s.size {
            Some(size) if size >= u64::from(UNSET) => {
                return Err(XdrError::OutOfRange {
                    field: "size",
                    value: size,
                })
            }
            Some(size) => size as u32,
            None => UNSET,
        };
        encoder.put_u32(size);
        put_set_time(encoder, s.atime);
        put_set_time(encoder, s.mtime);
        Ok(())
    }
}

impl FromXdr for Sattr2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(SetAttributes {
            mode: get_settable(decoder)?,
            uid: get_settable(decoder)?,
            gid: get_settable(decoder)?,
            size: get_settable(decoder)?.map(u64::from),
            atime: get_set_time(decoder)?,
            mtime: get_set_time(decoder)?,
        }))
    }
}

/// `diropargs`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirOpArgs2 {
    pub dir: FileHandle,
    pub name: String,
}

impl ToXdr for DirOpArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.dir)?;
        encoder.put_string_bounded(&self.name, MAXNAMLEN, "filename")
    }
}

impl FromXdr for DirOpArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir: get_handle(decoder)?,
            name: decoder.get_string_bounded(MAXNAMLEN, "filename")?,
        })
    }
}

/// GETATTR, SETATTR and WRITE result
pub type AttrStat = NfsResult<Fattr2>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetAttrArgs2 {
    pub file: FileHandle,
    pub attributes: SetAttributes,
}

impl ToXdr for SetAttrArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        Sattr2(self.attributes.clone()).encode(encoder)
    }
}

impl FromXdr for SetAttrArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            file: get_handle(decoder)?,
            attributes: Sattr2::decode(decoder)?.0,
        })
    }
}

/// `diropres` success body (LOOKUP, CREATE, MKDIR)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirOpOk2 {
    pub file: FileHandle,
    pub attributes: Attributes,
}

impl ToXdr for DirOpOk2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        Fattr2(self.attributes.clone()).encode(encoder)
    }
}

impl FromXdr for DirOpOk2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            file: get_handle(decoder)?,
            attributes: Fattr2::decode(decoder)?.0,
        })
    }
}

pub type DirOpRes2 = NfsResult<DirOpOk2>;

/// `path` result of READLINK
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path2(pub String);

impl ToXdr for Path2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_string_bounded(&self.0, MAXPATHLEN, "path")
    }
}

impl FromXdr for Path2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let raw = decoder.get_opaque_bounded(MAXPATHLEN, "path")?;
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }
}

pub type ReadLinkRes2 = NfsResult<Path2>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadArgs2 {
    pub file: FileHandle,
    pub offset: u32,
    pub count: u32,
    /// Unused by servers
    pub total_count: u32,
}

impl ToXdr for ReadArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        encoder.put_u32(self.offset);
        encoder.put_u32(self.count);
        encoder.put_u32(self.total_count);
        Ok(())
    }
}

impl FromXdr for ReadArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            file: get_handle(decoder)?,
            offset: decoder.get_u32()?,
            count: decoder.get_u32()?,
            total_count: decoder.get_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOk2 {
    pub attributes: Attributes,
    pub data: Bytes,
}

impl ToXdr for ReadOk2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        Fattr2(self.attributes.clone()).encode(encoder)?;
        encoder.put_opaque_bounded(&self.data, MAXDATA, "nfsdata")
    }
}

impl FromXdr for ReadOk2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            attributes: Fattr2::decode(decoder)?.0,
            data: Bytes::copy_from_slice(decoder.get_opaque_bounded(MAXDATA, "nfsdata")?),
        })
    }
}

pub type ReadRes2 = NfsResult<ReadOk2>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteArgs2 {
    pub file: FileHandle,
    /// Unused by servers
    pub begin_offset: u32,
    pub offset: u32,
    /// Unused by servers
    pub total_count: u32,
    pub data: Bytes,
}

impl ToXdr for WriteArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        encoder.put_u32(self.begin_offset);
        encoder.put_u32(self.offset);
        encoder.put_u32(self.total_count);
        encoder.put_opaque_bounded(&self.data, MAXDATA, "nfsdata")
    }
}

impl FromXdr for WriteArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            file: get_handle(decoder)?,
            begin_offset: decoder.get_u32()?,
            offset: decoder.get_u32()?,
            total_count: decoder.get_u32()?,
            data: Bytes::copy_from_slice(decoder.get_opaque_bounded(MAXDATA, "nfsdata")?),
        })
    }
}

/// CREATE and MKDIR arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateArgs2 {
    pub place: DirOpArgs2,
    pub attributes: SetAttributes,
}

impl ToXdr for CreateArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.place.encode(encoder)?;
        Sattr2(self.attributes.clone()).encode(encoder)
    }
}

impl FromXdr for CreateArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            place: DirOpArgs2::decode(decoder)?,
            attributes: Sattr2::decode(decoder)?.0,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameArgs2 {
    pub from: DirOpArgs2,
    pub to: DirOpArgs2,
}

impl ToXdr for RenameArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.from.encode(encoder)?;
        self.to.encode(encoder)
    }
}

impl FromXdr for RenameArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            from: DirOpArgs2::decode(decoder)?,
            to: DirOpArgs2::decode(decoder)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymlinkArgs2 {
    pub place: DirOpArgs2,
    pub target: String,
    pub attributes: SetAttributes,
}

impl ToXdr for SymlinkArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.place.encode(encoder)?;
        encoder.put_string_bounded(&self.target, MAXPATHLEN, "path")?;
        Sattr2(self.attributes.clone()).encode(encoder)
    }
}

impl FromXdr for SymlinkArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            place: DirOpArgs2::decode(decoder)?,
            target: decoder.get_string_bounded(MAXPATHLEN, "path")?,
            attributes: Sattr2::decode(decoder)?.0,
        })
    }
}

/// REMOVE, RMDIR, RENAME and SYMLINK result
pub type StatRes = NfsResult<()>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDirArgs2 {
    pub dir: FileHandle,
    pub cookie: u32,
    pub count: u32,
}

impl ToXdr for ReadDirArgs2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.dir)?;
        encoder.put_u32(self.cookie);
        encoder.put_u32(self.count);
        Ok(())
    }
}

impl FromXdr for ReadDirArgs2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir: get_handle(decoder)?,
            cookie: decoder.get_u32()?,
            count: decoder.get_u32()?,
        })
    }
}

/// `entry`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry2(pub DirEntry);

impl ToXdr for Entry2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(narrow("fileid", self.0.fileid)?);
        encoder.put_string_bounded(&self.0.name, MAXNAMLEN, "filename")?;
        encoder.put_u32(narrow("cookie", self.0.cookie)?);
        Ok(())
    }
}

impl FromXdr for Entry2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let fileid = u64::from(decoder.get_u32()?);
        let raw = decoder.get_opaque_bounded(MAXNAMLEN, "filename")?;
        Ok(Self(DirEntry {
            fileid,
            name: String::from_utf8_lossy(raw).into_owned(),
            cookie: u64::from(decoder.get_u32()?),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDirOk2 {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

impl ReadDirOk2 {
    pub fn into_page(self) -> DirPage {
        DirPage {
            entries: self.entries,
            cookie_verifier: [0; 8],
            eof: self.eof,
        }
    }
}

impl ToXdr for ReadDirOk2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        let entries: Vec<Entry2> = self.entries.iter().cloned().map(Entry2).collect();
        encoder.put_list(&entries)?;
        encoder.put_bool(self.eof);
        Ok(())
    }
}

impl FromXdr for ReadDirOk2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            entries: decoder
                .get_list::<Entry2>()?
                .into_iter()
                .map(|e| e.0)
                .collect(),
            eof: decoder.get_bool()?,
        })
    }
}

pub type ReadDirRes2 = NfsResult<ReadDirOk2>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatFsOk2 {
    pub tsize: u32,
    pub bsize: u32,
    pub blocks: u32,
    pub bfree: u32,
    pub bavail: u32,
}

impl StatFsOk2 {
    /// NFSv2 has no inode counts; they are reported as zero
    pub fn into_stats(self) -> FsStats {
        let bsize = u64::from(self.bsize);
        FsStats {
            block_size: self.bsize,
            total_bytes: u64::from(self.blocks) * bsize,
            free_bytes: u64::from(self.bfree) * bsize,
            avail_bytes: u64::from(self.bavail) * bsize,
            ..FsStats::default()
        }
    }
}

impl ToXdr for StatFsOk2 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(self.tsize);
        encoder.put_u32(self.bsize);
        encoder.put_u32(self.blocks);
        encoder.put_u32(self.bfree);
        encoder.put_u32(self.bavail);
        Ok(())
    }
}

impl FromXdr for StatFsOk2 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            tsize: decoder.get_u32()?,
            bsize: decoder.get_u32()?,
            blocks: decoder.get_u32()?,
            bfree: decoder.get_u32()?,
            bavail: decoder.get_u32()?,
        })
    }
}

pub type StatFsRes2 = NfsResult<StatFsOk2>;
