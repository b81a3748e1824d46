//! NFS version 3 (RFC 1813) argument and result layouts

use bytes::Bytes;

use super::NfsResult;
use crate::error::XdrError;
use crate::types::{
    Attributes, DirEntry, DirPage, FileHandle, FileType, FsInfo, FsStats, SetAttributes, SetTime,
    Timestamp,
};
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

pub const PROGRAM: u32 = 100003;
pub const VERSION: u32 = 3;

/// Maximum handle size (`NFS3_FHSIZE`)
pub const FHSIZE: usize = 64;

/// Size of cookie and write verifiers
pub const VERIFIER_SIZE: usize = 8;

pub mod proc {
    pub const NULL: u32 = 0;
    pub const GETATTR: u32 = 1;
    pub const SETATTR: u32 = 2;
    pub const LOOKUP: u32 = 3;
    pub const ACCESS: u32 = 4;
    pub const READLINK: u32 = 5;
    pub const READ: u32 = 6;
    pub const WRITE: u32 = 7;
    pub const CREATE: u32 = 8;
    pub const MKDIR: u32 = 9;
    pub const SYMLINK: u32 = 10;
    pub const MKNOD: u32 = 11;
    pub const REMOVE: u32 = 12;
    pub const RMDIR: u32 = 13;
    pub const RENAME: u32 = 14;
    pub const LINK: u32 = 15;
    pub const READDIR: u32 = 16;
    pub const READDIRPLUS: u32 = 17;
    pub const FSSTAT: u32 = 18;
    pub const FSINFO: u32 = 19;
    pub const PATHCONF: u32 = 20;
    pub const COMMIT: u32 = 21;
}

/// `stable_how`
pub mod stable {
    pub const UNSTABLE: u32 = 0;
    pub const DATA_SYNC: u32 = 1;
    pub const FILE_SYNC: u32 = 2;
}

fn put_handle(encoder: &mut Encoder, handle: &FileHandle) -> Result<(), XdrError> {
    encoder.put_opaque_bounded(handle.as_bytes(), FHSIZE, "nfs_fh3")
}

fn get_handle(decoder: &mut Decoder<'_>) -> Result<FileHandle, XdrError> {
    let raw = decoder.get_opaque_bounded(FHSIZE, "nfs_fh3")?;
    Ok(FileHandle::new(Bytes::copy_from_slice(raw)))
}

fn put_time(encoder: &mut Encoder, time: Timestamp) {
    encoder.put_u32(time.seconds);
    encoder.put_u32(time.nanos);
}

fn get_time(decoder: &mut Decoder<'_>) -> Result<Timestamp, XdrError> {
    Ok(Timestamp::new(decoder.get_u32()?, decoder.get_u32()?))
}

fn get_verifier(decoder: &mut Decoder<'_>) -> Result<[u8; VERIFIER_SIZE], XdrError> {
    let mut out = [0u8; VERIFIER_SIZE];
    out.copy_from_slice(decoder.get_fixed_opaque(VERIFIER_SIZE)?);
    Ok(out)
}

fn file_type_code(kind: FileType) -> u32 {
    match kind {
        FileType::Regular => 1,
        FileType::Directory => 2,
        FileType::BlockDevice => 3,
        FileType::CharDevice => 4,
        FileType::Symlink => 5,
        FileType::Socket => 6,
        FileType::Fifo => 7,
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
        7 => FileType::Fifo,
        value => {
            return Err(XdrError::InvalidDiscriminant {
                what: "ftype3",
                value,
            })
        }
    })
}

/// `nfs_fh3`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fh3(pub FileHandle);

impl ToXdr for Fh3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.0)
    }
}

impl FromXdr for Fh3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(get_handle(decoder)?))
    }
}

/// `fattr3`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fattr3(pub Attributes);

impl ToXdr for Fattr3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        let a = &self.0;
        encoder.put_u32(file_type_code(a.kind));
        encoder.put_u32(a.mode);
        encoder.put_u32(a.nlink);
        encoder.put_u32(a.uid);
        encoder.put_u32(a.gid);
        encoder.put_u64(a.size);
        encoder.put_u64(a.used);
        encoder.put_u32(a.rdev.0);
        encoder.put_u32(a.rdev.1);
        encoder.put_u64(a.fsid);
        encoder.put_u64(a.fileid);
        put_time(encoder, a.atime);
        put_time(encoder, a.mtime);
        put_time(encoder, a.ctime);
        Ok(())
    }
}

impl FromXdr for Fattr3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(Attributes {
            kind: file_type_from_code(decoder.get_u32()?)?,
            mode: decoder.get_u32()? & 0o7777,
            nlink: decoder.get_u32()?,
            uid: decoder.get_u32()?,
            gid: decoder.get_u32()?,
            size: decoder.get_u64()?,
            used: decoder.get_u64()?,
            rdev: (decoder.get_u32()?, decoder.get_u32()?),
            fsid: decoder.get_u64()?,
            fileid: decoder.get_u64()?,
            atime: get_time(decoder)?,
            mtime: get_time(decoder)?,
            ctime: get_time(decoder)?,
        }))
    }
}

/// `post_op_attr`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostOpAttr(pub Option<Attributes>);

impl ToXdr for PostOpAttr {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_optional(self.0.clone().map(Fattr3).as_ref())
    }
}

impl FromXdr for PostOpAttr {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(decoder.get_optional::<Fattr3>()?.map(|f| f.0)))
    }
}

/// `wcc_attr`: the attributes a server reports from before an update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WccAttr {
    pub size: u64,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl ToXdr for WccAttr {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u64(self.size);
        put_time(encoder, self.mtime);
        put_time(encoder, self.ctime);
        Ok(())
    }
}

impl FromXdr for WccAttr {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            size: decoder.get_u64()?,
            mtime: get_time(decoder)?,
            ctime: get_time(decoder)?,
        })
    }
}

/// `wcc_data`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WccData {
    pub before: Option<WccAttr>,
    pub after: Option<Attributes>,
}

impl WccData {
    pub fn after(attributes: Attributes) -> Self {
        Self {
            before: None,
            after: Some(attributes),
        }
    }
}

impl ToXdr for WccData {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_optional(self.before.as_ref())?;
        PostOpAttr(self.after.clone()).encode(encoder)
    }
}

impl FromXdr for WccData {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            before: decoder.get_optional()?,
            after: PostOpAttr::decode(decoder)?.0,
        })
    }
}

/// `sattr3`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sattr3(pub SetAttributes);

fn put_set_time(encoder: &mut Encoder, time: Option<SetTime>) {
    match time {
        None => encoder.put_u32(0),
        Some(SetTime::ServerNow) => encoder.put_u32(1),
        Some(SetTime::Client(t)) => {
            encoder.put_u32(2);
            put_time(encoder, t);
        }
    }
}

fn get_set_time(decoder: &mut Decoder<'_>) -> Result<Option<SetTime>, XdrError> {
    match decoder.get_u32()? {
        0 => Ok(None),
        1 => Ok(Some(SetTime::ServerNow)),
        2 => Ok(Some(SetTime::Client(get_time(decoder)?))),
        value => Err(XdrError::InvalidDiscriminant {
            what: "time_how",
            value,
        }),
    }
}

impl ToXdr for Sattr3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        let s = &self.0;
        encoder.put_optional(s.mode.as_ref())?;
        encoder.put_optional(s.uid.as_ref())?;
        encoder.put_optional(s.gid.as_ref())?;
        encoder.put_optional(s.size.as_ref())?;
        put_set_time(encoder, s.atime);
        put_set_time(encoder, s.mtime);
        Ok(())
    }
}

impl FromXdr for Sattr3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(SetAttributes {
            mode: decoder.get_optional()?,
            uid: decoder.get_optional()?,
            gid: decoder.get_optional()?,
            size: decoder.get_optional()?,
            atime: get_set_time(decoder)?,
            mtime: get_set_time(decoder)?,
        }))
    }
}

/// `diropargs3`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirOpArgs3 {
    pub dir: FileHandle,
    pub name: String,
}

impl ToXdr for DirOpArgs3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.dir)?;
        encoder.put_string(&self.name)
    }
}

impl FromXdr for DirOpArgs3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir: get_handle(decoder)?,
            name: decoder.get_string()?,
        })
    }
}

// === GETATTR / SETATTR ===

pub type GetAttrRes = NfsResult<Fattr3>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetAttrArgs {
    pub object: FileHandle,
    pub attributes: SetAttributes,
    /// Only apply if the object's ctime still matches
    pub guard: Option<Timestamp>,
}

impl ToXdr for SetAttrArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.object)?;
        Sattr3(self.attributes.clone()).encode(encoder)?;
        match self.guard {
            Some(ctime) => {
                encoder.put_bool(true);
                put_time(encoder, ctime);
            }
            None => encoder.put_bool(false),
        }
        Ok(())
    }
}

impl FromXdr for SetAttrArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let object = get_handle(decoder)?;
        let attributes = Sattr3::decode(decoder)?.0;
        let guard = if decoder.get_bool()? {
            Some(get_time(decoder)?)
        } else {
            None
        };
        Ok(Self {
            object,
            attributes,
            guard,
        })
    }
}

pub type SetAttrRes = NfsResult<WccData, WccData>;

// === LOOKUP ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupOk {
    pub object: FileHandle,
    pub obj_attributes: Option<Attributes>,
    pub dir_attributes: Option<Attributes>,
}

impl ToXdr for LookupOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.object)?;
        PostOpAttr(self.obj_attributes.clone()).encode(encoder)?;
        PostOpAttr(self.dir_attributes.clone()).encode(encoder)
    }
}

impl FromXdr for LookupOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            object: get_handle(decoder)?,
            obj_attributes: PostOpAttr::decode(decoder)?.0,
            dir_attributes: PostOpAttr::decode(decoder)?.0,
        })
    }
}

pub type LookupRes = NfsResult<LookupOk, PostOpAttr>;

// === READLINK ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadLinkOk {
    pub attributes: Option<Attributes>,
    pub target: String,
}

impl ToXdr for ReadLinkOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        PostOpAttr(self.attributes.clone()).encode(encoder)?;
        encoder.put_string(&self.target)
    }
}

impl FromXdr for ReadLinkOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            attributes: PostOpAttr::decode(decoder)?.0,
            target: decoder.get_string_lossy()?,
        })
    }
}

pub type ReadLinkRes = NfsResult<ReadLinkOk, PostOpAttr>;

// === READ ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadArgs {
    pub file: FileHandle,
    pub offset: u64,
    pub count: u32,
}

impl ToXdr for ReadArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        encoder.put_u64(self.offset);
        encoder.put_u32(self.count);
        Ok(())
    }
}

impl FromXdr for ReadArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            file: get_handle(decoder)?,
            offset: decoder.get_u64()?,
            count: decoder.get_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOk {
    pub attributes: Option<Attributes>,
    pub count: u32,
    pub eof: bool,
    pub data: Bytes,
}

impl ToXdr for ReadOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        PostOpAttr(self.attributes.clone()).encode(encoder)?;
        encoder.put_u32(self.count);
        encoder.put_bool(self.eof);
        encoder.put_opaque(&self.data)
    }
}

impl FromXdr for ReadOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            attributes: PostOpAttr::decode(decoder)?.0,
            count: decoder.get_u32()?,
            eof: decoder.get_bool()?,
            data: Bytes::copy_from_slice(decoder.get_opaque()?),
        })
    }
}

pub type ReadRes = NfsResult<ReadOk, PostOpAttr>;

// === WRITE ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteArgs {
    pub file: FileHandle,
    pub offset: u64,
    pub count: u32,
    pub stable: u32,
    pub data: Bytes,
}

impl ToXdr for WriteArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.file)?;
        encoder.put_u64(self.offset);
        encoder.put_u32(self.count);
        encoder.put_u32(self.stable);
        encoder.put_opaque(&self.data)
    }
}

impl FromXdr for WriteArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let file = get_handle(decoder)?;
        let offset = decoder.get_u64()?;
        let count = decoder.get_u32()?;
        let stable = match decoder.get_u32()? {
            s @ (stable::UNSTABLE | stable::DATA_SYNC | stable::FILE_SYNC) => s,
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "stable_how",
                    value,
                })
            }
        };
        Ok(Self {
            file,
            offset,
            count,
            stable,
            data: Bytes::copy_from_slice(decoder.get_opaque()?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOk {
    pub wcc: WccData,
    pub count: u32,
    pub committed: u32,
    pub verifier: [u8; VERIFIER_SIZE],
}

impl ToXdr for WriteOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.wcc.encode(encoder)?;
        encoder.put_u32(self.count);
        encoder.put_u32(self.committed);
        encoder.put_fixed_opaque(&self.verifier);
        Ok(())
    }
}

impl FromXdr for WriteOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            wcc: WccData::decode(decoder)?,
            count: decoder.get_u32()?,
            committed: decoder.get_u32()?,
            verifier: get_verifier(decoder)?,
        })
    }
}

pub type WriteRes = NfsResult<WriteOk, WccData>;

// === CREATE / MKDIR / SYMLINK ===

/// `createhow3`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateHow {
    Unchecked(SetAttributes),
    Guarded(SetAttributes),
    Exclusive([u8; VERIFIER_SIZE]),
}

impl ToXdr for CreateHow {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        match self {
            CreateHow::Unchecked(attrs) => {
                encoder.put_u32(0);
                Sattr3(attrs.clone()).encode(encoder)
            }
            CreateHow::Guarded(attrs) => {
                encoder.put_u32(1);
                Sattr3(attrs.clone()).encode(encoder)
            }
            CreateHow::Exclusive(verf) => {
                encoder.put_u32(2);
                encoder.put_fixed_opaque(verf);
                Ok(())
            }
        }
    }
}

impl FromXdr for CreateHow {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        match decoder.get_u32()? {
            0 => Ok(CreateHow::Unchecked(Sattr3::decode(decoder)?.0)),
            1 => Ok(CreateHow::Guarded(Sattr3::decode(decoder)?.0)),
            2 => Ok(CreateHow::Exclusive(get_verifier(decoder)?)),
            value => Err(XdrError::InvalidDiscriminant {
                what: "createmode3",
                value,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateArgs {
    pub place: DirOpArgs3,
    pub how: CreateHow,
}

impl ToXdr for CreateArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.place.encode(encoder)?;
        self.how.encode(encoder)
    }
}

impl FromXdr for CreateArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            place: DirOpArgs3::decode(decoder)?,
            how: CreateHow::decode(decoder)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MkdirArgs {
    pub place: DirOpArgs3,
    pub attributes: SetAttributes,
}

impl ToXdr for MkdirArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.place.encode(encoder)?;
        Sattr3(self.attributes.clone()).encode(encoder)
    }
}

impl FromXdr for MkdirArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            place: DirOpArgs3::decode(decoder)?,
            attributes: Sattr3::decode(decoder)?.0,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymlinkArgs {
    pub place: DirOpArgs3,
    pub attributes: SetAttributes,
    pub target: String,
}

impl ToXdr for SymlinkArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.place.encode(encoder)?;
        Sattr3(self.attributes.clone()).encode(encoder)?;
        encoder.put_string(&self.target)
    }
}

impl FromXdr for SymlinkArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            place: DirOpArgs3::decode(decoder)?,
            attributes: Sattr3::decode(decoder)?.0,
            target: decoder.get_string()?,
        })
    }
}

/// Shared success body of CREATE, MKDIR and SYMLINK
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirOpOk {
    pub object: Option<FileHandle>,
    pub attributes: Option<Attributes>,
    pub dir_wcc: WccData,
}

impl ToXdr for DirOpOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_optional(self.object.clone().map(Fh3).as_ref())?;
        PostOpAttr(self.attributes.clone()).encode(encoder)?;
        self.dir_wcc.encode(encoder)
    }
}

impl FromXdr for DirOpOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            object: decoder.get_optional::<Fh3>()?.map(|f| f.0),
            attributes: PostOpAttr::decode(decoder)?.0,
            dir_wcc: WccData::decode(decoder)?,
        })
    }
}

pub type DirOpRes = NfsResult<DirOpOk, WccData>;

// === REMOVE / RMDIR / RENAME ===

pub type RemoveRes = NfsResult<WccData, WccData>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameArgs {
    pub from: DirOpArgs3,
    pub to: DirOpArgs3,
}

impl ToXdr for RenameArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.from.encode(encoder)?;
        self.to.encode(encoder)
    }
}

impl FromXdr for RenameArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            from: DirOpArgs3::decode(decoder)?,
            to: DirOpArgs3::decode(decoder)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenameWcc {
    pub from_dir: WccData,
    pub to_dir: WccData,
}

impl ToXdr for RenameWcc {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        self.from_dir.encode(encoder)?;
        self.to_dir.encode(encoder)
    }
}

impl FromXdr for RenameWcc {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            from_dir: WccData::decode(decoder)?,
            to_dir: WccData::decode(decoder)?,
        })
    }
}

pub type RenameRes = NfsResult<RenameWcc, RenameWcc>;

// === READDIR ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDirArgs {
    pub dir: FileHandle,
    pub cookie: u64,
    pub cookie_verifier: [u8; VERIFIER_SIZE],
    pub count: u32,
}

impl ToXdr for ReadDirArgs {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        put_handle(encoder, &self.dir)?;
        encoder.put_u64(self.cookie);
        encoder.put_fixed_opaque(&self.cookie_verifier);
        encoder.put_u32(self.count);
        Ok(())
    }
}

impl FromXdr for ReadDirArgs {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir: get_handle(decoder)?,
            cookie: decoder.get_u64()?,
            cookie_verifier: get_verifier(decoder)?,
            count: decoder.get_u32()?,
        })
    }
}

/// `entry3`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry3(pub DirEntry);

impl ToXdr for Entry3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u64(self.0.fileid);
        encoder.put_string(&self.0.name)?;
        encoder.put_u64(self.0.cookie);
        Ok(())
    }
}

impl FromXdr for Entry3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(DirEntry {
            fileid: decoder.get_u64()?,
            name: decoder.get_string_lossy()?,
            cookie: decoder.get_u64()?,
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDirOk {
    pub dir_attributes: Option<Attributes>,
    pub cookie_verifier: [u8; VERIFIER_SIZE],
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

impl ReadDirOk {
    pub fn into_page(self) -> DirPage {
        DirPage {
            entries: self.entries,
            cookie_verifier: self.cookie_verifier,
            eof: self.eof,
        }
    }
}

impl ToXdr for ReadDirOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        PostOpAttr(self.dir_attributes.clone()).encode(encoder)?;
        encoder.put_fixed_opaque(&self.cookie_verifier);
        let entries: Vec<Entry3> = self.entries.iter().cloned().map(Entry3).collect();
        encoder.put_list(&entries)?;
        encoder.put_bool(self.eof);
        Ok(())
    }
}

impl FromXdr for ReadDirOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir_attributes: PostOpAttr::decode(decoder)?.0,
            cookie_verifier: get_verifier(decoder)?,
            entries: decoder
                .get_list::<Entry3>()?
                .into_iter()
                .map(|e| e.0)
                .collect(),
            eof: decoder.get_bool()?,
        })
    }
}

pub type ReadDirRes = NfsResult<ReadDirOk, PostOpAttr>;

// === FSSTAT / FSINFO ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsStatOk {
    pub attributes: Option<Attributes>,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
    pub invarsec: u32,
}

impl FsStatOk {
    /// NFSv3 reports bytes; a 512-byte block size is assumed for block counts
    pub fn into_stats(self) -> FsStats {
        FsStats {
            block_size: 512,
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes,
            avail_bytes: self.avail_bytes,
            total_files: self.total_files,
            free_files: self.free_files,
            avail_files: self.avail_files,
        }
    }
}

impl ToXdr for FsStatOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        PostOpAttr(self.attributes.clone()).encode(encoder)?;
        encoder.put_u64(self.total_bytes);
        encoder.put_u64(self.free_bytes);
        encoder.put_u64(self.avail_bytes);
        encoder.put_u64(self.total_files);
        encoder.put_u64(self.free_files);
        encoder.put_u64(self.avail_files);
        encoder.put_u32(self.invarsec);
        Ok(())
    }
}

impl FromXdr for FsStatOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            attributes: PostOpAttr::decode(decoder)?.0,
            total_bytes: decoder.get_u64()?,
            free_bytes: decoder.get_u64()?,
            avail_bytes: decoder.get_u64()?,
            total_files: decoder.get_u64()?,
            free_files: decoder.get_u64()?,
            avail_files: decoder.get_u64()?,
            invarsec: decoder.get_u32()?,
        })
    }
}

pub type FsStatRes = NfsResult<FsStatOk, PostOpAttr>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfoOk {
    pub attributes: Option<Attributes>,
    pub rtmax: u32,
    pub rtpref: u32,
    pub rtmult: u32,
    pub wtmax: u32,
    pub wtpref: u32,
    pub wtmult: u32,
    pub dtpref: u32,
    pub max_file_size: u64,
    pub time_delta: Timestamp,
    pub properties: u32,
}

impl FsInfoOk {
    pub fn into_info(self) -> FsInfo {
        FsInfo {
            rtmax: self.rtmax,
            rtpref: self.rtpref,
            wtmax: self.wtmax,
            wtpref: self.wtpref,
            dtpref: self.dtpref,
            max_file_size: self.max_file_size,
        }
    }
}

impl ToXdr for FsInfoOk {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        PostOpAttr(self.attributes.clone()).encode(encoder)?;
        for v in [
            self.rtmax,
            self.rtpref,
            self.rtmult,
            self.wtmax,
            self.wtpref,
            self.wtmult,
            self.dtpref,
        ] {
            encoder.put_u32(v);
        }
        encoder.put_u64(self.max_file_size);
        put_time(encoder, self.time_delta);
        encoder.put_u32(self.properties);
        Ok(())
    }
}

impl FromXdr for FsInfoOk {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            attributes: PostOpAttr::decode(decoder)?.0,
            rtmax: decoder.get_u32()?,
            rtpref: decoder.get_u32()?,
            rtmult: decoder.get_u32()?,
            wtmax: decoder.get_u32()?,
            wtpref: decoder.get_u32()?,
            wtmult: decoder.get_u32()?,
            dtpref: decoder.get_u32()?,
            max_file_size: decoder.get_u64()?,
            time_delta: get_time(decoder)?,
            properties: decoder.get_u32()?,
        })
    }
}

pub type FsInfoRes = NfsResult<FsInfoOk, PostOpAttr>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;
    use crate::xdr::{from_bytes, to_bytes};

    fn sample_attrs() -> Attributes {
        Attributes {
            kind: FileType::Regular,
            mode: 0o640,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 1 << 33,
            used: 1 << 33,
            rdev: (0, 0),
            fsid: 0x1122_3344_5566_7788,
            fileid: 99,
            atime: Timestamp::new(1, 2),
            mtime: Timestamp::new(3, 4),
            ctime: Timestamp::new(5, 6),
        }
    }

    fn roundtrip<T: ToXdr + FromXdr + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = to_bytes(&value).unwrap();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(from_bytes::<T>(&bytes).unwrap(), value);
    }

    #[test]
    fn test_fattr3_is_84_bytes() {
        let bytes = to_bytes(&Fattr3(sample_attrs())).unwrap();
        assert_eq!(bytes.len(), 84);
    }

    #[test]
    fn test_lookup_roundtrip() {
        roundtrip(DirOpArgs3 {
            dir: FileHandle::new(vec![1, 2, 3]),
            name: "secret.txt".into(),
        });
        roundtrip(LookupRes::Ok(LookupOk {
            object: FileHandle::new(vec![9; 64]),
            obj_attributes: Some(sample_attrs()),
            dir_attributes: None,
        }));
        roundtrip(LookupRes::fail(status::ACCES, PostOpAttr(None)));
    }

    #[test]
    fn test_empty_handle_and_data_roundtrip() {
        roundtrip(ReadRes::Ok(ReadOk {
            attributes: None,
            count: 0,
            eof: true,
            data: Bytes::new(),
        }));
        roundtrip(WriteArgs {
            file: FileHandle::new(Vec::new()),
            offset: 0,
            count: 0,
            stable: stable::FILE_SYNC,
            data: Bytes::new(),
        });
    }

    #[test]
    fn test_oversized_handle_rejected() {
        let args = ReadArgs {
            file: FileHandle::new(vec![0; 65]),
            offset: 0,
            count: 1,
        };
        assert!(to_bytes(&args).is_err());
    }

    #[test]
    fn test_sattr_roundtrip() {
        roundtrip(Sattr3(SetAttributes::default()));
        roundtrip(Sattr3(SetAttributes {
            mode: Some(0o4755),
            uid: Some(0),
            gid: Some(0),
            size: Some(1 << 40),
            atime: Some(SetTime::ServerNow),
            mtime: Some(SetTime::Client(Timestamp::new(10, 20))),
        }));
    }

    #[test]
    fn test_create_and_dirop_roundtrip() {
        roundtrip(CreateArgs {
            place: DirOpArgs3 {
                dir: FileHandle::new(vec![1; 32]),
                name: "new".into(),
            },
            how: CreateHow::Guarded(SetAttributes::mode(0o600)),
        });
        roundtrip(CreateArgs {
            place: DirOpArgs3 {
                dir: FileHandle::new(vec![1; 32]),
                name: "excl".into(),
            },
            how: CreateHow::Exclusive([7; 8]),
        });
        roundtrip(DirOpRes::Ok(DirOpOk {
            object: Some(FileHandle::new(vec![2; 16])),
            attributes: Some(sample_attrs()),
            dir_wcc: WccData {
                before: Some(WccAttr {
                    size: 4096,
                    mtime: Timestamp::new(1, 0),
                    ctime: Timestamp::new(1, 0),
                }),
                after: None,
            },
        }));
    }

    #[test]
    fn test_readdir_roundtrip() {
        roundtrip(ReadDirRes::Ok(ReadDirOk {
            dir_attributes: None,
            cookie_verifier: [3; 8],
            entries: vec![
                DirEntry {
                    name: "a".into(),
                    fileid: 1,
                    cookie: 10,
                },
                DirEntry {
                    name: "bcdef".into(),
                    fileid: 2,
                    cookie: 20,
                },
            ],
            eof: true,
        }));
        roundtrip(ReadDirRes::Ok(ReadDirOk {
            dir_attributes: None,
            cookie_verifier: [0; 8],
            entries: vec![],
            eof: false,
        }));
    }

    #[test]
    fn test_write_and_rename_roundtrip() {
        roundtrip(WriteRes::Ok(WriteOk {
            wcc: WccData::after(sample_attrs()),
            count: 5,
            committed: stable::FILE_SYNC,
            verifier: [1, 2, 3, 4, 5, 6, 7, 8],
        }));
        roundtrip(RenameRes::fail(status::XDEV, RenameWcc::default()));
    }

    #[test]
    fn test_fsinfo_roundtrip() {
        roundtrip(FsInfoRes::Ok(FsInfoOk {
            attributes: None,
            rtmax: 1 << 20,
            rtpref: 1 << 16,
            rtmult: 4096,
            wtmax: 1 << 20,
            wtpref: 1 << 16,
            wtmult: 4096,
            dtpref: 4096,
            max_file_size: u64::MAX,
            time_delta: Timestamp::new(0, 1),
            properties: 0x1b,
        }));
    }

    #[test]
    fn test_bad_ftype_is_decode_error() {
        let mut bytes = to_bytes(&Fattr3(sample_attrs())).unwrap().to_vec();
        bytes[3] = 9;
        assert!(matches!(
            from_bytes::<Fattr3>(&bytes),
            Err(XdrError::InvalidDiscriminant { what: "ftype3", value: 9 })
        ));
    }
}
