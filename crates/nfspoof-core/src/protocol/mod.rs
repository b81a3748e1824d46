//! Wire structures for the portmapper, MOUNT and NFS programs
//!
//! Each program version lives in its own module and only exchanges
//! version-neutral types from [`crate::types`] with the rest of the crate,
//! so a client can never mix layouts from two versions.
//!
//! Status codes shared by MOUNT, NFSv2 and NFSv3 (the values are errno-like
//! and identical across the three) are defined here.

pub mod mount;
pub mod nfs2;
pub mod nfs3;
pub mod portmap;

use crate::error::{ProtocolError, XdrError};
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

/// NFS / MOUNT status codes
pub mod status {
    pub const OK: u32 = 0;
    pub const PERM: u32 = 1;
    pub const NOENT: u32 = 2;
    pub const IO: u32 = 5;
    pub const NXIO: u32 = 6;
    pub const ACCES: u32 = 13;
    pub const EXIST: u32 = 17;
    pub const XDEV: u32 = 18;
    pub const NODEV: u32 = 19;
    pub const NOTDIR: u32 = 20;
    pub const ISDIR: u32 = 21;
    pub const INVAL: u32 = 22;
    pub const FBIG: u32 = 27;
    pub const NOSPC: u32 = 28;
    pub const ROFS: u32 = 30;
    pub const MLINK: u32 = 31;
    pub const NAMETOOLONG: u32 = 63;
    pub const NOTEMPTY: u32 = 66;
    pub const DQUOT: u32 = 69;
    pub const STALE: u32 = 70;
    pub const REMOTE: u32 = 71;
    pub const WFLUSH: u32 = 99;
    pub const BADHANDLE: u32 = 10001;
    pub const NOT_SYNC: u32 = 10002;
    pub const BAD_COOKIE: u32 = 10003;
    pub const NOTSUPP: u32 = 10004;
    pub const TOOSMALL: u32 = 10005;
    pub const SERVERFAULT: u32 = 10006;
    pub const BADTYPE: u32 = 10007;
    pub const JUKEBOX: u32 = 10008;
}

/// Human-readable name of a status code
pub fn status_name(stat: u32) -> &'static str {
    use status::*;
    match stat {
        OK => "OK",
        PERM => "ERR_PERM",
        NOENT => "ERR_NOENT",
        IO => "ERR_IO",
        NXIO => "ERR_NXIO",
        ACCES => "ERR_ACCES",
        EXIST => "ERR_EXIST",
        XDEV => "ERR_XDEV",
        NODEV => "ERR_NODEV",
        NOTDIR => "ERR_NOTDIR",
        ISDIR => "ERR_ISDIR",
        INVAL => "ERR_INVAL",
        FBIG => "ERR_FBIG",
        NOSPC => "ERR_NOSPC",
        ROFS => "ERR_ROFS",
        MLINK => "ERR_MLINK",
        NAMETOOLONG => "ERR_NAMETOOLONG",
        NOTEMPTY => "ERR_NOTEMPTY",
        DQUOT => "ERR_DQUOT",
        STALE => "ERR_STALE",
        REMOTE => "ERR_REMOTE",
        WFLUSH => "ERR_WFLUSH",
        BADHANDLE => "ERR_BADHANDLE",
        NOT_SYNC => "ERR_NOT_SYNC",
        BAD_COOKIE => "ERR_BAD_COOKIE",
        NOTSUPP => "ERR_NOTSUPP",
        TOOSMALL => "ERR_TOOSMALL",
        SERVERFAULT => "ERR_SERVERFAULT",
        BADTYPE => "ERR_BADTYPE",
        JUKEBOX => "ERR_JUKEBOX",
        _ => "ERR_UNKNOWN",
    }
}

/// Map a non-OK status to the protocol error taxonomy
pub fn status_error(stat: u32) -> ProtocolError {
    use status::*;
    match stat {
        NOENT => ProtocolError::NotFound,
        PERM | ACCES => ProtocolError::AccessDenied,
        STALE | BADHANDLE => ProtocolError::StaleHandle,
        NOTSUPP => ProtocolError::NotSupported,
        other => ProtocolError::Io(format!("{} ({})", status_name(other), other)),
    }
}

/// A status-discriminated result union: `T` on OK, `F` otherwise
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NfsResult<T, F = ()> {
    Ok(T),
    Fail { status: u32, detail: F },
}

impl<T, F> NfsResult<T, F> {
    pub fn fail(status: u32, detail: F) -> Self {
        NfsResult::Fail { status, detail }
    }

    pub fn status(&self) -> u32 {
        match self {
            NfsResult::Ok(_) => status::OK,
            NfsResult::Fail { status, .. } => *status,
        }
    }

    pub fn into_result(self) -> Result<T, ProtocolError> {
        match self {
            NfsResult::Ok(value) => Ok(value),
            NfsResult::Fail { status, .. } => Err(status_error(status)),
        }
    }
}

impl<T: ToXdr, F: ToXdr> ToXdr for NfsResult<T, F> {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        match self {
            NfsResult::Ok(value) => {
                encoder.put_u32(status::OK);
                value.encode(encoder)
            }
            NfsResult::Fail { status, detail } => {
                encoder.put_u32(*status);
                detail.encode(encoder)
            }
        }
    }
}

impl<T: FromXdr, F: FromXdr> FromXdr for NfsResult<T, F> {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        match decoder.get_u32()? {
            status::OK => Ok(NfsResult::Ok(T::decode(decoder)?)),
            status => Ok(NfsResult::Fail {
                status,
                detail: F::decode(decoder)?,
            }),
        }
    }
}
