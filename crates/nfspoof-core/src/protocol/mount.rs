//! MOUNT protocol v1 (RFC 1094 appendix A) and v3 (RFC 1813 appendix I)
//!
//! Both versions share procedures and argument layouts; only the MNT
//! result differs (fixed 32-byte handle vs. variable handle plus auth list).

use bytes::Bytes;

use super::NfsResult;
use crate::error::XdrError;
use crate::types::FileHandle;
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

pub const PROGRAM: u32 = 100005;
pub const VERSION_1: u32 = 1;
pub const VERSION_3: u32 = 3;

pub const MNTPATHLEN: usize = 1024;
pub const MNTNAMLEN: usize = 255;

const FHSIZE_V1: usize = 32;
const FHSIZE_V3: usize = 64;

pub mod proc {
    pub const NULL: u32 = 0;
    pub const MNT: u32 = 1;
    pub const DUMP: u32 = 2;
    pub const UMNT: u32 = 3;
    pub const UMNTALL: u32 = 4;
    pub const EXPORT: u32 = 5;
}

/// `dirpath`: MNT and UMNT argument
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirPath(pub String);

impl ToXdr for DirPath {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_string_bounded(&self.0, MNTPATHLEN, "dirpath")
    }
}

impl FromXdr for DirPath {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let raw = decoder.get_opaque_bounded(MNTPATHLEN, "dirpath")?;
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }
}

/// v1 `fhstatus` success body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOk1 {
    pub handle: FileHandle,
}

impl ToXdr for MountOk1 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        if self.handle.len() != FHSIZE_V1 {
            return Err(XdrError::LengthMismatch {
                field: "fhandle",
                len: self.handle.len(),
                expected: FHSIZE_V1,
            });
        }
        encoder.put_fixed_opaque(self.handle.as_bytes());
        Ok(())
    }
}

impl FromXdr for MountOk1 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let raw = decoder.get_fixed_opaque(FHSIZE_V1)?;
        Ok(Self {
            handle: FileHandle::new(Bytes::copy_from_slice(raw)),
        })
    }
}

pub type MountRes1 = NfsResult<MountOk1>;

/// v3 `mountres3_ok`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOk3 {
    pub handle: FileHandle,
    pub auth_flavors: Vec<u32>,
}

impl ToXdr for MountOk3 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_opaque_bounded(self.handle.as_bytes(), FHSIZE_V3, "fhandle3")?;
        encoder.put_array(&self.auth_flavors)
    }
}

impl FromXdr for MountOk3 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let raw = decoder.get_opaque_bounded(FHSIZE_V3, "fhandle3")?;
        Ok(Self {
            handle: FileHandle::new(Bytes::copy_from_slice(raw)),
            auth_flavors: decoder.get_array()?,
        })
    }
}

pub type MountRes3 = NfsResult<MountOk3>;

/// One exported directory and the client groups allowed to mount it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportNode {
    pub dir: String,
    pub groups: Vec<String>,
}

/// `name` inside a groups list
struct GroupName(String);

impl ToXdr for GroupName {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_string_bounded(&self.0, MNTNAMLEN, "name")
    }
}

impl FromXdr for GroupName {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let raw = decoder.get_opaque_bounded(MNTNAMLEN, "name")?;
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }
}

impl ToXdr for ExportNode {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        DirPath(self.dir.clone()).encode(encoder)?;
        let groups: Vec<GroupName> = self.groups.iter().cloned().map(GroupName).collect();
        encoder.put_list(&groups)
    }
}

impl FromXdr for ExportNode {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            dir: DirPath::decode(decoder)?.0,
            groups: decoder
                .get_list::<GroupName>()?
                .into_iter()
                .map(|g| g.0)
                .collect(),
        })
    }
}

/// EXPORT result
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportList(pub Vec<ExportNode>);

impl ToXdr for ExportList {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_list(&self.0)
    }
}

impl FromXdr for ExportList {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(decoder.get_list()?))
    }
}

/// One DUMP record: a client host and the directory it mounted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub hostname: String,
    pub directory: String,
}

impl ToXdr for MountEntry {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        GroupName(self.hostname.clone()).encode(encoder)?;
        DirPath(self.directory.clone()).encode(encoder)
    }
}

impl FromXdr for MountEntry {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            hostname: GroupName::decode(decoder)?.0,
            directory: DirPath::decode(decoder)?.0,
        })
    }
}

/// DUMP result
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountList(pub Vec<MountEntry>);

impl ToXdr for MountList {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_list(&self.0)
    }
}

impl FromXdr for MountList {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self(decoder.get_list()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;
    use crate::xdr::{from_bytes, to_bytes};

    #[test]
    fn test_dirpath_limit() {
        assert!(to_bytes(&DirPath("/".repeat(MNTPATHLEN))).is_ok());
        assert!(to_bytes(&DirPath("/".repeat(MNTPATHLEN + 1))).is_err());
    }

    #[test]
    fn test_v1_fhstatus() {
        let ok = MountRes1::Ok(MountOk1 {
            handle: FileHandle::new(vec![5; 32]),
        });
        let bytes = to_bytes(&ok).unwrap();
        assert_eq!(bytes.len(), 36);
        assert_eq!(from_bytes::<MountRes1>(&bytes).unwrap(), ok);

        let denied = to_bytes(&MountRes1::fail(status::ACCES, ())).unwrap();
        assert_eq!(
            from_bytes::<MountRes1>(&denied).unwrap().into_result(),
            Err(crate::error::ProtocolError::AccessDenied)
        );
    }

    #[test]
    fn test_v3_mountres() {
        let ok = MountRes3::Ok(MountOk3 {
            handle: FileHandle::new(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            auth_flavors: vec![1],
        });
        let bytes = to_bytes(&ok).unwrap();
        // status + len + 8 handle bytes + count + one flavor
        assert_eq!(bytes.len(), 4 + 4 + 8 + 4 + 4);
        assert_eq!(from_bytes::<MountRes3>(&bytes).unwrap(), ok);
    }

    #[test]
    fn test_export_list() {
        let list = ExportList(vec![
            ExportNode {
                dir: "/srv/home".into(),
                groups: vec!["10.0.0.0/8".into(), "trusted".into()],
            },
            ExportNode {
                dir: "/pub".into(),
                groups: vec![],
            },
        ]);
        let bytes = to_bytes(&list).unwrap();
        assert_eq!(from_bytes::<ExportList>(&bytes).unwrap(), list);
        assert_eq!(&to_bytes(&ExportList::default()).unwrap()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mount_list() {
        let list = MountList(vec![MountEntry {
            hostname: "client1".into(),
            directory: "/srv".into(),
        }]);
        let bytes = to_bytes(&list).unwrap();
        assert_eq!(from_bytes::<MountList>(&bytes).unwrap(), list);
    }
}
