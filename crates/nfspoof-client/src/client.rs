//! NFS protocol client
//!
//! [`RemoteFs`] is the per-operation interface the handle cache and the
//! filesystem bridge are written against. [`NfsClient`] implements it for a
//! mounted server, speaking exactly one NFS version chosen at mount time.
//!
//! Every operation takes the credential to stamp explicitly. Ranges that the
//! negotiated version cannot carry fail with
//! [`ProtocolError::VersionMismatch`] before anything is sent.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use nfspoof_core::protocol::{nfs2, nfs3, status_error, status_name, NfsResult};
use nfspoof_core::{
    Attributes, Credential, DirPage, FileHandle, FsInfo, FsStats, NfsVersion, NodeInfo,
    ProtocolError, ReadResult, SetAttributes, WriteResult,
};

use crate::error::ClientError;
use crate::rpc_client::RpcClient;

/// Remote filesystem operations, one RPC each
#[async_trait]
pub trait RemoteFs: Send + Sync {
    fn version(&self) -> NfsVersion;

    /// NULL procedure ping
    async fn null(&self) -> Result<(), ClientError>;

    async fn getattr(&self, fh: &FileHandle, cred: &Credential) -> Result<Attributes, ClientError>;

    /// Returns the post-operation attributes when the server sends them
    async fn setattr(
        &self,
        fh: &FileHandle,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<Option<Attributes>, ClientError>;

    /// Resolve exactly one name within `dir`
    async fn lookup(
        &self,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError>;

    async fn read(
        &self,
        fh: &FileHandle,
        offset: u64,
        count: u32,
        cred: &Credential,
    ) -> Result<ReadResult, ClientError>;

    async fn write(
        &self,
        fh: &FileHandle,
        offset: u64,
        data: Bytes,
        cred: &Credential,
    ) -> Result<WriteResult, ClientError>;

    /// `guarded` fails with an I/O error if the name already exists
    async fn create(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        guarded: bool,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError>;

    async fn mkdir(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError>;

    async fn symlink(
        &self,
        dir: &FileHandle,
        name: &str,
        target: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError>;

    async fn remove(&self, dir: &FileHandle, name: &str, cred: &Credential)
        -> Result<(), ClientError>;

    async fn rmdir(&self, dir: &FileHandle, name: &str, cred: &Credential)
        -> Result<(), ClientError>;

    async fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
        cred: &Credential,
    ) -> Result<(), ClientError>;

    /// One page of entries starting after `cookie`
    async fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        cookie_verifier: [u8; 8],
        count: u32,
        cred: &Credential,
    ) -> Result<DirPage, ClientError>;

    async fn readlink(&self, fh: &FileHandle, cred: &Credential) -> Result<String, ClientError>;

    async fn statfs(&self, fh: &FileHandle, cred: &Credential) -> Result<FsStats, ClientError>;

    /// Server transfer preferences; `None` where the version has no FSINFO
    async fn fsinfo(&self, fh: &FileHandle, cred: &Credential)
        -> Result<Option<FsInfo>, ClientError>;
}

fn check<T, F>(result: NfsResult<T, F>, op: &'static str) -> Result<T, ClientError> {
    match result {
        NfsResult::Ok(value) => Ok(value),
        NfsResult::Fail { status, .. } => {
            debug!("{} failed: {} ({})", op, status_name(status), status);
            Err(status_error(status).into())
        }
    }
}

fn narrow(value: u64, what: &str) -> Result<u32, ClientError> {
    u32::try_from(value).map_err(|_| {
        ClientError::Protocol(ProtocolError::VersionMismatch(format!(
            "{} {} exceeds the NFSv2 32-bit limit",
            what, value
        )))
    })
}

/// NFS client bound to one server and one negotiated version
pub struct NfsClient {
    rpc: RpcClient,
    version: NfsVersion,
}

impl NfsClient {
    pub fn new(rpc: RpcClient, version: NfsVersion) -> Self {
        Self { rpc, version }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn call<A, R>(&self, procedure: u32, args: &A, cred: &Credential) -> Result<R, ClientError>
    where
        A: nfspoof_core::xdr::ToXdr + ?Sized + Sync,
        R: nfspoof_core::xdr::FromXdr,
    {
        self.rpc.call(procedure, args, Some(cred)).await
    }

    fn dirop2(dir: &FileHandle, name: &str) -> nfs2::DirOpArgs2 {
        nfs2::DirOpArgs2 {
            dir: dir.clone(),
            name: name.to_string(),
        }
    }

    fn dirop3(dir: &FileHandle, name: &str) -> nfs3::DirOpArgs3 {
        nfs3::DirOpArgs3 {
            dir: dir.clone(),
            name: name.to_string(),
        }
    }

    /// Finish a v3 CREATE/MKDIR/SYMLINK whose reply may omit the new handle
    async fn dirop3_result(
        &self,
        ok: nfs3::DirOpOk,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        match ok.object {
            Some(handle) => Ok(NodeInfo {
                handle,
                attributes: ok.attributes,
            }),
            None => {
                trace!("server omitted handle for {:?}, looking it up", name);
                self.lookup(dir, name, cred).await
            }
        }
    }
}

#[async_trait]
impl RemoteFs for NfsClient {
    fn version(&self) -> NfsVersion {
        self.version
    }

    async fn null(&self) -> Result<(), ClientError> {
        self.rpc.null().await
    }

    async fn getattr(&self, fh: &FileHandle, cred: &Credential) -> Result<Attributes, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::AttrStat = self
                    .call(nfs2::proc::GETATTR, &nfs2::Fh2(fh.clone()), cred)
                    .await?;
                Ok(check(res, "GETATTR")?.0)
            }
            NfsVersion::V3 => {
                let res: nfs3::GetAttrRes = self
                    .call(nfs3::proc::GETATTR, &nfs3::Fh3(fh.clone()), cred)
                    .await?;
                Ok(check(res, "GETATTR")?.0)
            }
        }
    }

    async fn setattr(
        &self,
        fh: &FileHandle,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<Option<Attributes>, ClientError> {
        if let Some(size) = attrs.size {
            self.version.check_range(size, 0)?;
        }
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::SetAttrArgs2 {
                    file: fh.clone(),
                    attributes: attrs.clone(),
                };
                let res: nfs2::AttrStat = self.call(nfs2::proc::SETATTR, &args, cred).await?;
                Ok(Some(check(res, "SETATTR")?.0))
            }
            NfsVersion::V3 => {
                let args = nfs3::SetAttrArgs {
                    object: fh.clone(),
                    attributes: attrs.clone(),
                    guard: None,
                };
                let res: nfs3::SetAttrRes = self.call(nfs3::proc::SETATTR, &args, cred).await?;
                Ok(check(res, "SETATTR")?.after)
            }
        }
    }

    async fn lookup(
        &self,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::DirOpRes2 = self
                    .call(nfs2::proc::LOOKUP, &Self::dirop2(dir, name), cred)
                    .await?;
                let ok = check(res, "LOOKUP")?;
                Ok(NodeInfo {
                    handle: ok.file,
                    attributes: Some(ok.attributes),
                })
            }
            NfsVersion::V3 => {
                let res: nfs3::LookupRes = self
                    .call(nfs3::proc::LOOKUP, &Self::dirop3(dir, name), cred)
                    .await?;
                let ok = check(res, "LOOKUP")?;
                Ok(NodeInfo {
                    handle: ok.object,
                    attributes: ok.obj_attributes,
                })
            }
        }
    }

    async fn read(
        &self,
        fh: &FileHandle,
        offset: u64,
        count: u32,
        cred: &Credential,
    ) -> Result<ReadResult, ClientError> {
        self.version.check_range(offset, u64::from(count))?;
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::ReadArgs2 {
                    file: fh.clone(),
                    offset: narrow(offset, "offset")?,
                    count,
                    total_count: count,
                };
                let res: nfs2::ReadRes2 = self.call(nfs2::proc::READ, &args, cred).await?;
                let ok = check(res, "READ")?;
                // v2 has no eof flag: a short read or reaching the size means eof
                let end = offset + ok.data.len() as u64;
                let eof = ok.data.len() < count as usize || end >= ok.attributes.size;
                Ok(ReadResult {
                    data: ok.data,
                    eof,
                    attributes: Some(ok.attributes),
                })
            }
            NfsVersion::V3 => {
                let args = nfs3::ReadArgs {
                    file: fh.clone(),
                    offset,
                    count,
                };
                let res: nfs3::ReadRes = self.call(nfs3::proc::READ, &args, cred).await?;
                let ok = check(res, "READ")?;
                Ok(ReadResult {
                    data: ok.data,
                    eof: ok.eof,
                    attributes: ok.attributes,
                })
            }
        }
    }

    async fn write(
        &self,
        fh: &FileHandle,
        offset: u64,
        data: Bytes,
        cred: &Credential,
    ) -> Result<WriteResult, ClientError> {
        self.version.check_range(offset, data.len() as u64)?;
        let count = narrow(data.len() as u64, "write length")?;
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::WriteArgs2 {
                    file: fh.clone(),
                    begin_offset: 0,
                    offset: narrow(offset, "offset")?,
                    total_count: 0,
                    data,
                };
                let res: nfs2::AttrStat = self.call(nfs2::proc::WRITE, &args, cred).await?;
                let attrs = check(res, "WRITE")?.0;
                Ok(WriteResult {
                    count,
                    attributes: Some(attrs),
                })
            }
            NfsVersion::V3 => {
                let args = nfs3::WriteArgs {
                    file: fh.clone(),
                    offset,
                    count,
                    stable: nfs3::stable::FILE_SYNC,
                    data,
                };
                let res: nfs3::WriteRes = self.call(nfs3::proc::WRITE, &args, cred).await?;
                let ok = check(res, "WRITE")?;
                Ok(WriteResult {
                    count: ok.count,
                    attributes: ok.wcc.after,
                })
            }
        }
    }

    async fn create(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        guarded: bool,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::CreateArgs2 {
                    place: Self::dirop2(dir, name),
                    attributes: attrs.clone(),
                };
                let res: nfs2::DirOpRes2 = self.call(nfs2::proc::CREATE, &args, cred).await?;
                let ok = check(res, "CREATE")?;
                Ok(NodeInfo {
                    handle: ok.file,
                    attributes: Some(ok.attributes),
                })
            }
            NfsVersion::V3 => {
                let how = if guarded {
                    nfs3::CreateHow::Guarded(attrs.clone())
                } else {
                    nfs3::CreateHow::Unchecked(attrs.clone())
                };
                let args = nfs3::CreateArgs {
                    place: Self::dirop3(dir, name),
                    how,
                };
                let res: nfs3::DirOpRes = self.call(nfs3::proc::CREATE, &args, cred).await?;
                let ok = check(res, "CREATE")?;
                self.dirop3_result(ok, dir, name, cred).await
            }
        }
    }

    async fn mkdir(
        &self,
        dir: &FileHandle,
        name: &str,
        attrs: &SetAttributes,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::CreateArgs2 {
                    place: Self::dirop2(dir, name),
                    attributes: attrs.clone(),
                };
                let res: nfs2::DirOpRes2 = self.call(nfs2::proc::MKDIR, &args, cred).await?;
                let ok = check(res, "MKDIR")?;
                Ok(NodeInfo {
                    handle: ok.file,
                    attributes: Some(ok.attributes),
                })
            }
            NfsVersion::V3 => {
                let args = nfs3::MkdirArgs {
                    place: Self::dirop3(dir, name),
                    attributes: attrs.clone(),
                };
                let res: nfs3::DirOpRes = self.call(nfs3::proc::MKDIR, &args, cred).await?;
                let ok = check(res, "MKDIR")?;
                self.dirop3_result(ok, dir, name, cred).await
            }
        }
    }

    async fn symlink(
        &self,
        dir: &FileHandle,
        name: &str,
        target: &str,
        cred: &Credential,
    ) -> Result<NodeInfo, ClientError> {
        let attrs = SetAttributes::mode(0o777);
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::SymlinkArgs2 {
                    place: Self::dirop2(dir, name),
                    target: target.to_string(),
                    attributes: attrs,
                };
                let res: nfs2::StatRes = self.call(nfs2::proc::SYMLINK, &args, cred).await?;
                check(res, "SYMLINK")?;
                // v2 SYMLINK returns no handle
                self.lookup(dir, name, cred).await
            }
            NfsVersion::V3 => {
                let args = nfs3::SymlinkArgs {
                    place: Self::dirop3(dir, name),
                    attributes: attrs,
                    target: target.to_string(),
                };
                let res: nfs3::DirOpRes = self.call(nfs3::proc::SYMLINK, &args, cred).await?;
                let ok = check(res, "SYMLINK")?;
                self.dirop3_result(ok, dir, name, cred).await
            }
        }
    }

    async fn remove(
        &self,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<(), ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::StatRes = self
                    .call(nfs2::proc::REMOVE, &Self::dirop2(dir, name), cred)
                    .await?;
                check(res, "REMOVE")
            }
            NfsVersion::V3 => {
                let res: nfs3::RemoveRes = self
                    .call(nfs3::proc::REMOVE, &Self::dirop3(dir, name), cred)
                    .await?;
                check(res, "REMOVE").map(|_| ())
            }
        }
    }

    async fn rmdir(
        &self,
        dir: &FileHandle,
        name: &str,
        cred: &Credential,
    ) -> Result<(), ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::StatRes = self
                    .call(nfs2::proc::RMDIR, &Self::dirop2(dir, name), cred)
                    .await?;
                check(res, "RMDIR")
            }
            NfsVersion::V3 => {
                let res: nfs3::RemoveRes = self
                    .call(nfs3::proc::RMDIR, &Self::dirop3(dir, name), cred)
                    .await?;
                check(res, "RMDIR").map(|_| ())
            }
        }
    }

    async fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
        cred: &Credential,
    ) -> Result<(), ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::RenameArgs2 {
                    from: Self::dirop2(from_dir, from_name),
                    to: Self::dirop2(to_dir, to_name),
                };
                let res: nfs2::StatRes = self.call(nfs2::proc::RENAME, &args, cred).await?;
                check(res, "RENAME")
            }
            NfsVersion::V3 => {
                let args = nfs3::RenameArgs {
                    from: Self::dirop3(from_dir, from_name),
                    to: Self::dirop3(to_dir, to_name),
                };
                let res: nfs3::RenameRes = self.call(nfs3::proc::RENAME, &args, cred).await?;
                check(res, "RENAME").map(|_| ())
            }
        }
    }

    async fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        cookie_verifier: [u8; 8],
        count: u32,
        cred: &Credential,
    ) -> Result<DirPage, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let args = nfs2::ReadDirArgs2 {
                    dir: dir.clone(),
                    cookie: narrow(cookie, "cookie")?,
                    count,
                };
                let res: nfs2::ReadDirRes2 = self.call(nfs2::proc::READDIR, &args, cred).await?;
                Ok(check(res, "READDIR")?.into_page())
            }
            NfsVersion::V3 => {
                let args = nfs3::ReadDirArgs {
                    dir: dir.clone(),
                    cookie,
                    cookie_verifier,
                    count,
                };
                let res: nfs3::ReadDirRes = self.call(nfs3::proc::READDIR, &args, cred).await?;
                Ok(check(res, "READDIR")?.into_page())
            }
        }
    }

    async fn readlink(&self, fh: &FileHandle, cred: &Credential) -> Result<String, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::ReadLinkRes2 = self
                    .call(nfs2::proc::READLINK, &nfs2::Fh2(fh.clone()), cred)
                    .await?;
                Ok(check(res, "READLINK")?.0)
            }
            NfsVersion::V3 => {
                let res: nfs3::ReadLinkRes = self
                    .call(nfs3::proc::READLINK, &nfs3::Fh3(fh.clone()), cred)
                    .await?;
                Ok(check(res, "READLINK")?.target)
            }
        }
    }

    async fn statfs(&self, fh: &FileHandle, cred: &Credential) -> Result<FsStats, ClientError> {
        match self.version {
            NfsVersion::V2 => {
                let res: nfs2::StatFsRes2 = self
                    .call(nfs2::proc::STATFS, &nfs2::Fh2(fh.clone()), cred)
                    .await?;
                Ok(check(res, "STATFS")?.into_stats())
            }
            NfsVersion::V3 => {
                let res: nfs3::FsStatRes = self
                    .call(nfs3::proc::FSSTAT, &nfs3::Fh3(fh.clone()), cred)
                    .await?;
                Ok(check(res, "FSSTAT")?.into_stats())
            }
        }
    }

    async fn fsinfo(
        &self,
        fh: &FileHandle,
        cred: &Credential,
    ) -> Result<Option<FsInfo>, ClientError> {
        match self.version {
            NfsVersion::V2 => Ok(None),
            NfsVersion::V3 => {
                let res: nfs3::FsInfoRes = self
                    .call(nfs3::proc::FSINFO, &nfs3::Fh3(fh.clone()), cred)
                    .await?;
                Ok(Some(check(res, "FSINFO")?.into_info()))
            }
        }
    }
}
