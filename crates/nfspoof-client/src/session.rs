//! Mount handshake and session lifecycle
//!
//! Mounting is two-phase: MNT against the export path yields the root handle
//! and fixes the NFS version (MOUNT v3 pairs with NFSv3, MOUNT v1 with
//! NFSv2); every later call uses that version's layouts only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use nfspoof_core::protocol::{mount, nfs2, nfs3, portmap as pmap};
use nfspoof_core::rpc::AUTH_UNIX;
use nfspoof_core::{
    Config, ConfigError, Credential, CredentialManager, FileHandle, FsInfo, NfsVersion,
    ProtocolError,
};

use crate::client::{NfsClient, RemoteFs};
use crate::error::ClientError;
use crate::portmap::{get_port, portmapper_addr};
use crate::rpc_client::{AuthContext, RpcClient};
use crate::transport::{Transport, TransportConfig};

/// Upper bound on `..` steps taken when escaping the export
const MAX_GETROOT_STEPS: usize = 64;

pub use mount::{ExportNode, MountEntry};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot resolve server {0}")]
    Resolve(String),

    #[error("invalid root handle: {0}")]
    InvalidHandle(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Client(e.into())
    }
}

/// MOUNT protocol calls for one MOUNT version
#[derive(Clone)]
pub struct MountClient {
    rpc: RpcClient,
}

impl MountClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn version(&self) -> u32 {
        self.rpc.version()
    }

    /// MNT: root handle of `export`
    pub async fn mnt(&self, export: &str, cred: &Credential) -> Result<FileHandle, ClientError> {
        let path = mount::DirPath(export.to_string());
        if self.rpc.version() == mount::VERSION_3 {
            let res: mount::MountRes3 = self.rpc.call(mount::proc::MNT, &path, Some(cred)).await?;
            let ok = res.into_result()?;
            if !ok.auth_flavors.is_empty() && !ok.auth_flavors.contains(&AUTH_UNIX) {
                warn!(
                    "export {} does not list AUTH_UNIX (flavors {:?}); calls may be rejected",
                    export, ok.auth_flavors
                );
            }
            Ok(ok.handle)
        } else {
            let res: mount::MountRes1 = self.rpc.call(mount::proc::MNT, &path, Some(cred)).await?;
            Ok(res.into_result()?.handle)
        }
    }

    pub async fn umnt(&self, export: &str, cred: &Credential) -> Result<(), ClientError> {
        let path = mount::DirPath(export.to_string());
        self.rpc.call(mount::proc::UMNT, &path, Some(cred)).await
    }

    pub async fn umnt_all(&self, cred: &Credential) -> Result<(), ClientError> {
        self.rpc.call(mount::proc::UMNTALL, &(), Some(cred)).await
    }

    pub async fn exports(&self, cred: &Credential) -> Result<Vec<ExportNode>, ClientError> {
        let list: mount::ExportList = self.rpc.call(mount::proc::EXPORT, &(), Some(cred)).await?;
        Ok(list.0)
    }

    /// DUMP: the server's record of which clients mounted what
    pub async fn dump(&self, cred: &Credential) -> Result<Vec<MountEntry>, ClientError> {
        let list: mount::MountList = self.rpc.call(mount::proc::DUMP, &(), Some(cred)).await?;
        Ok(list.0)
    }
}

/// A mounted export
pub struct MountSession {
    server: SocketAddr,
    export: String,
    root: FileHandle,
    version: NfsVersion,
    client: Arc<NfsClient>,
    mount: MountClient,
    credentials: Arc<CredentialManager>,
    /// The server holds a mount record for us (MNT done, not hidden)
    registered: AtomicBool,
    fsinfo: Option<FsInfo>,
    max_read: u32,
    max_write: u32,
}

impl MountSession {
    /// Resolve the server, negotiate a version and obtain the root handle
    pub async fn mount(
        config: &Config,
        credentials: Arc<CredentialManager>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let server = resolve(&config.server.host, config.server.portmap_port).await?;
        let auth = match &config.identity.machine_name {
            Some(name) => AuthContext::new(name.clone(), nfspoof_core::Timestamp::now().seconds),
            None => AuthContext::local(),
        };
        let base = TransportConfig {
            addr: server,
            kind: config.server.transport,
            connect_timeout: config.network.connect_timeout(),
            request_timeout: config.network.request_timeout(),
            reserved_port: config.network.reserved_port,
        };
        let export = config.server.export.clone();
        let cred = credentials.current();

        let candidates = match config.nfs_version()? {
            Some(version) => vec![version],
            None => vec![NfsVersion::V3, NfsVersion::V2],
        };

        let explicit_root = match &config.mount.root_handle {
            Some(hex) => Some(
                FileHandle::from_hex(hex).map_err(|e| SessionError::InvalidHandle(e.to_string()))?,
            ),
            None => None,
        };

        let mut last_error: Option<ClientError> = None;
        let mut negotiated = None;
        for version in candidates {
            let mount_client = match connect_program(
                &base,
                config.server.mount_port,
                mount::PROGRAM,
                version.mount_version(),
                &auth,
            )
            .await
            {
                Ok(rpc) => MountClient::new(rpc),
                Err(e) if explicit_root.is_some() => {
                    // MOUNT is optional when the root handle is given
                    debug!("no MOUNT v{} service: {}", version.mount_version(), e);
                    let rpc = unbound_mount_rpc(&base, config.server.mount_port, version, &auth);
                    MountClient::new(rpc)
                }
                Err(e) if is_version_refusal(&e) => {
                    debug!("MOUNT v{} unavailable: {}", version.mount_version(), e);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let root = match &explicit_root {
                Some(handle) => {
                    info!("using supplied root handle {}", handle);
                    handle.clone()
                }
                None => match mount_client.mnt(&export, &cred).await {
                    Ok(handle) => handle,
                    Err(e) if is_version_refusal(&e) => {
                        debug!("MNT v{} refused: {}", mount_client.version(), e);
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => {
                        warn!("MNT {} failed: {}", export, e);
                        return Err(e.into());
                    }
                },
            };
            negotiated = Some((version, mount_client, root));
            break;
        }

        let (version, mount_client, mut root) = match negotiated {
            Some(found) => found,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| ProtocolError::NotSupported.into())
                    .into())
            }
        };
        info!(
            "mounted {}:{} as {} (root handle {} bytes)",
            config.server.host,
            export,
            version,
            root.len()
        );

        let registered = explicit_root.is_none();
        if registered && config.mount.hide {
            match mount_client.umnt(&export, &cred).await {
                Ok(()) => info!("hid mount of {} from the server's mount list", export),
                Err(e) => warn!("UMNT for hide failed: {}", e),
            }
        }

        let nfs_program_version = match version {
            NfsVersion::V2 => nfs2::VERSION,
            NfsVersion::V3 => nfs3::VERSION,
        };
        let nfs_rpc = connect_program(
            &base,
            config.server.nfs_port,
            nfs3::PROGRAM,
            nfs_program_version,
            &auth,
        )
        .await?;
        let client = Arc::new(NfsClient::new(nfs_rpc, version));

        if config.mount.getroot {
            root = escape_export(client.as_ref(), root, &cred).await?;
        }

        let fsinfo = match client.fsinfo(&root, &cred).await {
            Ok(info) => info,
            Err(e) => {
                warn!("FSINFO failed ({}), using configured transfer sizes", e);
                None
            }
        };
        let (max_read, max_write) = transfer_sizes(version, fsinfo.as_ref(), config);
        debug!("transfer sizes: read {} write {}", max_read, max_write);

        Ok(Self {
            server,
            export,
            root,
            version,
            client,
            mount: mount_client,
            credentials,
            registered: AtomicBool::new(registered && !config.mount.hide),
            fsinfo,
            max_read,
            max_write,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn export(&self) -> &str {
        &self.export
    }

    pub fn root(&self) -> &FileHandle {
        &self.root
    }

    pub fn version(&self) -> NfsVersion {
        self.version
    }

    pub fn client(&self) -> Arc<NfsClient> {
        self.client.clone()
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn fsinfo(&self) -> Option<&FsInfo> {
        self.fsinfo.as_ref()
    }

    pub fn max_read(&self) -> u32 {
        self.max_read
    }

    pub fn max_write(&self) -> u32 {
        self.max_write
    }

    /// Export list of the server
    pub async fn exports(&self) -> Result<Vec<ExportNode>, ClientError> {
        self.mount.exports(&self.credentials.current()).await
    }

    /// The server's mount list
    pub async fn mount_list(&self) -> Result<Vec<MountEntry>, ClientError> {
        self.mount.dump(&self.credentials.current()).await
    }

    /// Drop and re-establish the NFS connection
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.client.rpc().transport().reconnect().await
    }

    /// Release the mount on the server (UMNT) and close connections
    pub async fn unmount(&self) -> Result<(), ClientError> {
        let result = if self.registered.swap(false, Ordering::AcqRel) {
            self.mount
                .umnt(&self.export, &self.credentials.current())
                .await
        } else {
            Ok(())
        };
        self.client.rpc().transport().close().await;
        self.mount.rpc.transport().close().await;
        info!("unmounted {}", self.export);
        result
    }
}

fn is_version_refusal(e: &ClientError) -> bool {
    matches!(
        e,
        ClientError::Protocol(ProtocolError::NotSupported | ProtocolError::VersionMismatch(_))
    )
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    if host.is_empty() {
        return Err(SessionError::Resolve("no server host configured".into()));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SessionError::Resolve(format!("{}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| SessionError::Resolve(format!("{}: no addresses", host)))
}

/// RPC client for `program`/`version`, discovering the port unless given
async fn connect_program(
    base: &TransportConfig,
    port: Option<u16>,
    program: u32,
    version: u32,
    auth: &AuthContext,
) -> Result<RpcClient, ClientError> {
    let port = match port {
        Some(port) => port,
        None => get_port(base, program, version).await?,
    };
    let config = TransportConfig {
        addr: portmapper_addr(base.addr, port),
        ..base.clone()
    };
    Ok(RpcClient::new(
        Arc::new(Transport::new(config)),
        program,
        version,
        auth.clone(),
    ))
}

/// MOUNT client that was never contacted (root handle supplied); connects lazily
fn unbound_mount_rpc(
    base: &TransportConfig,
    port: Option<u16>,
    version: NfsVersion,
    auth: &AuthContext,
) -> RpcClient {
    let config = TransportConfig {
        addr: portmapper_addr(base.addr, port.unwrap_or(pmap::PORT)),
        ..base.clone()
    };
    RpcClient::new(
        Arc::new(Transport::new(config)),
        mount::PROGRAM,
        version.mount_version(),
        auth.clone(),
    )
}

/// Walk `..` from `root` until the file id stops changing
pub async fn escape_export(
    client: &dyn RemoteFs,
    root: FileHandle,
    cred: &Credential,
) -> Result<FileHandle, ClientError> {
    let mut current = root;
    let mut fileid = client.getattr(&current, cred).await?.fileid;
    for _ in 0..MAX_GETROOT_STEPS {
        let parent = client.lookup(&current, "..", cred).await?;
        let parent_id = match &parent.attributes {
            Some(attrs) => attrs.fileid,
            None => client.getattr(&parent.handle, cred).await?.fileid,
        };
        if parent_id == fileid {
            break;
        }
        debug!("getroot: stepped up to file id {}", parent_id);
        current = parent.handle;
        fileid = parent_id;
    }
    info!("getroot: using handle {} (file id {})", current, fileid);
    Ok(current)
}

/// Configured sizes, lowered to what the server and the version allow
pub fn transfer_sizes(version: NfsVersion, fsinfo: Option<&FsInfo>, config: &Config) -> (u32, u32) {
    let mut read = config.transfer.max_read;
    let mut write = config.transfer.max_write;
    if let Some(info) = fsinfo {
        if info.rtmax > 0 {
            read = read.min(info.rtmax);
        }
        if info.wtmax > 0 {
            write = write.min(info.wtmax);
        }
    }
    if version == NfsVersion::V2 {
        read = read.min(nfs2::MAXDATA as u32);
        write = write.min(nfs2::MAXDATA as u32);
    }
    (read.max(1), write.max(1))
}
