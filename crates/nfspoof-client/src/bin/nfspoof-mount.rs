//! Mount an NFS export under a chosen identity
//!
//! Usage:
//!   nfspoof-mount [OPTIONS] <server:/export> <mount_point>
//!
//! Example:
//!   nfspoof-mount --uid 1000 --gid 1000 fileserver:/home /mnt/home
//!
//! Settings come from the config file (see `--print-config`); flags
//! override it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Runtime;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use nfspoof_core::{Config, CredentialManager, TransportKind};

#[derive(Parser)]
#[command(name = "nfspoof-mount")]
#[command(about = "Mount an NFS export, presenting any uid/gid to the server")]
struct Cli {
    /// Server and export, e.g. fileserver:/srv/data
    target: Option<String>,

    /// Where to mount (config `mount.mount_point` if omitted)
    mount_point: Option<PathBuf>,

    /// Config file (default: the per-user config directory)
    #[arg(short, long, env = "NFSPOOF_CONFIG")]
    config: Option<PathBuf>,

    /// uid to present
    #[arg(long)]
    uid: Option<u32>,

    /// gid to present
    #[arg(long)]
    gid: Option<u32>,

    /// Supplementary gids, comma separated
    #[arg(long, value_delimiter = ',')]
    gids: Option<Vec<u32>>,

    /// AUTH_UNIX machine name
    #[arg(long)]
    machine_name: Option<String>,

    /// Act as the owner of every file touched
    #[arg(long)]
    impersonate_owner: bool,

    /// NFS version to use (2 or 3)
    #[arg(long)]
    nfs_version: Option<u32>,

    /// MOUNT port (skips the portmapper)
    #[arg(long)]
    mount_port: Option<u16>,

    /// NFS port (skips the portmapper)
    #[arg(long)]
    nfs_port: Option<u16>,

    /// Use UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Do not bind a privileged source port
    #[arg(long)]
    no_reserved_port: bool,

    /// Remove this mount from the server's mount list right away
    #[arg(long)]
    hide: bool,

    /// Use this hex root handle instead of asking MOUNT
    #[arg(long)]
    root_handle: Option<String>,

    /// Climb above the export root
    #[arg(long)]
    getroot: bool,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Let other local users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Print the server's export list and exit
    #[arg(long)]
    list_exports: bool,

    /// Print a sample config file and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) -> Result<(), String> {
        if let Some(target) = &self.target {
            let (host, export) = target
                .rsplit_once(":/")
                .ok_or_else(|| format!("expected server:/export, got {}", target))?;
            config.server.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            config.server.export = format!("/{}", export);
        }
        if let Some(mount_point) = &self.mount_point {
            config.mount.mount_point = Some(mount_point.clone());
        }
        if let Some(uid) = self.uid {
            config.identity.uid = uid;
        }
        if let Some(gid) = self.gid {
            config.identity.gid = gid;
        }
        if let Some(gids) = &self.gids {
            config.identity.gids = gids.clone();
        }
        if let Some(name) = &self.machine_name {
            config.identity.machine_name = Some(name.clone());
        }
        if let Some(version) = self.nfs_version {
            config.server.nfs_version = Some(version);
        }
        if let Some(port) = self.mount_port {
            config.server.mount_port = Some(port);
        }
        if let Some(port) = self.nfs_port {
            config.server.nfs_port = Some(port);
        }
        if let Some(handle) = &self.root_handle {
            config.mount.root_handle = Some(handle.clone());
        }
        if self.udp {
            config.server.transport = TransportKind::Udp;
        }
        if self.no_reserved_port {
            config.network.reserved_port = false;
        }
        config.identity.impersonate_owner |= self.impersonate_owner;
        config.mount.hide |= self.hide;
        config.mount.getroot |= self.getroot;
        config.mount.read_only |= self.read_only;
        config.mount.allow_other |= self.allow_other;
        Ok(())
    }
}

#[cfg(unix)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use nfspoof_client::{FsBridge, MountSession, SpoofFs, SpoofFuse};

    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    cli.apply(&mut config)?;
    config.validate()?;

    let credentials = Arc::new(CredentialManager::with_identity(
        config.identity.credential(),
        config.identity.max_aux_gids,
    ));
    credentials.set_impersonate_owner(config.identity.impersonate_owner);

    let rt = Runtime::new()?;

    info!("Connecting to {}:{}", config.server.host, config.server.export);
    let session = Arc::new(rt.block_on(MountSession::mount(&config, credentials))?);

    if cli.list_exports {
        match rt.block_on(session.exports()) {
            Ok(exports) => {
                for export in exports {
                    println!("{}\t{}", export.dir, export.groups.join(","));
                }
            }
            Err(e) => error!("EXPORT failed: {}", e),
        }
        rt.block_on(session.unmount())?;
        return Ok(());
    }

    let mount_point = match &config.mount.mount_point {
        Some(path) => path.clone(),
        None => return Err("no mount point given".into()),
    };
    if !mount_point.exists() {
        std::fs::create_dir_all(&mount_point)?;
    }
    info!("Mount point: {:?}", mount_point);

    // Filesystem callbacks → bridge → async runtime
    let fs = Arc::new(SpoofFs::from_session(&session, &config));
    let (bridge, handler) = FsBridge::new(config.network.request_timeout());
    let handler_thread = handler.spawn(rt.handle().clone(), fs)?;

    let options = nfspoof_client::fuse::mount_options(&config.mount);
    // This blocks until unmounted
    if let Err(e) = fuser::mount2(SpoofFuse::new(bridge.clone()), &mount_point, &options) {
        error!("Mount failed: {}", e);
        error!("Common issues:");
        error!("  1. FUSE not installed");
        error!("  2. Permission denied - try running with sudo");
        error!("  3. Mount point busy - unmount first: umount {:?}", mount_point);
    }
    info!("Filesystem unmounted");

    bridge.shutdown();
    let _ = handler_thread.join();
    if let Err(e) = rt.block_on(session.unmount()) {
        warn!("UMNT failed: {}", e);
    }
    Ok(())
}

#[cfg(not(unix))]
fn main() {
    let _ = Cli::parse();
    eprintln!("nfspoof-mount needs FUSE and only runs on Unix");
    std::process::exit(1);
}
