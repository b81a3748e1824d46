//! In-process MOUNT and NFS server for integration tests
//!
//! MOUNT v1/v3 and NFS v2/v3 all answer on one TCP port. NFSv2 handles are
//! the v3 ones zero-padded to 32 bytes. Permission checks follow the mode
//! bits against the caller's AUTH_UNIX identity with no special case for
//! uid 0, the way a root-squashing server behaves.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use nfspoof_client::transport::{read_record, write_record};
use nfspoof_core::protocol::{mount, nfs2, nfs3, status, NfsResult};
use nfspoof_core::rpc::{AcceptStat, CallHeader, ReplyHeader, AUTH_UNIX};
use nfspoof_core::xdr::{Decoder, Encoder, ToXdr};
use nfspoof_core::{
    Attributes, Config, Credential, DirEntry, FileHandle, FileType, Timestamp, XdrError,
};

pub const ROOT_ID: u64 = 1;
pub const EXPORT: &str = "/data";

const READ: u32 = 4;
const WRITE: u32 = 2;
const EXEC: u32 = 1;

struct Node {
    attributes: Attributes,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
    parent: u64,
    generation: u32,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<u64, Node>,
    next_id: u64,
    mounts: Vec<mount::MountEntry>,
}

/// Procedure counters
#[derive(Default)]
pub struct Counters {
    pub lookup: AtomicUsize,
    pub getattr: AtomicUsize,
    pub read: AtomicUsize,
    pub write: AtomicUsize,
    pub mnt: AtomicUsize,
}

pub struct FakeServer {
    addr: SocketAddr,
    tree: Arc<Mutex<Tree>>,
    counters: Arc<Counters>,
    lookup_delay: Arc<Mutex<Option<Duration>>>,
    accept_task: JoinHandle<()>,
}

impl FakeServer {
    /// Start a server exporting `/data`:
    ///
    /// ```text
    /// /                   0:0     755
    /// /outside.txt        0:0     644  "above the export\n"
    /// /data               0:0     755
    /// /data/secret.txt    1000:1000 600 "top secret\n"
    /// /data/notes.txt     1000:1000 644 "0123456789"
    /// /data/private       1000:1000 700
    /// /data/private/plan.txt 1000:1000 600 "the plan\n"
    /// ```
    pub async fn start() -> Self {
        let mut tree = Tree {
            next_id: ROOT_ID + 1,
            ..Tree::default()
        };
        tree.nodes.insert(
            ROOT_ID,
            Node {
                attributes: Attributes::directory(ROOT_ID, 0, 0),
                data: Vec::new(),
                children: BTreeMap::new(),
                parent: ROOT_ID,
                generation: 1,
            },
        );
        tree.add(ROOT_ID, "outside.txt", FileType::Regular, 0, 0o644, b"above the export\n");
        let data = tree.add(ROOT_ID, "data", FileType::Directory, 0, 0o755, b"");
        tree.add(data, "secret.txt", FileType::Regular, 1000, 0o600, b"top secret\n");
        tree.add(data, "notes.txt", FileType::Regular, 1000, 0o644, b"0123456789");
        let private = tree.add(data, "private", FileType::Directory, 1000, 0o700, b"");
        tree.add(private, "plan.txt", FileType::Regular, 1000, 0o600, b"the plan\n");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let tree = Arc::new(Mutex::new(tree));
        let counters = Arc::new(Counters::default());
        let lookup_delay = Arc::new(Mutex::new(None));

        let state = Shared {
            tree: tree.clone(),
            counters: counters.clone(),
            lookup_delay: lookup_delay.clone(),
        };
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, state.clone()));
            }
        });

        Self {
            addr,
            tree,
            counters,
            lookup_delay,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn lookups(&self) -> usize {
        self.counters.lookup.load(Ordering::SeqCst)
    }

    pub fn getattrs(&self) -> usize {
        self.counters.getattr.load(Ordering::SeqCst)
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = Some(delay);
    }

    /// Config pointing both MOUNT and NFS at this server, presenting `uid:gid`
    pub fn config(&self, uid: u32, gid: u32) -> Config {
        let mut config = Config::default();
        config.server.host = self.addr.ip().to_string();
        config.server.export = EXPORT.to_string();
        config.server.mount_port = Some(self.addr.port());
        config.server.nfs_port = Some(self.addr.port());
        config.server.nfs_version = Some(3);
        config.network.reserved_port = false;
        config.network.request_timeout_secs = 5;
        config.network.connect_timeout_secs = 5;
        config.identity.uid = uid;
        config.identity.gid = gid;
        config.identity.machine_name = Some("testbox".to_string());
        config
    }

    /// Current contents of the file at absolute server path `path`
    pub fn content(&self, path: &str) -> Vec<u8> {
        let tree = self.tree.lock();
        let id = tree.find(path).expect("path exists");
        tree.nodes[&id].data.clone()
    }

    /// Hex handle of the object at absolute server path `path`
    pub fn handle_hex(&self, path: &str) -> String {
        let tree = self.tree.lock();
        let id = tree.find(path).expect("path exists");
        tree.handle(id).to_hex()
    }

    /// Invalidate every handle issued so far for `path`
    pub fn make_stale(&self, path: &str) {
        let mut tree = self.tree.lock();
        let id = tree.find(path).expect("path exists");
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.generation += 1;
        }
    }

    /// Directories the server currently records as mounted
    pub fn mounted(&self) -> Vec<String> {
        self.tree
            .lock()
            .mounts
            .iter()
            .map(|entry| entry.directory.clone())
            .collect()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Tree {
    fn add(&mut self, parent: u64, name: &str, kind: FileType, uid: u32, mode: u32, data: &[u8]) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut attributes = match kind {
            FileType::Directory => Attributes::directory(id, uid, uid),
            _ => Attributes::file(id, data.len() as u64, uid, uid),
        };
        attributes.kind = kind;
        attributes.mode = mode;
        self.nodes.insert(
            id,
            Node {
                attributes,
                data: data.to_vec(),
                children: BTreeMap::new(),
                parent,
                generation: 1,
            },
        );
        if let Some(dir) = self.nodes.get_mut(&parent) {
            dir.children.insert(name.to_string(), id);
        }
        id
    }

    fn find(&self, path: &str) -> Option<u64> {
        let mut id = ROOT_ID;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            id = *self.nodes.get(&id)?.children.get(name)?;
        }
        Some(id)
    }

    fn handle(&self, id: u64) -> FileHandle {
        FileHandle::new(self.raw_handle(id))
    }

    fn handle_v2(&self, id: u64) -> FileHandle {
        let mut raw = self.raw_handle(id);
        raw.resize(nfs2::FHSIZE, 0);
        FileHandle::new(raw)
    }

    fn raw_handle(&self, id: u64) -> Vec<u8> {
        let generation = self.nodes.get(&id).map(|n| n.generation).unwrap_or(0);
        let mut raw = id.to_be_bytes().to_vec();
        raw.extend_from_slice(&generation.to_be_bytes());
        raw
    }

    /// Node id for `fh`, or NFS3ERR_STALE
    fn resolve(&self, fh: &FileHandle) -> Result<u64, u32> {
        let raw = match fh.as_bytes() {
            raw if raw.len() == 12 => raw,
            raw if raw.len() == nfs2::FHSIZE && raw[12..].iter().all(|&b| b == 0) => &raw[..12],
            _ => return Err(status::STALE),
        };
        let mut id = [0u8; 8];
        id.copy_from_slice(&raw[..8]);
        let id = u64::from_be_bytes(id);
        let mut generation = [0u8; 4];
        generation.copy_from_slice(&raw[8..]);
        match self.nodes.get(&id) {
            Some(node) if node.generation == u32::from_be_bytes(generation) => Ok(id),
            _ => Err(status::STALE),
        }
    }

    fn attributes(&self, id: u64) -> Option<Attributes> {
        self.nodes.get(&id).map(|n| n.attributes.clone())
    }

    fn check(&self, id: u64, cred: &Credential, want: u32) -> Result<(), u32> {
        let attrs = &self.nodes.get(&id).ok_or(status::STALE)?.attributes;
        let bits = if cred.uid == attrs.uid {
            attrs.mode >> 6
        } else if cred.gid == attrs.gid || cred.supplementary_gids.contains(&attrs.gid) {
            attrs.mode >> 3
        } else {
            attrs.mode
        };
        if bits & want == want {
            Ok(())
        } else {
            Err(status::ACCES)
        }
    }
}

#[derive(Clone)]
struct Shared {
    tree: Arc<Mutex<Tree>>,
    counters: Arc<Counters>,
    lookup_delay: Arc<Mutex<Option<Duration>>>,
}

async fn serve_connection(stream: TcpStream, state: Shared) {
    let (mut reader, mut writer) = stream.into_split();
    while let Ok(record) = read_record(&mut reader).await {
        let reply = match handle_call(&record, &state).await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        if write_record(&mut writer, &reply).await.is_err() {
            break;
        }
    }
}

fn reply<T: ToXdr>(xid: u32, body: &T) -> Result<Bytes, XdrError> {
    let mut encoder = Encoder::new();
    encoder.encode(&ReplyHeader::success(xid))?;
    encoder.encode(body)?;
    Ok(encoder.finish())
}

fn reject(xid: u32, stat: AcceptStat) -> Result<Bytes, XdrError> {
    let mut encoder = Encoder::new();
    encoder.encode(&ReplyHeader::accepted(xid, stat))?;
    Ok(encoder.finish())
}

async fn handle_call(record: &[u8], state: &Shared) -> Result<Bytes, XdrError> {
    let mut decoder = Decoder::new(record);
    let call: CallHeader = decoder.decode()?;
    let cred = call
        .auth_unix()
        .map(|auth| auth.credential())
        .unwrap_or_else(|| Credential::new(65534, 65534, Vec::new()));
    let machine = call
        .auth_unix()
        .map(|auth| auth.machine_name.clone())
        .unwrap_or_default();

    match (call.program, call.version) {
        (mount::PROGRAM, mount::VERSION_1 | mount::VERSION_3) => {
            mount_call(&call, &mut decoder, &machine, state)
        }
        (mount::PROGRAM, _) => reject(call.xid, AcceptStat::ProgMismatch { low: 1, high: 3 }),
        (nfs3::PROGRAM, nfs3::VERSION) => {
            if call.procedure == nfs3::proc::LOOKUP {
                lookup_hook(state).await;
            }
            nfs_call(&call, &mut decoder, &cred, state)
        }
        (nfs2::PROGRAM, nfs2::VERSION) => {
            if call.procedure == nfs2::proc::LOOKUP {
                lookup_hook(state).await;
            }
            nfs2_call(&call, &mut decoder, &cred, state)
        }
        (nfs3::PROGRAM, _) => reject(call.xid, AcceptStat::ProgMismatch { low: 2, high: 3 }),
        _ => reject(call.xid, AcceptStat::ProgUnavail),
    }
}

async fn lookup_hook(state: &Shared) {
    state.counters.lookup.fetch_add(1, Ordering::SeqCst);
    let delay = *state.lookup_delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

fn mount_call(
    call: &CallHeader,
    decoder: &mut Decoder<'_>,
    machine: &str,
    state: &Shared,
) -> Result<Bytes, XdrError> {
    let xid = call.xid;
    let mut tree = state.tree.lock();
    match call.procedure {
        mount::proc::NULL => reply(xid, &()),
        mount::proc::MNT => {
            state.counters.mnt.fetch_add(1, Ordering::SeqCst);
            let path: mount::DirPath = decoder.decode()?;
            let found = match tree.find(&path.0) {
                Some(id) if path.0 == EXPORT => {
                    tree.mounts.push(mount::MountEntry {
                        hostname: machine.to_string(),
                        directory: path.0.clone(),
                    });
                    Ok(id)
                }
                Some(_) => Err(status::ACCES),
                None => Err(status::NOENT),
            };
            if call.version == mount::VERSION_1 {
                let res: mount::MountRes1 = match found {
                    Ok(id) => NfsResult::Ok(mount::MountOk1 {
                        handle: tree.handle_v2(id),
                    }),
                    Err(stat) => NfsResult::fail(stat, ()),
                };
                return reply(xid, &res);
            }
            let res: mount::MountRes3 = match found {
                Ok(id) => NfsResult::Ok(mount::MountOk3 {
                    handle: tree.handle(id),
                    auth_flavors: vec![AUTH_UNIX],
                }),
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        mount::proc::UMNT => {
            let path: mount::DirPath = decoder.decode()?;
            tree.mounts.retain(|entry| entry.directory != path.0);
            reply(xid, &())
        }
        mount::proc::UMNTALL => {
            tree.mounts.clear();
            reply(xid, &())
        }
        mount::proc::EXPORT => reply(
            xid,
            &mount::ExportList(vec![mount::ExportNode {
                dir: EXPORT.to_string(),
                groups: vec!["*".to_string()],
            }]),
        ),
        mount::proc::DUMP => reply(xid, &mount::MountList(tree.mounts.clone())),
        _ => reject(xid, AcceptStat::ProcUnavail),
    }
}

fn nfs_call(
    call: &CallHeader,
    decoder: &mut Decoder<'_>,
    cred: &Credential,
    state: &Shared,
) -> Result<Bytes, XdrError> {
    let xid = call.xid;
    let mut tree = state.tree.lock();
    match call.procedure {
        nfs3::proc::NULL => reply(xid, &()),
        nfs3::proc::GETATTR => {
            state.counters.getattr.fetch_add(1, Ordering::SeqCst);
            let fh: nfs3::Fh3 = decoder.decode()?;
            let res: nfs3::GetAttrRes = match tree.resolve(&fh.0) {
                Ok(id) => match tree.attributes(id) {
                    Some(attrs) => NfsResult::Ok(nfs3::Fattr3(attrs)),
                    None => NfsResult::fail(status::STALE, ()),
                },
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        nfs3::proc::SETATTR => {
            let args: nfs3::SetAttrArgs = decoder.decode()?;
            let res: nfs3::SetAttrRes = match setattr(&mut tree, &args, cred) {
                Ok(attrs) => NfsResult::Ok(nfs3::WccData::after(attrs)),
                Err(stat) => NfsResult::fail(stat, nfs3::WccData::default()),
            };
            reply(xid, &res)
        }
        nfs3::proc::LOOKUP => {
            let args: nfs3::DirOpArgs3 = decoder.decode()?;
            let res: nfs3::LookupRes = match lookup(&tree, &args, cred) {
                Ok(id) => NfsResult::Ok(nfs3::LookupOk {
                    object: tree.handle(id),
                    obj_attributes: tree.attributes(id),
                    dir_attributes: None,
                }),
                Err(stat) => NfsResult::fail(stat, nfs3::PostOpAttr(None)),
            };
            reply(xid, &res)
        }
        nfs3::proc::READ => {
            state.counters.read.fetch_add(1, Ordering::SeqCst);
            let args: nfs3::ReadArgs = decoder.decode()?;
            let res: nfs3::ReadRes = match read(&tree, &args, cred) {
                Ok(ok) => NfsResult::Ok(ok),
                Err(stat) => NfsResult::fail(stat, nfs3::PostOpAttr(None)),
            };
            reply(xid, &res)
        }
        nfs3::proc::WRITE => {
            state.counters.write.fetch_add(1, Ordering::SeqCst);
            let args: nfs3::WriteArgs = decoder.decode()?;
            let res: nfs3::WriteRes = match write(&mut tree, &args, cred) {
                Ok(ok) => NfsResult::Ok(ok),
                Err(stat) => NfsResult::fail(stat, nfs3::WccData::default()),
            };
            reply(xid, &res)
        }
        nfs3::proc::CREATE => {
            let args: nfs3::CreateArgs = decoder.decode()?;
            let res: nfs3::DirOpRes = match create(&mut tree, &args, cred) {
                Ok(id) => NfsResult::Ok(nfs3::DirOpOk {
                    object: Some(tree.handle(id)),
                    attributes: tree.attributes(id),
                    dir_wcc: nfs3::WccData::default(),
                }),
                Err(stat) => NfsResult::fail(stat, nfs3::WccData::default()),
            };
            reply(xid, &res)
        }
        nfs3::proc::REMOVE => {
            let args: nfs3::DirOpArgs3 = decoder.decode()?;
            let res: nfs3::RemoveRes = match remove(&mut tree, &args, cred) {
                Ok(()) => NfsResult::Ok(nfs3::WccData::default()),
                Err(stat) => NfsResult::fail(stat, nfs3::WccData::default()),
            };
            reply(xid, &res)
        }
        nfs3::proc::READDIR => {
            let args: nfs3::ReadDirArgs = decoder.decode()?;
            let res: nfs3::ReadDirRes = match readdir(&tree, &args, cred) {
                Ok(ok) => NfsResult::Ok(ok),
                Err(stat) => NfsResult::fail(stat, nfs3::PostOpAttr(None)),
            };
            reply(xid, &res)
        }
        nfs3::proc::FSSTAT => {
            let fh: nfs3::Fh3 = decoder.decode()?;
            let res: nfs3::FsStatRes = match tree.resolve(&fh.0) {
                Ok(_) => NfsResult::Ok(nfs3::FsStatOk {
                    attributes: None,
                    total_bytes: 1 << 30,
                    free_bytes: 1 << 29,
                    avail_bytes: 1 << 28,
                    total_files: 1000,
                    free_files: 500,
                    avail_files: 400,
                    invarsec: 0,
                }),
                Err(stat) => NfsResult::fail(stat, nfs3::PostOpAttr(None)),
            };
            reply(xid, &res)
        }
        nfs3::proc::FSINFO => {
            let fh: nfs3::Fh3 = decoder.decode()?;
            let res: nfs3::FsInfoRes = match tree.resolve(&fh.0) {
                Ok(_) => NfsResult::Ok(nfs3::FsInfoOk {
                    attributes: None,
                    rtmax: 4,
                    rtpref: 4,
                    rtmult: 1,
                    wtmax: 4,
                    wtpref: 4,
                    wtmult: 1,
                    dtpref: 4096,
                    max_file_size: u64::MAX,
                    time_delta: Timestamp::new(0, 1),
                    properties: 0x1b,
                }),
                Err(stat) => NfsResult::fail(stat, nfs3::PostOpAttr(None)),
            };
            reply(xid, &res)
        }
        _ => reject(xid, AcceptStat::ProcUnavail),
    }
}

/// NFSv2 procedures, served through the v3 implementations
fn nfs2_call(
    call: &CallHeader,
    decoder: &mut Decoder<'_>,
    cred: &Credential,
    state: &Shared,
) -> Result<Bytes, XdrError> {
    let xid = call.xid;
    let mut tree = state.tree.lock();
    match call.procedure {
        nfs2::proc::NULL => reply(xid, &()),
        nfs2::proc::GETATTR => {
            state.counters.getattr.fetch_add(1, Ordering::SeqCst);
            let fh: nfs2::Fh2 = decoder.decode()?;
            let res: nfs2::AttrStat = match tree.resolve(&fh.0).map(|id| tree.attributes(id)) {
                Ok(Some(attrs)) => NfsResult::Ok(nfs2::Fattr2(attrs)),
                Ok(None) => NfsResult::fail(status::STALE, ()),
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        nfs2::proc::LOOKUP => {
            let args: nfs2::DirOpArgs2 = decoder.decode()?;
            let args = nfs3::DirOpArgs3 {
                dir: args.dir,
                name: args.name,
            };
            let res: nfs2::DirOpRes2 = match lookup(&tree, &args, cred) {
                Ok(id) => match tree.attributes(id) {
                    Some(attributes) => NfsResult::Ok(nfs2::DirOpOk2 {
                        file: tree.handle_v2(id),
                        attributes,
                    }),
                    None => NfsResult::fail(status::STALE, ()),
                },
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        nfs2::proc::READ => {
            state.counters.read.fetch_add(1, Ordering::SeqCst);
            let args: nfs2::ReadArgs2 = decoder.decode()?;
            let args = nfs3::ReadArgs {
                file: args.file,
                offset: u64::from(args.offset),
                count: args.count,
            };
            let res: nfs2::ReadRes2 = match read(&tree, &args, cred) {
                Ok(nfs3::ReadOk {
                    attributes: Some(attributes),
                    data,
                    ..
                }) => NfsResult::Ok(nfs2::ReadOk2 { attributes, data }),
                Ok(_) => NfsResult::fail(status::STALE, ()),
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        nfs2::proc::WRITE => {
            state.counters.write.fetch_add(1, Ordering::SeqCst);
            let args: nfs2::WriteArgs2 = decoder.decode()?;
            let args = nfs3::WriteArgs {
                file: args.file,
                offset: u64::from(args.offset),
                count: args.data.len() as u32,
                stable: nfs3::stable::FILE_SYNC,
                data: args.data,
            };
            let res: nfs2::AttrStat = match write(&mut tree, &args, cred) {
                Ok(ok) => match ok.wcc.after {
                    Some(attrs) => NfsResult::Ok(nfs2::Fattr2(attrs)),
                    None => NfsResult::fail(status::STALE, ()),
                },
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        nfs2::proc::READDIR => {
            let args: nfs2::ReadDirArgs2 = decoder.decode()?;
            let args = nfs3::ReadDirArgs {
                dir: args.dir,
                cookie: u64::from(args.cookie),
                cookie_verifier: [0; nfs3::VERIFIER_SIZE],
                count: args.count,
            };
            let res: nfs2::ReadDirRes2 = match readdir(&tree, &args, cred) {
                Ok(ok) => NfsResult::Ok(nfs2::ReadDirOk2 {
                    entries: ok.entries,
                    eof: ok.eof,
                }),
                Err(stat) => NfsResult::fail(stat, ()),
            };
            reply(xid, &res)
        }
        _ => reject(xid, AcceptStat::ProcUnavail),
    }
}

fn lookup(tree: &Tree, args: &nfs3::DirOpArgs3, cred: &Credential) -> Result<u64, u32> {
    let dir = tree.resolve(&args.dir)?;
    tree.check(dir, cred, EXEC)?;
    let node = tree.nodes.get(&dir).ok_or(status::STALE)?;
    match args.name.as_str() {
        "." => Ok(dir),
        ".." => Ok(node.parent),
        name => node.children.get(name).copied().ok_or(status::NOENT),
    }
}

fn read(tree: &Tree, args: &nfs3::ReadArgs, cred: &Credential) -> Result<nfs3::ReadOk, u32> {
    let id = tree.resolve(&args.file)?;
    tree.check(id, cred, READ)?;
    let node = tree.nodes.get(&id).ok_or(status::STALE)?;
    let start = (args.offset as usize).min(node.data.len());
    let end = (start + args.count as usize).min(node.data.len());
    Ok(nfs3::ReadOk {
        attributes: Some(node.attributes.clone()),
        count: (end - start) as u32,
        eof: end == node.data.len(),
        data: Bytes::copy_from_slice(&node.data[start..end]),
    })
}

fn write(tree: &mut Tree, args: &nfs3::WriteArgs, cred: &Credential) -> Result<nfs3::WriteOk, u32> {
    let id = tree.resolve(&args.file)?;
    tree.check(id, cred, WRITE)?;
    let node = tree.nodes.get_mut(&id).ok_or(status::STALE)?;
    let start = args.offset as usize;
    let end = start + args.data.len();
    if node.data.len() < end {
        node.data.resize(end, 0);
    }
    node.data[start..end].copy_from_slice(&args.data);
    node.attributes.size = node.data.len() as u64;
    node.attributes.used = node.attributes.size;
    Ok(nfs3::WriteOk {
        wcc: nfs3::WccData::after(node.attributes.clone()),
        count: args.data.len() as u32,
        committed: nfs3::stable::FILE_SYNC,
        verifier: [0; nfs3::VERIFIER_SIZE],
    })
}

fn setattr(tree: &mut Tree, args: &nfs3::SetAttrArgs, cred: &Credential) -> Result<Attributes, u32> {
    let id = tree.resolve(&args.object)?;
    let node = tree.nodes.get_mut(&id).ok_or(status::STALE)?;
    let changes = &args.attributes;
    let owner_only = changes.mode.is_some() || changes.uid.is_some() || changes.gid.is_some();
    if owner_only && node.attributes.uid != cred.uid {
        return Err(status::PERM);
    }
    if let Some(mode) = changes.mode {
        node.attributes.mode = mode & 0o7777;
    }
    if let Some(uid) = changes.uid {
        node.attributes.uid = uid;
    }
    if let Some(gid) = changes.gid {
        node.attributes.gid = gid;
    }
    if let Some(size) = changes.size {
        node.data.resize(size as usize, 0);
        node.attributes.size = size;
        node.attributes.used = size;
    }
    Ok(node.attributes.clone())
}

fn create(tree: &mut Tree, args: &nfs3::CreateArgs, cred: &Credential) -> Result<u64, u32> {
    let dir = tree.resolve(&args.place.dir)?;
    tree.check(dir, cred, WRITE | EXEC)?;
    let attrs = match &args.how {
        nfs3::CreateHow::Unchecked(attrs) | nfs3::CreateHow::Guarded(attrs) => attrs.clone(),
        nfs3::CreateHow::Exclusive(_) => Default::default(),
    };
    let existing = tree
        .nodes
        .get(&dir)
        .and_then(|node| node.children.get(&args.place.name).copied());
    match (existing, &args.how) {
        (Some(_), nfs3::CreateHow::Guarded(_)) => Err(status::EXIST),
        (Some(id), _) => Ok(id),
        (None, _) => {
            let id = tree.add(
                dir,
                &args.place.name,
                FileType::Regular,
                cred.uid,
                attrs.mode.unwrap_or(0o644),
                b"",
            );
            if let Some(node) = tree.nodes.get_mut(&id) {
                node.attributes.gid = cred.gid;
            }
            Ok(id)
        }
    }
}

fn remove(tree: &mut Tree, args: &nfs3::DirOpArgs3, cred: &Credential) -> Result<(), u32> {
    let dir = tree.resolve(&args.dir)?;
    tree.check(dir, cred, WRITE | EXEC)?;
    let id = tree
        .nodes
        .get_mut(&dir)
        .and_then(|node| node.children.remove(&args.name))
        .ok_or(status::NOENT)?;
    tree.nodes.remove(&id);
    Ok(())
}

fn readdir(tree: &Tree, args: &nfs3::ReadDirArgs, cred: &Credential) -> Result<nfs3::ReadDirOk, u32> {
    let dir = tree.resolve(&args.dir)?;
    tree.check(dir, cred, READ)?;
    let node = tree.nodes.get(&dir).ok_or(status::STALE)?;
    let entries = node
        .children
        .iter()
        .enumerate()
        .skip(args.cookie as usize)
        .map(|(i, (name, id))| DirEntry {
            name: name.clone(),
            fileid: *id,
            cookie: i as u64 + 1,
        })
        .collect();
    Ok(nfs3::ReadDirOk {
        dir_attributes: None,
        cookie_verifier: [0; nfs3::VERIFIER_SIZE],
        entries,
        eof: true,
    })
}
