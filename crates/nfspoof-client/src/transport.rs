//! RPC transport: TCP with record marking, or UDP datagrams
//!
//! ```text
//! callers ──► send_and_wait(xid) ──► [writer lock] ──► socket
//!                  │                                      │
//!                  │ pending: xid → oneshot               │
//!                  ◄───────────── reader task ◄───────────┘
//! ```
//!
//! Many calls may be outstanding at once; the reader task matches each reply
//! to its caller by xid. When the connection drops every pending call fails
//! with [`ClientError::Connection`] and the next call reconnects.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use nfspoof_core::rpc::peek_xid;
use nfspoof_core::{TransportKind, MAX_RECORD_SIZE};

use crate::error::ClientError;

/// High bit of a record-marking header
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Source ports tried when a privileged port is requested
const RESERVED_PORTS: Range<u16> = 600..1024;

const MAX_DATAGRAM: usize = 65536;

type ReplySlot = oneshot::Sender<Result<Bytes, ClientError>>;
type PendingMap = Arc<DashMap<u32, ReplySlot>>;

/// Read one complete record-marked message, reassembling fragments
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Bytes> {
    let mut record = BytesMut::new();
    loop {
        let header = reader.read_u32().await?;
        let len = (header & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record exceeds {} bytes", MAX_RECORD_SIZE),
            ));
        }
        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..]).await?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

/// Write `message` as a single last fragment
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, message: &[u8]) -> io::Result<()> {
    if message.len() > MAX_RECORD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record exceeds {} bytes", MAX_RECORD_SIZE),
        ));
    }
    let mut frame = BytesMut::with_capacity(4 + message.len());
    frame.put_u32(LAST_FRAGMENT | message.len() as u32);
    frame.extend_from_slice(message);
    writer.write_all(&frame).await
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub addr: SocketAddr,
    pub kind: TransportKind,
    pub connect_timeout: Duration,
    /// Default per-call timeout
    pub request_timeout: Duration,
    /// Bind a source port in 600..1024
    pub reserved_port: bool,
}

impl TransportConfig {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: TransportKind::Tcp,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reserved_port: false,
        }
    }
}

enum Writer {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

struct Connection {
    writer: Mutex<Writer>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn shut(&self, reason: &str) {
        self.alive.store(false, Ordering::Release);
        self.reader.abort();
        fail_all(&self.pending, reason);
    }

    async fn write(&self, message: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            Writer::Tcp(stream) => write_record(stream, message).await,
            Writer::Udp(socket) => socket.send(message).await.map(|_| ()),
        }
    }
}

/// Forgets a call's reply slot however the call ends, including cancellation
struct PendingGuard {
    pending: PendingMap,
    xid: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.xid);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn fail_all(pending: &DashMap<u32, ReplySlot>, reason: &str) {
    let xids: Vec<u32> = pending.iter().map(|entry| *entry.key()).collect();
    for xid in xids {
        if let Some((_, slot)) = pending.remove(&xid) {
            let _ = slot.send(Err(ClientError::Connection(reason.to_string())));
        }
    }
}

fn dispatch(pending: &DashMap<u32, ReplySlot>, message: Bytes) {
    match peek_xid(&message) {
        Some(xid) => match pending.remove(&xid) {
            Some((_, slot)) => {
                trace!("reply for xid {:#x} ({} bytes)", xid, message.len());
                let _ = slot.send(Ok(message));
            }
            None => trace!("discarding reply for unknown xid {:#x}", xid),
        },
        None => trace!("discarding {}-byte runt message", message.len()),
    }
}

async fn tcp_reader(mut stream: OwnedReadHalf, pending: PendingMap, alive: Arc<AtomicBool>) {
    let reason = loop {
        match read_record(&mut stream).await {
            Ok(record) => dispatch(&pending, record),
            Err(e) => break e.to_string(),
        }
    };
    debug!("tcp reader stopped: {}", reason);
    alive.store(false, Ordering::Release);
    fail_all(&pending, &reason);
}

async fn udp_reader(socket: Arc<UdpSocket>, pending: PendingMap, alive: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let reason = loop {
        match socket.recv(&mut buf).await {
            Ok(n) => dispatch(&pending, Bytes::copy_from_slice(&buf[..n])),
            Err(e) => break e.to_string(),
        }
    };
    debug!("udp reader stopped: {}", reason);
    alive.store(false, Ordering::Release);
    fail_all(&pending, &reason);
}

fn unspecified(remote: SocketAddr, port: u16) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

fn xid_seed() -> u32 {
    getrandom::u32().unwrap_or_else(|e| {
        warn!("no OS randomness for xid seed ({}), using the clock", e);
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
            .unwrap_or(0)
    })
}

/// One logical connection to one server port, lazily (re)established
pub struct Transport {
    config: TransportConfig,
    next_xid: AtomicU32,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            next_xid: AtomicU32::new(xid_seed()),
            connection: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Allocate a transaction id
    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one call and wait for the reply carrying the same xid
    ///
    /// A timed-out call is abandoned, not retried; a late reply is discarded.
    /// If the caller drops this future the record is still written whole
    /// and the reply slot is released.
    pub async fn send_and_wait(
        &self,
        xid: u32,
        message: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let conn = self.connection().await?;
        let (tx, rx) = oneshot::channel();
        conn.pending.insert(xid, tx);
        let _slot = PendingGuard {
            pending: conn.pending.clone(),
            xid,
        };
        if !conn.is_alive() {
            return Err(ClientError::Connection("connection lost".into()));
        }

        // The write runs in its own task so a cancelled caller cannot leave
        // half a record on the stream
        let writer = conn.clone();
        let record = Bytes::copy_from_slice(message);
        let written = tokio::spawn(async move {
            let result = writer.write(&record).await;
            if let Err(e) = &result {
                writer.shut(&e.to_string());
            }
            result
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("write to {} failed: {}", self.config.addr, e);
                return Err(ClientError::connection(e));
            }
            Err(e) => {
                conn.shut("write task failed");
                return Err(ClientError::Connection(e.to_string()));
            }
        }
        trace!("sent xid {:#x} ({} bytes)", xid, message.len());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Connection("reply slot dropped".into())),
            Err(_) => {
                debug!("xid {:#x} to {} timed out after {:?}", xid, self.config.addr, timeout);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Drop the current connection (failing its pending calls) and connect again
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            old.shut("transport reconnecting");
        }
        *slot = Some(Arc::new(self.connect().await?));
        Ok(())
    }

    /// Close the connection; the next call reconnects
    pub async fn close(&self) {
        if let Some(old) = self.connection.lock().await.take() {
            old.shut("transport closed");
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
            debug!("connection to {} is dead, reconnecting", self.config.addr);
        }
        let conn = Arc::new(self.connect().await?);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let (writer, reader) = match self.config.kind {
            TransportKind::Tcp => {
                let stream = tokio::time::timeout(self.config.connect_timeout, self.connect_tcp())
                    .await
                    .map_err(|_| ClientError::Timeout)??;
                stream.set_nodelay(true).map_err(ClientError::connection)?;
                let (read_half, write_half) = stream.into_split();
                let reader = tokio::spawn(tcp_reader(read_half, pending.clone(), alive.clone()));
                (Writer::Tcp(write_half), reader)
            }
            TransportKind::Udp => {
                let socket = Arc::new(self.bind_udp().await?);
                socket
                    .connect(self.config.addr)
                    .await
                    .map_err(ClientError::connection)?;
                let reader = tokio::spawn(udp_reader(socket.clone(), pending.clone(), alive.clone()));
                (Writer::Udp(socket), reader)
            }
        };

        info!("connected to {} over {:?}", self.config.addr, self.config.kind);
        Ok(Connection {
            writer: Mutex::new(writer),
            pending,
            alive,
            reader,
        })
    }

    async fn connect_tcp(&self) -> Result<TcpStream, ClientError> {
        let addr = self.config.addr;
        if self.config.reserved_port {
            for port in RESERVED_PORTS.rev() {
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4(),
                    SocketAddr::V6(_) => TcpSocket::new_v6(),
                }
                .map_err(ClientError::connection)?;
                match socket.bind(unspecified(addr, port)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(e) => {
                        warn!("cannot bind a reserved port ({}), using an ephemeral port", e);
                        break;
                    }
                }
                match socket.connect(addr).await {
                    Ok(stream) => {
                        debug!("connected to {} from reserved port {}", addr, port);
                        return Ok(stream);
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
                        ) =>
                    {
                        continue
                    }
                    Err(e) => return Err(ClientError::connection(e)),
                }
            }
        }
        TcpStream::connect(addr)
            .await
            .map_err(ClientError::connection)
    }

    async fn bind_udp(&self) -> Result<UdpSocket, ClientError> {
        let addr = self.config.addr;
        if self.config.reserved_port {
            for port in RESERVED_PORTS.rev() {
                match UdpSocket::bind(unspecified(addr, port)).await {
                    Ok(socket) => return Ok(socket),
                    Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(e) => {
                        warn!("cannot bind a reserved port ({}), using an ephemeral port", e);
                        break;
                    }
                }
            }
        }
        UdpSocket::bind(unspecified(addr, 0))
            .await
            .map_err(ClientError::connection)
    }
}
