//! Portmapper (rpcbind v2) port discovery

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use nfspoof_core::protocol::portmap::{self, Mapping};
use nfspoof_core::{ProtocolError, TransportKind};

use crate::error::ClientError;
use crate::rpc_client::{AuthContext, RpcClient};
use crate::transport::{Transport, TransportConfig};

fn protocol_number(kind: TransportKind) -> u32 {
    match kind {
        TransportKind::Tcp => portmap::IPPROTO_TCP,
        TransportKind::Udp => portmap::IPPROTO_UDP,
    }
}

/// Ask the portmapper at `config.addr` where `program`/`version` listens
///
/// The query itself always goes over `config`'s transport; the port looked up
/// is the one registered for `config.kind`.
pub async fn get_port(
    config: &TransportConfig,
    program: u32,
    version: u32,
) -> Result<u16, ClientError> {
    let transport = Arc::new(Transport::new(TransportConfig {
        reserved_port: false,
        ..config.clone()
    }));
    let rpc = RpcClient::new(
        transport.clone(),
        portmap::PROGRAM,
        portmap::VERSION,
        AuthContext::local(),
    );

    let query = Mapping::query(program, version, protocol_number(config.kind));
    let result: Result<u32, ClientError> = rpc.call(portmap::PROC_GETPORT, &query, None).await;
    transport.close().await;
    let port = result?;

    debug!(
        "portmapper {}: program {} v{} -> port {}",
        config.addr, program, version, port
    );
    match u16::try_from(port) {
        Ok(0) => Err(ProtocolError::NotSupported.into()),
        Ok(port) => Ok(port),
        Err(_) => Err(ClientError::Rpc(format!("portmapper returned port {}", port))),
    }
}

/// `server` with its port replaced
pub fn portmapper_addr(server: SocketAddr, port: u16) -> SocketAddr {
    SocketAddr::new(server.ip(), port)
}
