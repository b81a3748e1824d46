//! ONC-RPC calls for one program version over one transport
//!
//! Every call is stamped with the AUTH_UNIX credential it is given; there is
//! no implicit identity here. Portmapper queries go out with AUTH_NONE.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use nfspoof_core::rpc::{AuthUnix, CallHeader, OpaqueAuth, ReplyHeader};
use nfspoof_core::xdr::{Decoder, Encoder, FromXdr, ToXdr};
use nfspoof_core::Credential;

use crate::error::ClientError;
use crate::transport::Transport;

/// AUTH_UNIX fields that do not come from the spoofed identity
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub machine_name: String,
    pub stamp: u32,
}

impl AuthContext {
    pub fn new(machine_name: impl Into<String>, stamp: u32) -> Self {
        Self {
            machine_name: machine_name.into(),
            stamp,
        }
    }

    /// Local host name, stamped with the current time
    pub fn local() -> Self {
        let machine_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        Self::new(machine_name, nfspoof_core::Timestamp::now().seconds)
    }

    fn auth(&self, credential: Option<&Credential>) -> OpaqueAuth {
        match credential {
            Some(credential) => {
                OpaqueAuth::Unix(AuthUnix::new(self.stamp, self.machine_name.clone(), credential))
            }
            None => OpaqueAuth::None,
        }
    }
}

/// Client for a single (program, version) pair
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<Transport>,
    program: u32,
    version: u32,
    auth: AuthContext,
}

impl RpcClient {
    pub fn new(transport: Arc<Transport>, program: u32, version: u32, auth: AuthContext) -> Self {
        Self {
            transport,
            program,
            version,
            auth,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Same transport, another program version
    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Issue one call with the transport's default timeout
    pub async fn call<A, R>(
        &self,
        procedure: u32,
        args: &A,
        credential: Option<&Credential>,
    ) -> Result<R, ClientError>
    where
        A: ToXdr + ?Sized,
        R: FromXdr,
    {
        self.call_with_timeout(procedure, args, credential, self.transport.request_timeout())
            .await
    }

    pub async fn call_with_timeout<A, R>(
        &self,
        procedure: u32,
        args: &A,
        credential: Option<&Credential>,
        timeout: Duration,
    ) -> Result<R, ClientError>
    where
        A: ToXdr + ?Sized,
        R: FromXdr,
    {
        let xid = self.transport.next_xid();
        let header = CallHeader::new(
            xid,
            self.program,
            self.version,
            procedure,
            self.auth.auth(credential),
        );

        let mut encoder = Encoder::with_capacity(256);
        header.encode(&mut encoder)?;
        args.encode(&mut encoder)?;
        let message = encoder.finish();

        if let Some(credential) = credential {
            trace!(
                "call xid={:#x} prog={} vers={} proc={} uid={} gid={}",
                xid,
                self.program,
                self.version,
                procedure,
                credential.uid,
                credential.gid
            );
        }

        let reply = self.transport.send_and_wait(xid, &message, timeout).await?;
        let mut decoder = Decoder::new(&reply);
        let reply_header = ReplyHeader::decode(&mut decoder)?;
        if reply_header.xid != xid {
            return Err(ClientError::Rpc(format!(
                "reply xid {:#x} does not match call {:#x}",
                reply_header.xid, xid
            )));
        }
        reply_header.check()?;

        let result = R::decode(&mut decoder)?;
        if decoder.remaining() > 0 {
            trace!("ignoring {} trailing reply bytes", decoder.remaining());
        }
        Ok(result)
    }

    /// NULL procedure ping
    pub async fn null(&self) -> Result<(), ClientError> {
        self.call(0, &(), None).await
    }
}
