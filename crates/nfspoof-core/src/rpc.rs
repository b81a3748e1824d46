//! ONC-RPC v2 message envelope (RFC 5531)
//!
//! Calls carry an AUTH_UNIX credential built from the spoofed identity and an
//! AUTH_NONE verifier. Both call and reply headers round-trip so the same code
//! serves the client and the in-process test server.

use crate::credential::Credential;
use crate::error::{ProtocolError, XdrError};
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

/// RPC protocol version
pub const RPC_VERSION: u32 = 2;

pub const AUTH_NONE: u32 = 0;
pub const AUTH_UNIX: u32 = 1;

/// Upper bound on an `opaque_auth` body
pub const MAX_AUTH_BYTES: usize = 400;

/// Upper bound on the AUTH_UNIX machine name
pub const MAX_MACHINE_NAME: usize = 255;

/// AUTH_UNIX gid array bound imposed by the wire format
pub const MAX_AUTH_UNIX_GIDS: usize = 16;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

/// AUTH_UNIX / AUTH_SYS credential body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUnix {
    pub stamp: u32,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl AuthUnix {
    pub fn new(stamp: u32, machine_name: impl Into<String>, credential: &Credential) -> Self {
        Self {
            stamp,
            machine_name: machine_name.into(),
            uid: credential.uid,
            gid: credential.gid,
            gids: credential.supplementary_gids.clone(),
        }
    }

    pub fn credential(&self) -> Credential {
        Credential::new(self.uid, self.gid, self.gids.clone())
    }
}

impl ToXdr for AuthUnix {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(self.stamp);
        encoder.put_string_bounded(&self.machine_name, MAX_MACHINE_NAME, "machinename")?;
        encoder.put_u32(self.uid);
        encoder.put_u32(self.gid);
        if self.gids.len() > MAX_AUTH_UNIX_GIDS {
            return Err(XdrError::TooLong {
                field: "gids",
                len: self.gids.len(),
                max: MAX_AUTH_UNIX_GIDS,
            });
        }
        encoder.put_array(&self.gids)
    }
}

impl FromXdr for AuthUnix {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            stamp: decoder.get_u32()?,
            machine_name: decoder.get_string_bounded(MAX_MACHINE_NAME, "machinename")?,
            uid: decoder.get_u32()?,
            gid: decoder.get_u32()?,
            gids: decoder.get_array_bounded(MAX_AUTH_UNIX_GIDS, "gids")?,
        })
    }
}

/// `opaque_auth`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpaqueAuth {
    None,
    Unix(AuthUnix),
    Other { flavor: u32, body: Vec<u8> },
}

impl ToXdr for OpaqueAuth {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        match self {
            OpaqueAuth::None => {
                encoder.put_u32(AUTH_NONE);
                encoder.put_opaque(&[])
            }
            OpaqueAuth::Unix(auth) => {
                let mut body = Encoder::new();
                auth.encode(&mut body)?;
                encoder.put_u32(AUTH_UNIX);
                encoder.put_opaque_bounded(&body.finish(), MAX_AUTH_BYTES, "auth body")
            }
            OpaqueAuth::Other { flavor, body } => {
                encoder.put_u32(*flavor);
                encoder.put_opaque_bounded(body, MAX_AUTH_BYTES, "auth body")
            }
        }
    }
}

impl FromXdr for OpaqueAuth {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let flavor = decoder.get_u32()?;
        let body = decoder.get_opaque_bounded(MAX_AUTH_BYTES, "auth body")?;
        match flavor {
            AUTH_NONE if body.is_empty() => Ok(OpaqueAuth::None),
            AUTH_UNIX => {
                let mut inner = Decoder::new(body);
                let auth = AuthUnix::decode(&mut inner)?;
                inner.finish()?;
                Ok(OpaqueAuth::Unix(auth))
            }
            _ => Ok(OpaqueAuth::Other {
                flavor,
                body: body.to_vec(),
            }),
        }
    }
}

/// Call header; procedure arguments follow it on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub rpc_version: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: OpaqueAuth,
    pub verifier: OpaqueAuth,
}

impl CallHeader {
    pub fn new(xid: u32, program: u32, version: u32, procedure: u32, credential: OpaqueAuth) -> Self {
        Self {
            xid,
            rpc_version: RPC_VERSION,
            program,
            version,
            procedure,
            credential,
            verifier: OpaqueAuth::None,
        }
    }

    /// AUTH_UNIX identity carried by this call, if any
    pub fn auth_unix(&self) -> Option<&AuthUnix> {
        match &self.credential {
            OpaqueAuth::Unix(auth) => Some(auth),
            _ => None,
        }
    }
}

impl ToXdr for CallHeader {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(self.xid);
        encoder.put_u32(MSG_CALL);
        encoder.put_u32(self.rpc_version);
        encoder.put_u32(self.program);
        encoder.put_u32(self.version);
        encoder.put_u32(self.procedure);
        self.credential.encode(encoder)?;
        self.verifier.encode(encoder)
    }
}

impl FromXdr for CallHeader {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let xid = decoder.get_u32()?;
        match decoder.get_u32()? {
            MSG_CALL => {}
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "msg_type (expected CALL)",
                    value,
                })
            }
        }
        Ok(Self {
            xid,
            rpc_version: decoder.get_u32()?,
            program: decoder.get_u32()?,
            version: decoder.get_u32()?,
            procedure: decoder.get_u32()?,
            credential: decoder.decode()?,
            verifier: decoder.decode()?,
        })
    }
}

/// `accept_stat` of an accepted reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// `reject_stat` of a denied reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Accepted { verifier: OpaqueAuth, stat: AcceptStat },
    Denied(RejectStat),
}

/// Reply header; on SUCCESS the procedure results follow it on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub status: ReplyStatus,
}

impl ReplyHeader {
    pub fn success(xid: u32) -> Self {
        Self::accepted(xid, AcceptStat::Success)
    }

    pub fn accepted(xid: u32, stat: AcceptStat) -> Self {
        Self {
            xid,
            status: ReplyStatus::Accepted {
                verifier: OpaqueAuth::None,
                stat,
            },
        }
    }

    pub fn denied(xid: u32, stat: RejectStat) -> Self {
        Self {
            xid,
            status: ReplyStatus::Denied(stat),
        }
    }

    /// Translate RPC-level rejection into the protocol error taxonomy
    pub fn check(&self) -> Result<(), ProtocolError> {
        match &self.status {
            ReplyStatus::Accepted { stat, .. } => match stat {
                AcceptStat::Success => Ok(()),
                AcceptStat::ProgUnavail => Err(ProtocolError::NotSupported),
                AcceptStat::ProcUnavail => Err(ProtocolError::NotSupported),
                AcceptStat::ProgMismatch { low, high } => Err(ProtocolError::VersionMismatch(
                    format!("server supports program versions {}..={}", low, high),
                )),
                AcceptStat::GarbageArgs => {
                    Err(ProtocolError::Io("server could not decode arguments".into()))
                }
                AcceptStat::SystemErr => Err(ProtocolError::Io("server system error".into())),
            },
            ReplyStatus::Denied(RejectStat::RpcMismatch { low, high }) => Err(
                ProtocolError::VersionMismatch(format!("server supports RPC {}..={}", low, high)),
            ),
            ReplyStatus::Denied(RejectStat::AuthError(_)) => Err(ProtocolError::AccessDenied),
        }
    }
}

impl ToXdr for ReplyHeader {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(self.xid);
        encoder.put_u32(MSG_REPLY);
        match &self.status {
            ReplyStatus::Accepted { verifier, stat } => {
                encoder.put_u32(0);
                verifier.encode(encoder)?;
                match stat {
                    AcceptStat::Success => encoder.put_u32(0),
                    AcceptStat::ProgUnavail => encoder.put_u32(1),
                    AcceptStat::ProgMismatch { low, high } => {
                        encoder.put_u32(2);
                        encoder.put_u32(*low);
                        encoder.put_u32(*high);
                    }
                    AcceptStat::ProcUnavail => encoder.put_u32(3),
                    AcceptStat::GarbageArgs => encoder.put_u32(4),
                    AcceptStat::SystemErr => encoder.put_u32(5),
                }
            }
            ReplyStatus::Denied(stat) => {
                encoder.put_u32(1);
                match stat {
                    RejectStat::RpcMismatch { low, high } => {
                        encoder.put_u32(0);
                        encoder.put_u32(*low);
                        encoder.put_u32(*high);
                    }
                    RejectStat::AuthError(why) => {
                        encoder.put_u32(1);
                        encoder.put_u32(*why);
                    }
                }
            }
        }
        Ok(())
    }
}

impl FromXdr for ReplyHeader {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        let xid = decoder.get_u32()?;
        match decoder.get_u32()? {
            MSG_REPLY => {}
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "msg_type (expected REPLY)",
                    value,
                })
            }
        }
        let status = match decoder.get_u32()? {
            0 => {
                let verifier = decoder.decode()?;
                let stat = match decoder.get_u32()? {
                    0 => AcceptStat::Success,
                    1 => AcceptStat::ProgUnavail,
                    2 => AcceptStat::ProgMismatch {
                        low: decoder.get_u32()?,
                        high: decoder.get_u32()?,
                    },
                    3 => AcceptStat::ProcUnavail,
                    4 => AcceptStat::GarbageArgs,
                    5 => AcceptStat::SystemErr,
                    value => {
                        return Err(XdrError::InvalidDiscriminant {
                            what: "accept_stat",
                            value,
                        })
                    }
                };
                ReplyStatus::Accepted { verifier, stat }
            }
            1 => ReplyStatus::Denied(match decoder.get_u32()? {
                0 => RejectStat::RpcMismatch {
                    low: decoder.get_u32()?,
                    high: decoder.get_u32()?,
                },
                1 => RejectStat::AuthError(decoder.get_u32()?),
                value => {
                    return Err(XdrError::InvalidDiscriminant {
                        what: "reject_stat",
                        value,
                    })
                }
            }),
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "reply_stat",
                    value,
                })
            }
        };
        Ok(Self { xid, status })
    }
}

/// Transaction id of a raw message, without decoding the rest
pub fn peek_xid(message: &[u8]) -> Option<u32> {
    message
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
