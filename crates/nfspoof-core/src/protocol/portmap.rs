//! Portmapper v2 (RFC 1833) GETPORT

use crate::error::XdrError;
use crate::xdr::{Decoder, Encoder, FromXdr, ToXdr};

pub const PROGRAM: u32 = 100000;
pub const VERSION: u32 = 2;
pub const PORT: u16 = 111;

pub const PROC_NULL: u32 = 0;
pub const PROC_GETPORT: u32 = 3;

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

/// GETPORT argument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
    pub port: u32,
}

impl Mapping {
    pub fn query(program: u32, version: u32, protocol: u32) -> Self {
        Self {
            program,
            version,
            protocol,
            port: 0,
        }
    }
}

impl ToXdr for Mapping {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(self.program);
        encoder.put_u32(self.version);
        encoder.put_u32(self.protocol);
        encoder.put_u32(self.port);
        Ok(())
    }
}

impl FromXdr for Mapping {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            program: decoder.get_u32()?,
            version: decoder.get_u32()?,
            protocol: decoder.get_u32()?,
            port: decoder.get_u32()?,
        })
    }
}
