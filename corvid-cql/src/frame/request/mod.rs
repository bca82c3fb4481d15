//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::ParseError;
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError>;

    fn to_bytes(&self) -> Result<Bytes, ParseError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Not intended for driver's direct usage (as driver has no interest in deserialising CQL requests),
/// but very useful for testing (e.g. asserting that the sent requests have proper parameters set).
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError>;
}

/// A request body parsed on the server side, keyed by its opcode.
#[derive(Debug)]
#[non_exhaustive]
pub enum Request {
    Startup(Startup),
    Options,
    Query(Query<'static>),
    Prepare(String),
    Execute(Execute<'static>),
    Register(Register),
    Batch(Batch<'static>),
    AuthResponse(AuthResponse),
}

impl Request {
    pub fn deserialize(opcode: RequestOpcode, buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(match opcode {
            RequestOpcode::Startup => Request::Startup(Startup::deserialize(buf)?),
            RequestOpcode::Options => Request::Options,
            RequestOpcode::Query => Request::Query(Query::deserialize(buf)?),
            RequestOpcode::Prepare => {
                Request::Prepare(super::types::read_long_string(buf)?.to_owned())
            }
            RequestOpcode::Execute => Request::Execute(Execute::deserialize(buf)?),
            RequestOpcode::Register => Request::Register(Register::deserialize(buf)?),
            RequestOpcode::Batch => Request::Batch(Batch::deserialize(buf)?),
            RequestOpcode::AuthResponse => Request::AuthResponse(AuthResponse::deserialize(buf)?),
        })
    }
}
