use crate::frame::frame_errors::ParseError;

use std::collections::HashMap;

use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "4.0.0";
pub const COMPRESSION: &str = "COMPRESSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

/// Finishes connection negotiation with the options accepted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Startup {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_map(buf)?;
        Ok(Self { options })
    }
}
