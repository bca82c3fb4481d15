use crate::frame::frame_errors::ParseError;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

// Implements Authenticate Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_bytes_opt(self.response.as_ref(), buf)
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let response = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);
        Ok(Self { response })
    }
}
