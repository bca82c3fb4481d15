use crate::frame::frame_errors::ParseError;
use bytes::Bytes;

use crate::{
    frame::request::{query, DeserializableRequest, RequestOpcode, SerializableRequest},
    frame::types,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: query::QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        // Serializing statement id
        types::write_short_bytes(&self.id[..], buf)?;

        // Serializing params
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let parameters = query::QueryParameters::deserialize(buf)?;

        Ok(Self { id, parameters })
    }
}
