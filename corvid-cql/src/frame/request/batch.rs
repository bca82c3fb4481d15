use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::ParseError;
use std::borrow::Cow;

use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types::{self, SerialConsistency},
    value::SerializedValues,
};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'b> {
    pub statements: Vec<BatchStatement<'b>>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    /// One value list per statement, in statement order.
    pub values: Vec<Cow<'b, SerializedValues>>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(ParseError::BadIncomingData(format!(
                "Bad BatchType value: {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Bytes },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }
        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let kind = read_u8(buf)?;
        match kind {
            0 => Ok(Self::Query {
                text: Cow::Owned(types::read_long_string(buf)?.to_owned()),
            }),
            1 => Ok(Self::Prepared {
                id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            }),
            _ => Err(ParseError::BadIncomingData(format!(
                "Unexpected batch statement kind: {}",
                kind
            ))),
        }
    }
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, ParseError> {
    let (first, rest) = buf.split_first().ok_or(ParseError::TooFewBytesReceived {
        expected: 1,
        received: 0,
    })?;
    *buf = rest;
    Ok(*first)
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        if self.statements.len() != self.values.len() {
            return Err(ParseError::BadDataToSerialize(format!(
                "Length of provided values must be equal to number of batch statements \
                    (got {} values, {} statements)",
                self.values.len(),
                self.statements.len()
            )));
        }

        // Serializing type of batch
        buf.put_u8(self.batch_type as u8);

        // Serializing queries
        types::write_short(self.statements.len().try_into()?, buf);
        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        // Serializing consistency
        types::write_consistency(self.consistency, buf);

        // Serializing flags
        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let batch_type = BatchType::try_from(read_u8(buf)?)?;
        let statements_count = types::read_short(buf)? as usize;

        let mut statements = Vec::with_capacity(statements_count);
        let mut values = Vec::with_capacity(statements_count);
        for _ in 0..statements_count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(Cow::Owned(SerializedValues::new_from_frame(buf)?));
        }

        let consistency = types::read_consistency(buf)?;
        let flags = read_u8(buf)?;

        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let c = types::read_consistency(buf)?;
            Some(SerialConsistency::try_from(c).map_err(|_| {
                ParseError::BadIncomingData(format!("Expected serial consistency, got {}", c))
            })?)
        } else {
            None
        };
        let timestamp = if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            Some(types::read_long(buf)?)
        } else {
            None
        };

        Ok(Self {
            statements,
            batch_type,
            consistency,
            serial_consistency,
            timestamp,
            values,
        })
    }
}
