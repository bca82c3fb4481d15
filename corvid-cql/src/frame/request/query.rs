use std::borrow::Cow;

use crate::frame::{frame_errors::ParseError, types::SerialConsistency};
use bytes::{BufMut, Bytes};

use crate::{
    frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    frame::types,
    frame::value::SerializedValues,
};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const FLAG_WITH_NAMES_FOR_VALUES: u8 = 0x40;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP
    | FLAG_WITH_NAMES_FOR_VALUES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let consistency = types::read_consistency(buf)?;

        let flags = *buf
            .first()
            .ok_or_else(|| ParseError::BadIncomingData("Missing query flags".to_owned()))?;
        *buf = &buf[1..];
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(ParseError::BadIncomingData(format!(
                "Specified flags are not recognised: {:02x}",
                unknown_flags
            )));
        }
        if flags & FLAG_WITH_NAMES_FOR_VALUES != 0 {
            return Err(ParseError::BadIncomingData(
                "Named values are not supported".to_owned(),
            ));
        }

        let values = Cow::Owned(if flags & FLAG_VALUES != 0 {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        });

        let page_size = (flags & FLAG_PAGE_SIZE != 0)
            .then(|| types::read_int(buf))
            .transpose()?;
        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let consistency = types::read_consistency(buf)?;
            Some(SerialConsistency::try_from(consistency).map_err(|_| {
                ParseError::BadIncomingData(format!(
                    "Expected SerialConsistency, got regular Consistency {}",
                    consistency
                ))
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
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            skip_metadata: flags & FLAG_SKIP_METADATA != 0,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Consistency;

    #[test]
    fn query_survives_server_side_parsing() {
        let mut values = SerializedValues::new();
        values.add_value(&42_i32).unwrap();
        values.add_value(&"pk").unwrap();

        let query = Query {
            contents: Cow::Borrowed("SELECT * FROM ks.t WHERE a = ? AND b = ?"),
            parameters: QueryParameters {
                consistency: Consistency::Two,
                serial_consistency: Some(SerialConsistency::LocalSerial),
                timestamp: Some(1_700_000_000),
                page_size: Some(5000),
                paging_state: Some(Bytes::from_static(b"\x01\x02")),
                skip_metadata: false,
                values: Cow::Owned(values),
            },
        };

        let mut buf = Vec::new();
        query.serialize(&mut buf).unwrap();
        let parsed = Query::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut buf = Vec::new();
        types::write_consistency(Consistency::One, &mut buf);
        buf.push(0x80);
        assert!(QueryParameters::deserialize(&mut &buf[..]).is_err());
    }
}
