//! Pre-serialized bound values.
//!
//! Typed value serialization is left to the caller; the driver only needs
//! each value's `[bytes]` form, both to put it on the wire and to hash
//! partition-key components into a routing token.

use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use bytes::BufMut;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Every value bound to a statement must implement this trait.
/// `serialize()` writes the value as `[bytes]` (i32 length followed by contents).
pub trait Value {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig>;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Value too big to be sent in a request - max 2GiB allowed")]
pub struct ValueTooBig;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65 535 values can be sent in a request")]
    TooManyValues,
    #[error(transparent)]
    ValueTooBig(#[from] ValueTooBig),
}

/// One serialized value, as it appears inside [`SerializedValues`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

/// Keeps a buffer with serialized values.
/// Allows adding new values and iterating over serialized ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// A const empty instance, useful for taking references
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub fn add_value(&mut self, val: &impl Value) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        let len_before = self.serialized_values.len();
        if let Err(e) = val.serialize(&mut self.serialized_values) {
            self.serialized_values.truncate(len_before);
            return Err(e.into());
        }
        self.element_count += 1;
        Ok(())
    }

    pub fn add_null(&mut self) -> Result<(), SerializeValuesError> {
        self.add_marker(-1)
    }

    pub fn add_unset(&mut self) -> Result<(), SerializeValuesError> {
        self.add_marker(-2)
    }

    fn add_marker(&mut self, marker: i32) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        self.serialized_values.put_i32(marker);
        self.element_count += 1;
        Ok(())
    }

    pub fn iter(&self) -> SerializedValuesIterator<'_> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
        }
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized_values.len()
    }

    pub(crate) fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put(&self.serialized_values[..])
    }

    pub(crate) fn new_from_frame(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let element_count = types::read_short(buf)?;
        let values_start = *buf;
        for _ in 0..element_count {
            read_raw_value(buf)?;
        }
        let consumed = values_start.len() - buf.len();
        Ok(SerializedValues {
            serialized_values: values_start[..consumed].to_vec(),
            element_count,
        })
    }
}

fn read_raw_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, ParseError> {
    let len = types::read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(types::read_raw_bytes(len as usize, buf)?)),
        len => Err(ParseError::InvalidValueLength(len)),
    }
}

#[derive(Clone, Copy)]
pub struct SerializedValuesIterator<'a> {
    serialized_values: &'a [u8],
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.serialized_values.is_empty() {
            return None;
        }

        // Contents were validated on insertion, so a parse failure means
        // the buffer ended; stop iterating in that case.
        read_raw_value(&mut self.serialized_values).ok()
    }
}

fn put_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ValueTooBig> {
    let len: i32 = bytes.len().try_into().map_err(|_| ValueTooBig)?;
    buf.put_i32(len);
    buf.put_slice(bytes);
    Ok(())
}

impl Value for i8 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(1);
        buf.put_i8(*self);
        Ok(())
    }
}

impl Value for i16 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(2);
        buf.put_i16(*self);
        Ok(())
    }
}

impl Value for i32 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(4);
        buf.put_i32(*self);
        Ok(())
    }
}

impl Value for i64 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(8);
        buf.put_i64(*self);
        Ok(())
    }
}

impl Value for bool {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(1);
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Value for f64 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(8);
        buf.put_f64(*self);
        Ok(())
    }
}

impl Value for &str {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        put_len_prefixed(buf, self.as_bytes())
    }
}

impl Value for String {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        put_len_prefixed(buf, self.as_bytes())
    }
}

impl Value for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        put_len_prefixed(buf, self)
    }
}

impl Value for &[u8] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        put_len_prefixed(buf, self)
    }
}

impl Value for Uuid {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(16);
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Value for IpAddr {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            IpAddr::V4(addr) => {
                buf.put_i32(4);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_i32(16);
                buf.put_slice(&addr.octets());
            }
        }
        Ok(())
    }
}

impl<T: Value> Value for Option<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            Some(val) => val.serialize(buf),
            None => {
                buf.put_i32(-1);
                Ok(())
            }
        }
    }
}

/// Builds a [`SerializedValues`] from a list of heterogeneous values.
#[macro_export]
macro_rules! values {
    ($($val:expr),* $(,)?) => {{
        let mut values = $crate::SerializedValues::new();
        $( values.add_value(&$val).map(|_| ())?; )*
        ::std::result::Result::<$crate::SerializedValues, $crate::frame::value::SerializeValuesError>::Ok(values)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_values_iterate_in_insertion_order() {
        let mut values = SerializedValues::new();
        values.add_value(&7_i32).unwrap();
        values.add_null().unwrap();
        values.add_value(&"abc").unwrap();
        values.add_unset().unwrap();

        assert_eq!(values.element_count(), 4);
        let collected: Vec<_> = values.iter().collect();
        assert_eq!(
            collected,
            vec![
                RawValue::Value(&[0, 0, 0, 7]),
                RawValue::Null,
                RawValue::Value(b"abc"),
                RawValue::Unset,
            ]
        );
    }

    #[test]
    fn serialized_values_request_layout() {
        let mut values = SerializedValues::new();
        values.add_value(&1_i64).unwrap();
        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        assert_eq!(&buf[..2], &[0, 1]);
        assert_eq!(&buf[2..6], &[0, 0, 0, 8]);

        let parsed = SerializedValues::new_from_frame(&mut &buf[..]).unwrap();
        assert_eq!(parsed, values);
    }

    #[test]
    fn values_macro_builds_values() {
        fn build() -> Result<SerializedValues, SerializeValuesError> {
            crate::values!(1_i32, "key", Some(5_i64), None::<i32>)
        }
        let values = build().unwrap();
        assert_eq!(values.element_count(), 4);
    }
}
