//! Murmur3 partitioner, in the variant Cassandra uses.
//!
//! Cassandra's implementation sign-extends the tail bytes, which differs
//! from the reference x64_128 Murmur3; tokens must match the server's, so
//! the quirk is kept.

use std::num::Wrapping;

use bytes::Buf;
use corvid_cql::frame::value::{RawValue, SerializedValues};
use thiserror::Error;

use crate::routing::Token;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenCalculationError {
    #[error("Partition key component {index} is null or unset")]
    NullPartitionKeyComponent { index: usize },

    #[error("Partition key component too long: {0} bytes, max is 65535")]
    ValueTooLong(usize),

    #[error("Partition key index {index} out of bounds, got {count} values")]
    IndexOutOfBounds { index: usize, count: usize },
}

/// Computes tokens of partition keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Partitioner;

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping(v.0.rotate_left(n))
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k
}

impl Murmur3Partitioner {
    /// Token of an already serialized partition key.
    pub fn hash(&self, partition_key: &[u8]) -> Token {
        let mut h1 = Wrapping(0_i64);
        let mut h2 = Wrapping(0_i64);

        let mut blocks = partition_key;
        while blocks.len() >= 16 {
            let mut k1 = Wrapping(blocks.get_i64_le());
            let mut k2 = Wrapping(blocks.get_i64_le());

            k1 *= C1;
            k1 = rotl64(k1, 31);
            k1 *= C2;
            h1 ^= k1;

            h1 = rotl64(h1, 27);
            h1 += h2;
            h1 = h1 * Wrapping(5) + Wrapping(0x52dc_e729);

            k2 *= C2;
            k2 = rotl64(k2, 33);
            k2 *= C1;
            h2 ^= k2;

            h2 = rotl64(h2, 31);
            h2 += h1;
            h2 = h2 * Wrapping(5) + Wrapping(0x3849_5ab5);
        }

        let tail = blocks;
        let mut k1 = Wrapping(0_i64);
        let mut k2 = Wrapping(0_i64);

        if tail.len() > 8 {
            for i in (8..tail.len()).rev() {
                // sign extension of the tail byte
                k2 ^= Wrapping(tail[i] as i8 as i64) << ((i - 8) * 8);
            }
            k2 *= C2;
            k2 = rotl64(k2, 33);
            k2 *= C1;
            h2 ^= k2;
        }

        if !tail.is_empty() {
            for i in (0..tail.len().min(8)).rev() {
                k1 ^= Wrapping(tail[i] as i8 as i64) << (i * 8);
            }
            k1 *= C1;
            k1 = rotl64(k1, 31);
            k1 *= C2;
            h1 ^= k1;
        }

        let len = Wrapping(partition_key.len() as i64);
        h1 ^= len;
        h2 ^= len;

        h1 += h2;
        h2 += h1;

        h1 = fmix(h1);
        h2 = fmix(h2);

        h1 += h2;

        Token::new(h1.0)
    }

    /// Token of a partition key given as bound values, picking the key
    /// components at `pk_indexes` (in partition key order).
    ///
    /// A single-column key is hashed as is. A composite key is hashed in
    /// its composite form: for each component a u16 length, the bytes, and
    /// a zero byte.
    pub fn token_for_values(
        &self,
        values: &SerializedValues,
        pk_indexes: &[u16],
    ) -> Result<Token, TokenCalculationError> {
        let raw: Vec<RawValue<'_>> = values.iter().collect();
        let component = |index: u16| -> Result<&[u8], TokenCalculationError> {
            let index = index as usize;
            match raw.get(index) {
                Some(RawValue::Value(v)) => Ok(*v),
                Some(RawValue::Null | RawValue::Unset) => {
                    Err(TokenCalculationError::NullPartitionKeyComponent { index })
                }
                None => Err(TokenCalculationError::IndexOutOfBounds {
                    index,
                    count: raw.len(),
                }),
            }
        };

        if let [single] = pk_indexes {
            return Ok(self.hash(component(*single)?));
        }

        let mut composite = Vec::new();
        for &index in pk_indexes {
            let value = component(index)?;
            let len: u16 = value
                .len()
                .try_into()
                .map_err(|_| TokenCalculationError::ValueTooLong(value.len()))?;
            composite.extend_from_slice(&len.to_be_bytes());
            composite.extend_from_slice(value);
            composite.push(0);
        }
        Ok(self.hash(&composite))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_tracing;
    use assert_matches::assert_matches;

    #[test]
    fn murmur3_matches_server_tokens() {
        setup_tracing();
        for (key, expected) in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_eq!(Murmur3Partitioner.hash(key.as_bytes()).value(), expected);
        }
    }

    #[test]
    fn single_component_key_hashes_raw_bytes() {
        let mut values = SerializedValues::new();
        values.add_value(&"test").unwrap();
        let token = Murmur3Partitioner.token_for_values(&values, &[0]).unwrap();
        assert_eq!(token.value(), -6017608668500074083);
    }

    #[test]
    fn composite_key_uses_composite_encoding() {
        let mut values = SerializedValues::new();
        values.add_value(&"b").unwrap();
        values.add_value(&"a").unwrap();

        // Key order differs from bind order.
        let token = Murmur3Partitioner.token_for_values(&values, &[1, 0]).unwrap();
        let expected = Murmur3Partitioner.hash(&[0, 1, b'a', 0, 0, 1, b'b', 0]);
        assert_eq!(token, expected);
    }

    #[test]
    fn null_component_is_rejected() {
        let mut values = SerializedValues::new();
        values.add_null().unwrap();
        assert_matches!(
            Murmur3Partitioner.token_for_values(&values, &[0]),
            Err(TokenCalculationError::NullPartitionKeyComponent { index: 0 })
        );
        assert_matches!(
            Murmur3Partitioner.token_for_values(&values, &[3]),
            Err(TokenCalculationError::IndexOutOfBounds { index: 3, count: 1 })
        );
    }
}
