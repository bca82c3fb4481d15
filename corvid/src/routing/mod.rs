//! Token-based routing: the token type, the Murmur3 partitioner that
//! hashes partition keys into tokens, and the token map that answers
//! "which nodes own this token".

pub mod partitioner;
pub(crate) mod replication;
pub mod token_map;
mod token_ring;

pub use token_map::TokenMap;
pub(crate) use token_ring::TokenRing;

/// A position on the token ring, the Murmur3 hash of a partition key.
///
/// `i64::MIN` stands for "minus infinity" on the server side and is never
/// the token of any key, so it is normalized to `i64::MAX`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct Token {
    value: i64,
}

impl Token {
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl std::str::FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Token::new)
    }
}
