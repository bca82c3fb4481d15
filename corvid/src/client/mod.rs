pub(crate) mod execution;

pub mod session;

pub mod session_builder;

#[cfg(test)]
mod session_test;

pub use corvid_cql::frame::Compression;

pub use crate::network::{PoolConfig, PoolSizing};
