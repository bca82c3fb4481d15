//! CQL protocol v4 primitives used by the `corvid` driver: the frame codec,
//! in-wire types, request bodies, and response parsing.
//!
//! Nothing here touches the network. Frames are read from any [`tokio::io::AsyncRead`].

pub mod frame;

pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::frame::value::SerializedValues;
