//! Deciding whether a failed request is worth another attempt.
//!
//! The execution coordinator consults a [`RetrySession`] only for errors
//! where the answer depends on the statement: `Unavailable`, read/write
//! timeouts and read/write failures. Connection-level failures always move
//! on to the next node, and the remaining server errors are handled by
//! fixed rules.

mod default;
mod downgrading_consistency;
mod fallthrough;
mod retry_policy;

pub use default::{DefaultRetryPolicy, DefaultRetrySession};
pub use downgrading_consistency::{
    DowngradingConsistencyRetryPolicy, DowngradingConsistencyRetrySession,
};
pub use fallthrough::{FallthroughRetryPolicy, FallthroughRetrySession};
pub use retry_policy::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
