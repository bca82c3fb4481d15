use crate::errors::RequestAttemptError;
use corvid_cql::Consistency;

/// What the coordinator knows about a failed attempt.
pub struct RequestInfo<'a> {
    pub error: &'a RequestAttemptError,
    /// `true` only if the statement was marked idempotent. `false` means
    /// unknown, not "not idempotent".
    pub is_idempotent: bool,
    /// Consistency the failed attempt was sent with.
    pub consistency: Consistency,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend to the node that failed. `None` keeps the consistency.
    RetrySameTarget(Option<Consistency>),
    /// Move on to the next node of the plan. `None` keeps the consistency.
    RetryNextTarget(Option<Consistency>),
    /// Return the error to the caller.
    DontRetry,
    /// Report success with an empty result.
    IgnoreError,
}

/// Hands out a fresh [`RetrySession`] for every execution.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Retry state of one execution. Counters kept here bound how often each
/// kind of error is retried.
pub trait RetrySession: Send + Sync {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Forgets every earlier decision.
    fn reset(&mut self);
}
