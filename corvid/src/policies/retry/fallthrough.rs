use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Forwards all errors directly to the user, never retries
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

/// Implementation of [RetrySession] for [FallthroughRetryPolicy].
pub struct FallthroughRetrySession;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{FallthroughRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{DbError, RequestAttemptError};
    use corvid_cql::Consistency;

    #[test]
    fn never_retries() {
        let mut session = FallthroughRetryPolicy::new().new_session();
        let errors = [
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
        ];
        for error in errors {
            let error = RequestAttemptError::DbError(error, String::new());
            let decision = session.decide_should_retry(RequestInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::Two,
            });
            assert_eq!(decision, RetryDecision::DontRetry);
        }
    }
}
