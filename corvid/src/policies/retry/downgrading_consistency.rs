use corvid_cql::Consistency;
use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};

/// Retries with a lower consistency level when the error shows how many
/// replicas are reachable, and the requested level cannot be met.
///
/// Otherwise it behaves like [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy).
/// Only one retry is made per request.
#[derive(Debug, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DowngradingConsistencyRetrySession::default())
    }
}

/// Implementation of [RetrySession] for [DowngradingConsistencyRetryPolicy].
#[derive(Default)]
pub struct DowngradingConsistencyRetrySession {
    was_retry: bool,
}

/// The highest level that `known_ok` live replicas can satisfy.
fn max_likely_to_work_cl(known_ok: i32, previous_cl: Consistency) -> RetryDecision {
    let decision = if known_ok >= 3 {
        RetryDecision::RetrySameTarget(Some(Consistency::Three))
    } else if known_ok == 2 {
        RetryDecision::RetrySameTarget(Some(Consistency::Two))
    } else if known_ok == 1 || previous_cl == Consistency::EachQuorum {
        // EACH_QUORUM reports no global count of live replicas, so
        // zero does not mean none are up.
        RetryDecision::RetrySameTarget(Some(Consistency::One))
    } else {
        RetryDecision::DontRetry
    };
    if let RetryDecision::RetrySameTarget(new_cl) = &decision {
        debug!(
            previous = %previous_cl,
            lowered = ?new_cl,
            "Lowering required consistency"
        );
    }
    decision
}

impl RetrySession for DowngradingConsistencyRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        let cl = request_info.consistency;
        if cl.is_serial() {
            // The Paxos phase failed; the coordinator may be the one cut off.
            return match request_info.error {
                RequestAttemptError::DbError(DbError::Unavailable { .. }, _) if !self.was_retry => {
                    self.was_retry = true;
                    RetryDecision::RetryNextTarget(None)
                }
                _ => RetryDecision::DontRetry,
            };
        }

        if self.was_retry {
            return RetryDecision::DontRetry;
        }

        let RequestAttemptError::DbError(db_error, _) = request_info.error else {
            return RetryDecision::DontRetry;
        };

        let decision = match db_error {
            DbError::Unavailable { alive, .. } => max_likely_to_work_cl(*alive, cl),
            DbError::ReadTimeout {
                received,
                required,
                data_present,
                ..
            } => {
                if received < required {
                    max_likely_to_work_cl(*received, cl)
                } else if !*data_present {
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            DbError::WriteTimeout {
                write_type,
                received,
                ..
            } if request_info.is_idempotent => match write_type {
                // Part of the write is persisted and will be replayed by hints.
                WriteType::Batch | WriteType::Simple if *received > 0 => {
                    RetryDecision::IgnoreError
                }
                // Only part of the batch may have been persisted.
                WriteType::UnloggedBatch => max_likely_to_work_cl(*received, cl),
                WriteType::BatchLog => RetryDecision::RetrySameTarget(None),
                _ => RetryDecision::DontRetry,
            },
            _ => RetryDecision::DontRetry,
        };

        if decision != RetryDecision::DontRetry {
            self.was_retry = true;
        }
        decision
    }

    fn reset(&mut self) {
        *self = DowngradingConsistencyRetrySession::default();
    }
}

#[cfg(test)]
mod tests {
    use super::{DowngradingConsistencyRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{DbError, RequestAttemptError, WriteType};
    use crate::test_utils::setup_tracing;
    use corvid_cql::Consistency;

    fn decide(
        error: DbError,
        consistency: Consistency,
        is_idempotent: bool,
    ) -> (RetryDecision, RetryDecision) {
        let error = RequestAttemptError::DbError(error, String::new());
        let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
        let info = || RequestInfo {
            error: &error,
            is_idempotent,
            consistency,
        };
        let first = session.decide_should_retry(info());
        let second = session.decide_should_retry(info());
        (first, second)
    }

    #[test]
    fn unavailable_lowers_to_live_replica_count() {
        setup_tracing();
        for (alive, expected) in [
            (3, RetryDecision::RetrySameTarget(Some(Consistency::Three))),
            (2, RetryDecision::RetrySameTarget(Some(Consistency::Two))),
            (1, RetryDecision::RetrySameTarget(Some(Consistency::One))),
            (0, RetryDecision::DontRetry),
        ] {
            let error = DbError::Unavailable {
                consistency: Consistency::All,
                required: 5,
                alive,
            };
            let (first, second) = decide(error, Consistency::All, false);
            assert_eq!(first, expected);
            assert_eq!(second, RetryDecision::DontRetry);
        }

        let error = DbError::Unavailable {
            consistency: Consistency::EachQuorum,
            required: 4,
            alive: 0,
        };
        assert_eq!(
            decide(error, Consistency::EachQuorum, false).0,
            RetryDecision::RetrySameTarget(Some(Consistency::One))
        );
    }

    #[test]
    fn read_timeout() {
        setup_tracing();
        let too_few = DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            data_present: false,
        };
        assert_eq!(
            decide(too_few, Consistency::Quorum, false).0,
            RetryDecision::RetrySameTarget(Some(Consistency::One))
        );

        let digests_only = DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 2,
            required: 2,
            data_present: false,
        };
        assert_eq!(
            decide(digests_only, Consistency::Quorum, false).0,
            RetryDecision::RetrySameTarget(None)
        );

        let with_data = DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 2,
            required: 2,
            data_present: true,
        };
        assert_eq!(
            decide(with_data, Consistency::Quorum, false).0,
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn write_timeout_depends_on_write_type() {
        setup_tracing();
        let write_timeout = |write_type, received| DbError::WriteTimeout {
            consistency: Consistency::Quorum,
            received,
            required: 2,
            write_type,
        };

        assert_eq!(
            decide(write_timeout(WriteType::Simple, 1), Consistency::Quorum, true).0,
            RetryDecision::IgnoreError
        );
        assert_eq!(
            decide(write_timeout(WriteType::Simple, 0), Consistency::Quorum, true).0,
            RetryDecision::DontRetry
        );
        assert_eq!(
            decide(write_timeout(WriteType::UnloggedBatch, 2), Consistency::Quorum, true).0,
            RetryDecision::RetrySameTarget(Some(Consistency::Two))
        );
        assert_eq!(
            decide(write_timeout(WriteType::BatchLog, 1), Consistency::Quorum, true).0,
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            decide(write_timeout(WriteType::BatchLog, 1), Consistency::Quorum, false).0,
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn serial_unavailable_goes_to_next_target_once() {
        setup_tracing();
        let error = DbError::Unavailable {
            consistency: Consistency::Serial,
            required: 2,
            alive: 1,
        };
        assert_eq!(
            decide(error, Consistency::Serial, false),
            (RetryDecision::RetryNextTarget(None), RetryDecision::DontRetry)
        );
    }
}
