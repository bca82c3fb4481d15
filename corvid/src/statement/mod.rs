//! Statements the session can execute: unprepared [`Statement`]s,
//! [`PreparedStatement`]s, and [`Batch`]es of either.

use std::sync::Arc;
use std::time::Duration;

use crate::policies::retry::RetryPolicy;

pub mod batch;
pub mod prepared;
pub mod unprepared;

pub use batch::{Batch, BatchStatement, BatchType};
pub use corvid_cql::frame::types::{Consistency, SerialConsistency};
pub use prepared::PreparedStatement;
pub use unprepared::Statement;

/// Per-statement execution options, shared by every statement kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,

    /// Overrides the session's whole-operation timeout.
    pub(crate) request_timeout: Option<Duration>,

    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl StatementConfig {
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// Setters and getters for the options in [`StatementConfig`], identical
/// for every statement kind.
macro_rules! impl_statement_config_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Sets the consistency; unset, the session default applies.
            pub fn set_consistency(&mut self, c: $crate::statement::Consistency) {
                self.config.consistency = Some(c);
            }

            pub fn unset_consistency(&mut self) {
                self.config.consistency = None;
            }

            pub fn get_consistency(&self) -> Option<$crate::statement::Consistency> {
                self.config.consistency
            }

            /// Serial consistency used by the Paxos phase of conditional updates.
            pub fn set_serial_consistency(
                &mut self,
                sc: Option<$crate::statement::SerialConsistency>,
            ) {
                self.config.serial_consistency = sc;
            }

            pub fn get_serial_consistency(
                &self,
            ) -> Option<$crate::statement::SerialConsistency> {
                self.config.serial_consistency
            }

            /// Marks the statement as safe to run more than once.
            ///
            /// Only idempotent statements are retried after errors that
            /// leave it unknown whether they were applied.
            pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
                self.config.is_idempotent = is_idempotent;
            }

            pub fn get_is_idempotent(&self) -> bool {
                self.config.is_idempotent
            }

            pub fn set_tracing(&mut self, should_trace: bool) {
                self.config.tracing = should_trace;
            }

            pub fn get_tracing(&self) -> bool {
                self.config.tracing
            }

            /// Client-side timestamp in microseconds; unset, the server assigns one.
            pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
                self.config.timestamp = timestamp;
            }

            pub fn get_timestamp(&self) -> Option<i64> {
                self.config.timestamp
            }

            /// Bounds the whole execution, retries included. Unset, the
            /// session's request timeout applies.
            pub fn set_request_timeout(&mut self, timeout: Option<std::time::Duration>) {
                self.config.request_timeout = timeout;
            }

            pub fn get_request_timeout(&self) -> Option<std::time::Duration> {
                self.config.request_timeout
            }

            /// Overrides the session's retry policy for this statement.
            pub fn set_retry_policy(
                &mut self,
                retry_policy: Option<std::sync::Arc<dyn $crate::policies::retry::RetryPolicy>>,
            ) {
                self.config.retry_policy = retry_policy;
            }

            pub fn get_retry_policy(
                &self,
            ) -> Option<&std::sync::Arc<dyn $crate::policies::retry::RetryPolicy>> {
                self.config.retry_policy.as_ref()
            }
        }
    };
}

pub(crate) use impl_statement_config_accessors;
