//! Runs one request over a plan of nodes, failing over and retrying as the
//! error and the retry policy dictate.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use corvid_cql::Consistency;
use tracing::{trace, trace_span, Instrument};

use crate::cluster::NodeRef;
use crate::errors::{ConnectionPoolError, DbError, ExecutionError, RequestAttemptError};
use crate::policies::retry::{RequestInfo, RetryDecision, RetrySession};

/// Outcome of a request that did not fail.
#[derive(Debug)]
pub(crate) enum RunRequestResult<ResT> {
    /// The retry policy chose to swallow the error; callers see an empty result.
    IgnoredError,
    Completed(ResT),
}

/// Properties of the statement that the failover rules depend on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestParams {
    pub(crate) consistency: Consistency,
    pub(crate) is_idempotent: bool,
}

/// What to do after an attempt failed.
#[derive(Debug)]
enum Next {
    SameTarget(Option<Consistency>),
    NextTarget(Option<Consistency>),
    Ignore,
    Fail,
}

/// Errors of the attempted hosts; one entry per address, the last error
/// for an address replacing earlier ones.
#[derive(Debug, Default)]
struct HostErrors(Vec<(SocketAddr, RequestAttemptError)>);

impl HostErrors {
    fn record(&mut self, address: SocketAddr, error: RequestAttemptError) {
        match self.0.iter_mut().find(|(known, _)| *known == address) {
            Some(entry) => entry.1 = error,
            None => self.0.push((address, error)),
        }
    }

    fn into_error(self) -> ExecutionError {
        if self.0.is_empty() {
            ExecutionError::EmptyPlan
        } else {
            ExecutionError::NoHostAvailable { errors: self.0 }
        }
    }
}

/// Decides how to continue after `error`. Only errors that leave the
/// request's fate to the caller's judgement reach the retry session.
fn classify(
    error: &RequestAttemptError,
    params: RequestParams,
    retry_session: &mut dyn RetrySession,
) -> Next {
    if error.is_stream_level() {
        return Next::NextTarget(None);
    }

    let RequestAttemptError::DbError(db_error, _) = error else {
        // Protocol violations and unexpected responses.
        return Next::Fail;
    };

    match db_error {
        DbError::Unavailable { .. }
        | DbError::ReadTimeout { .. }
        | DbError::WriteTimeout { .. }
        | DbError::ReadFailure { .. }
        | DbError::WriteFailure { .. } => {
            let info = RequestInfo {
                error,
                is_idempotent: params.is_idempotent,
                consistency: params.consistency,
            };
            match retry_session.decide_should_retry(info) {
                RetryDecision::RetrySameTarget(cl) => Next::SameTarget(cl),
                RetryDecision::RetryNextTarget(cl) => Next::NextTarget(cl),
                RetryDecision::DontRetry => Next::Fail,
                RetryDecision::IgnoreError => Next::Ignore,
            }
        }
        DbError::Overloaded | DbError::IsBootstrapping | DbError::TruncateError => {
            Next::NextTarget(None)
        }
        DbError::ServerError if params.is_idempotent => Next::NextTarget(None),
        _ => Next::Fail,
    }
}

/// Runs a request along `plan` until an attempt succeeds or the rules say
/// stop.
///
/// `connect` borrows a connection to a node and `attempt` sends the request
/// on it at the given consistency. The whole run, retries included, is
/// bounded by `timeout`. Returns the result with the address of the node
/// that produced it.
pub(crate) async fn run_request<'a, C, ResT, ConnFut, AttemptFut>(
    plan: impl Iterator<Item = NodeRef<'a>>,
    connect: impl Fn(NodeRef<'a>) -> ConnFut,
    attempt: impl Fn(C, Consistency) -> AttemptFut,
    retry_session: &mut dyn RetrySession,
    params: RequestParams,
    timeout: Option<Duration>,
) -> Result<(RunRequestResult<ResT>, SocketAddr), ExecutionError>
where
    ConnFut: Future<Output = Result<C, ConnectionPoolError>>,
    AttemptFut: Future<Output = Result<ResT, RequestAttemptError>>,
{
    let runner = run_over_plan(plan, connect, attempt, retry_session, params);
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, runner)
            .await
            .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
        None => runner.await,
    }
}

async fn run_over_plan<'a, C, ResT, ConnFut, AttemptFut>(
    plan: impl Iterator<Item = NodeRef<'a>>,
    connect: impl Fn(NodeRef<'a>) -> ConnFut,
    attempt: impl Fn(C, Consistency) -> AttemptFut,
    retry_session: &mut dyn RetrySession,
    params: RequestParams,
) -> Result<(RunRequestResult<ResT>, SocketAddr), ExecutionError>
where
    ConnFut: Future<Output = Result<C, ConnectionPoolError>>,
    AttemptFut: Future<Output = Result<ResT, RequestAttemptError>>,
{
    let mut errors = HostErrors::default();
    let mut consistency = params.consistency;
    let mut retry_count: usize = 0;

    'nodes_in_plan: for node in plan {
        let span = trace_span!("Executing request", node = %node.address);
        'same_node_retries: loop {
            let connection = match connect(node).await {
                Ok(connection) => connection,
                Err(e) => {
                    trace!(parent: &span, error = %e, "Choosing connection failed");
                    errors.record(node.address, e.into());
                    continue 'nodes_in_plan;
                }
            };

            trace!(parent: &span, consistency = %consistency, "Sending");
            let error = match attempt(connection, consistency).instrument(span.clone()).await {
                Ok(response) => {
                    trace!(parent: &span, "Request succeeded");
                    return Ok((RunRequestResult::Completed(response), node.address));
                }
                Err(e) => e,
            };

            let next = classify(
                &error,
                RequestParams {
                    consistency,
                    is_idempotent: params.is_idempotent,
                },
                retry_session,
            );
            trace!(parent: &span, error = %error, decision = ?next, retry_count, "Request failed");

            match next {
                Next::SameTarget(cl) => {
                    retry_count += 1;
                    errors.record(node.address, error);
                    consistency = cl.unwrap_or(consistency);
                    continue 'same_node_retries;
                }
                Next::NextTarget(cl) => {
                    retry_count += 1;
                    errors.record(node.address, error);
                    consistency = cl.unwrap_or(consistency);
                    continue 'nodes_in_plan;
                }
                Next::Ignore => {
                    return Ok((RunRequestResult::IgnoredError, node.address));
                }
                Next::Fail => return Err(error.into()),
            }
        }
    }

    Err(errors.into_error())
}
