//! Results of executed statements.

pub mod query_result;

use std::net::SocketAddr;

use corvid_cql::frame::response::result::{self, SchemaChange, SetKeyspace};
use corvid_cql::frame::response::Response;
use uuid::Uuid;

use crate::errors::RequestAttemptError;
pub use query_result::QueryResult;

/// A parsed response frame together with its body extensions.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    /// Turns an ERROR response into the matching attempt error.
    pub(crate) fn into_non_error(self) -> Result<QueryResponse, RequestAttemptError> {
        match self.response {
            Response::Error(err) => Err(RequestAttemptError::DbError(err.error, err.reason)),
            _ => Ok(self),
        }
    }

    pub(crate) fn as_set_keyspace(&self) -> Option<&SetKeyspace> {
        match &self.response {
            Response::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&SchemaChange> {
        match &self.response {
            Response::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }

    /// Converts a RESULT response into a [`QueryResult`]. Anything else is
    /// an error: the server's own, or an unexpected response kind.
    pub(crate) fn into_query_result(
        self,
        coordinator: SocketAddr,
    ) -> Result<QueryResult, RequestAttemptError> {
        let Self {
            response,
            tracing_id,
            warnings,
        } = self;
        let rows = match response {
            Response::Result(result::Result::Rows(rows)) => Some(rows),
            Response::Result(_) => None,
            Response::Error(err) => {
                return Err(RequestAttemptError::DbError(err.error, err.reason));
            }
            other => {
                return Err(RequestAttemptError::UnexpectedResponse(
                    other.to_response_kind(),
                ));
            }
        };

        Ok(QueryResult::new(coordinator, rows, tracing_id, warnings))
    }
}
