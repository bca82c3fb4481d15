use std::net::SocketAddr;

use bytes::Bytes;
use corvid_cql::frame::response::result::{ColumnSpec, Row, Rows};
use uuid::Uuid;

/// Result of a single request.
///
/// Statements that return no rows (writes, DDL) produce a result with
/// `rows() == None`. Rows keep their raw typed cells; mapping them to user
/// types is left to the caller.
#[derive(Debug, Clone)]
pub struct QueryResult {
    coordinator: SocketAddr,
    rows: Option<Rows>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

impl QueryResult {
    pub(crate) fn new(
        coordinator: SocketAddr,
        rows: Option<Rows>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            coordinator,
            rows,
            tracing_id,
            warnings,
        }
    }

    /// Address of the node that served the request.
    pub fn coordinator(&self) -> SocketAddr {
        self.coordinator
    }

    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_ref().map(|rows| rows.rows.as_slice())
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        self.rows.map(|rows| rows.rows)
    }

    pub fn col_specs(&self) -> &[ColumnSpec] {
        self.rows
            .as_ref()
            .map(|rows| rows.metadata.col_specs.as_slice())
            .unwrap_or(&[])
    }

    /// Position of the named column in every row.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.rows.as_ref().and_then(|rows| rows.column_index(name))
    }

    /// Where to resume reading; `None` on the last page.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.rows.as_ref().and_then(|rows| rows.paging_state.as_ref())
    }

    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }
}
