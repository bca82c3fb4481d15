//! Batches of statements executed atomically (logged) or together (unlogged, counter).

use super::{impl_statement_config_accessors, PreparedStatement, Statement, StatementConfig};

pub use corvid_cql::frame::request::batch::BatchType;

/// One statement of a [`Batch`].
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(Statement),
    PreparedStatement(PreparedStatement),
}

impl From<&str> for BatchStatement {
    fn from(s: &str) -> Self {
        BatchStatement::Query(Statement::from(s))
    }
}

impl From<Statement> for BatchStatement {
    fn from(q: Statement) -> Self {
        BatchStatement::Query(q)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(p: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(p)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub(crate) config: StatementConfig,

    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    pub fn new_with_statements(batch_type: BatchType, statements: Vec<BatchStatement>) -> Self {
        Self {
            batch_type,
            statements,
            ..Default::default()
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    /// Keyspace and token the batch is routed by: those of its first
    /// prepared statement, given that statement's bound values.
    pub(crate) fn first_prepared(&self) -> Option<(usize, &PreparedStatement)> {
        self.statements
            .iter()
            .enumerate()
            .find_map(|(i, statement)| match statement {
                BatchStatement::PreparedStatement(prepared) => Some((i, prepared)),
                BatchStatement::Query(_) => None,
            })
    }
}

impl_statement_config_accessors!(Batch);

#[cfg(test)]
mod tests {
    use super::{Batch, BatchStatement, BatchType};

    #[test]
    fn append_keeps_order() {
        let mut batch = Batch::new(BatchType::Unlogged);
        batch.append_statement("INSERT INTO ks.t (a) VALUES (1)");
        batch.append_statement("INSERT INTO ks.t (a) VALUES (2)");

        assert_eq!(batch.get_type(), BatchType::Unlogged);
        assert_eq!(batch.statements.len(), 2);
        assert!(batch.first_prepared().is_none());
        match &batch.statements[1] {
            BatchStatement::Query(q) => assert!(q.contents.ends_with("(2)")),
            BatchStatement::PreparedStatement(_) => panic!("expected an unprepared statement"),
        }
    }
}
