//! Unprepared statements, sent as QUERY.

use super::{impl_statement_config_accessors, StatementConfig};
use crate::routing::Token;

/// A CQL statement sent as text on every execution.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    pub contents: String,
    page_size: Option<i32>,

    /// Routing data, for token-aware load balancing of statements the
    /// driver cannot compute a token for.
    token: Option<Token>,
    keyspace: Option<String>,
}

impl Statement {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            page_size: None,
            config: Default::default(),
            token: None,
            keyspace: None,
        }
    }

    /// Returns self with the page size set to the given value.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.set_page_size(page_size);
        self
    }

    /// Non-positive sizes disable paging.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = (page_size > 0).then_some(page_size);
    }

    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// Routes the statement as if it touched the partition owning `token`
    /// in `keyspace`.
    pub fn set_routing(&mut self, keyspace: impl Into<String>, token: Token) {
        self.keyspace = Some(keyspace.into());
        self.token = Some(token);
    }

    pub fn get_routing_token(&self) -> Option<Token> {
        self.token
    }

    pub fn get_routing_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }
}

impl_statement_config_accessors!(Statement);

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
