//! Prepared statements, sent as EXECUTE.

use std::sync::Arc;

use bytes::Bytes;
use corvid_cql::frame::response::result::{PreparedMetadata, ResultMetadata};
use corvid_cql::SerializedValues;

use super::{impl_statement_config_accessors, StatementConfig};
use crate::routing::partitioner::{Murmur3Partitioner, TokenCalculationError};
use crate::routing::Token;

/// A statement prepared on the cluster, identified by the id the server
/// returned.
///
/// When the server reports the statement as unknown (it restarted, or
/// evicted the statement from its cache) the driver prepares it again on
/// the same connection and repeats the request.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    id: Bytes,
    statement: String,
    metadata: Arc<PreparedMetadata>,
    result_metadata: Arc<ResultMetadata>,
    page_size: Option<i32>,

    /// Bind marker indexes of the partition key columns, in key order.
    partition_key_indexes: Vec<u16>,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        metadata: PreparedMetadata,
        result_metadata: ResultMetadata,
        statement: String,
        page_size: Option<i32>,
        config: StatementConfig,
    ) -> Self {
        let mut pk_indexes = metadata.pk_indexes.clone();
        pk_indexes.sort_unstable_by_key(|pk| pk.sequence);

        Self {
            config,
            id,
            statement,
            metadata: Arc::new(metadata),
            result_metadata: Arc::new(result_metadata),
            page_size,
            partition_key_indexes: pk_indexes.into_iter().map(|pk| pk.index).collect(),
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    pub fn get_result_metadata(&self) -> &ResultMetadata {
        &self.result_metadata
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = (page_size > 0).then_some(page_size);
    }

    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// Keyspace of the table the statement's bind markers belong to.
    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.ks_name.as_str())
    }

    pub fn get_table_name(&self) -> Option<&str> {
        self.metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.table_name.as_str())
    }

    /// Token of the partition the bound values address.
    ///
    /// `Ok(None)` when the server did not report partition key indexes,
    /// e.g. because the statement does not restrict the whole key.
    pub fn compute_token(
        &self,
        values: &SerializedValues,
    ) -> Result<Option<Token>, TokenCalculationError> {
        if self.partition_key_indexes.is_empty() {
            return Ok(None);
        }
        Murmur3Partitioner
            .token_for_values(values, &self.partition_key_indexes)
            .map(Some)
    }
}

impl_statement_config_accessors!(PreparedStatement);
