//! Metadata store abstraction and its two backend adapters.
//!
//! `MetadataStore` is table-generic: equality-only filters joined with AND,
//! rows ordered by each table's explicit ordering key, and atomic counter
//! increments. `SqliteMetadataStore` and `MySqlMetadataStore` implement it
//! with identical semantics; `MetadataRepo` maps rows to domain records.

pub mod config;
pub mod error;
pub mod mysql;
pub mod repo;
pub mod schema;
pub(crate) mod sql;
pub mod sqlite;

pub use config::{MetadataBackend, MetadataConfig};
pub use error::{MetadataError, MetadataResult};
pub use mysql::MySqlMetadataStore;
pub use repo::MetadataRepo;
pub use schema::{Column, ColumnKind, FieldValue, Filter, Row, Table};
pub use sqlite::SqliteMetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Backend-agnostic access to the metadata tables.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn backend(&self) -> MetadataBackend;

    /// Create the schema if it does not exist yet.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Insert one row; `values` follow `Table::insert_columns` order.
    /// A duplicate primary key yields `MetadataError::AlreadyExists`.
    async fn insert(&self, table: Table, values: Vec<FieldValue>) -> MetadataResult<()>;

    /// All rows matching `filter`, ascending by the table's ordering key.
    async fn select(&self, table: Table, filter: &Filter) -> MetadataResult<Vec<Row>>;

    /// The matching row with the greatest ordering key.
    async fn select_last(&self, table: Table, filter: &Filter) -> MetadataResult<Option<Row>>;

    /// Up to `limit` rows whose `time_field` is strictly before `cutoff`,
    /// ascending by ordering key. Runs as one statement.
    async fn select_older_than(
        &self,
        table: Table,
        time_field: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<Row>>;

    async fn update(
        &self,
        table: Table,
        field: &str,
        value: FieldValue,
        filter: &Filter,
    ) -> MetadataResult<u64>;

    /// Add each delta to its column in place. Returns rows affected.
    async fn increment(
        &self,
        table: Table,
        deltas: &[(&str, i64)],
        filter: &Filter,
    ) -> MetadataResult<u64>;

    /// Delete matching rows; an empty filter is rejected.
    async fn delete(&self, table: Table, filter: &Filter) -> MetadataResult<u64>;

    async fn health_check(&self) -> MetadataResult<()>;
}

/// Open the configured backend, creating its schema. The configuration is
/// validated before any connection is attempted.
pub async fn connect(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate()?;
    match config.backend {
        MetadataBackend::Embedded => {
            tracing::info!("Opening embedded metadata store");
            let store = SqliteMetadataStore::connect(&config.url).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataBackend::ClientServer => {
            tracing::info!(
                max_connections = config.max_connections,
                "Connecting to client-server metadata store"
            );
            let store = MySqlMetadataStore::connect(&config.url, config.max_connections).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

/// Split an embedded migration file into statements.
pub(crate) fn migration_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}
