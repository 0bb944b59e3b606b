//! Embedded SQLite adapter.

use super::config::MetadataBackend;
use super::error::MetadataResult;
use super::schema::{ColumnKind, FieldValue, Filter, Row, Table};
use super::sql::{self, Order, Statement};
use super::{MetadataStore, migration_statements};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const MIGRATION: &str = include_str!("../../migrations/sqlite/0001_init.sql");

/// Metadata store backed by a single SQLite file.
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (creating if missing) the database named by a `sqlite:` url.
    pub async fn connect(url: &str) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::with_options(options).await
    }

    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> MetadataResult<Self> {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // SQLite serializes writers anyway; one connection avoids
        // "database is locked" under concurrent tasks.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, table: Table, statement: Statement) -> MetadataResult<Vec<Row>> {
        let Statement { sql: text, binds } = statement;
        let rows = bind_all(sqlx::query(&text), binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    async fn execute(&self, table: Table, statement: Statement) -> MetadataResult<u64> {
        let Statement { sql: text, binds } = statement;
        let result = bind_all(sqlx::query(&text), binds)
            .execute(&self.pool)
            .await
            .map_err(|err| sql::classify(table, err))?;
        tracing::debug!(
            table = table.name(),
            rows = result.rows_affected(),
            "executed {}",
            text
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    fn backend(&self) -> MetadataBackend {
        MetadataBackend::Embedded
    }

    async fn migrate(&self) -> MetadataResult<()> {
        for statement in migration_statements(MIGRATION) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert(&self, table: Table, values: Vec<FieldValue>) -> MetadataResult<()> {
        self.execute(table, sql::insert(table, values)?).await?;
        Ok(())
    }

    async fn select(&self, table: Table, filter: &Filter) -> MetadataResult<Vec<Row>> {
        self.fetch(table, sql::select(table, filter, Order::Ascending, None)?)
            .await
    }

    async fn select_last(&self, table: Table, filter: &Filter) -> MetadataResult<Option<Row>> {
        let rows = self
            .fetch(table, sql::select(table, filter, Order::Descending, Some(1))?)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn select_older_than(
        &self,
        table: Table,
        time_field: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<Row>> {
        self.fetch(
            table,
            sql::select_older_than(table, time_field, cutoff, limit)?,
        )
        .await
    }

    async fn update(
        &self,
        table: Table,
        field: &str,
        value: FieldValue,
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.execute(table, sql::update(table, field, value, filter)?)
            .await
    }

    async fn increment(
        &self,
        table: Table,
        deltas: &[(&str, i64)],
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.execute(table, sql::increment(table, deltas, filter)?)
            .await
    }

    async fn delete(&self, table: Table, filter: &Filter) -> MetadataResult<u64> {
        self.execute(table, sql::delete(table, filter)?).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: Vec<FieldValue>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in binds {
        query = match value {
            FieldValue::Int(v) => query.bind(v),
            FieldValue::Text(v) => query.bind(v),
            FieldValue::Time(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(table: Table, row: &SqliteRow) -> MetadataResult<Row> {
    let mut decoded = Row::default();
    for column in table.columns() {
        let value = match column.kind {
            ColumnKind::Int => FieldValue::Int(row.try_get(column.name)?),
            ColumnKind::Text => FieldValue::Text(row.try_get(column.name)?),
            ColumnKind::Time => FieldValue::Time(row.try_get(column.name)?),
        };
        decoded.insert(column.name, value);
    }
    Ok(decoded)
}
