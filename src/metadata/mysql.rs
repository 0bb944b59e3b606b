//! Client/server MySQL adapter.
//!
//! Mirrors `SqliteMetadataStore` statement for statement. Text columns use a
//! binary collation so equality filters stay case-sensitive, as in SQLite.

use super::config::MetadataBackend;
use super::error::MetadataResult;
use super::schema::{ColumnKind, FieldValue, Filter, Row, Table};
use super::sql::{self, Order, Statement};
use super::{MetadataStore, migration_statements};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use std::time::Duration;

pub(crate) const MIGRATION: &str = include_str!("../../migrations/mysql/0001_init.sql");

/// Metadata store backed by a MySQL server.
pub struct MySqlMetadataStore {
    pool: MySqlPool,
}

impl MySqlMetadataStore {
    pub async fn connect(url: &str, max_connections: u32) -> MetadataResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &MySqlPool {
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
impl MetadataStore for MySqlMetadataStore {
    fn backend(&self) -> MetadataBackend {
        MetadataBackend::ClientServer
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

fn bind_all(
    mut query: Query<'_, MySql, MySqlArguments>,
    binds: Vec<FieldValue>,
) -> Query<'_, MySql, MySqlArguments> {
    for value in binds {
        query = match value {
            FieldValue::Int(v) => query.bind(v),
            FieldValue::Text(v) => query.bind(v),
            FieldValue::Time(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(table: Table, row: &MySqlRow) -> MetadataResult<Row> {
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
