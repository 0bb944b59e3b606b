//! Statement building shared by both adapters.
//!
//! SQLite and MySQL both take `?` placeholders and every identifier comes
//! from the static schema, so one builder serves both. Values are always
//! bound, never interpolated.

use super::error::{MetadataError, MetadataResult};
use super::schema::{ColumnKind, FieldValue, Filter, Table};
use chrono::{DateTime, Utc};

/// SQL text plus its bind values, in placeholder order.
#[derive(Debug)]
pub(crate) struct Statement {
    pub sql: String,
    pub binds: Vec<FieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
    Ascending,
    Descending,
}

pub(crate) fn insert(table: Table, values: Vec<FieldValue>) -> MetadataResult<Statement> {
    let columns = table.insert_columns();
    if values.len() != columns.len() {
        return Err(MetadataError::InvalidRow {
            table: table.name(),
            reason: format!("expected {} values, got {}", columns.len(), values.len()),
        });
    }
    for (column, value) in columns.iter().zip(&values) {
        if column.kind != value.kind() {
            return Err(MetadataError::InvalidRow {
                table: table.name(),
                reason: format!("column `{}` expects {:?}", column.name, column.kind),
            });
        }
    }

    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            names.join(", "),
            placeholders
        ),
        binds: values,
    })
}

pub(crate) fn select(
    table: Table,
    filter: &Filter,
    order: Order,
    limit: Option<u32>,
) -> MetadataResult<Statement> {
    let mut statement = Statement {
        sql: format!("SELECT {} FROM {}", column_list(table), table.name()),
        binds: Vec::new(),
    };
    push_where(table, filter, &mut statement)?;
    push_order(table, order, limit, &mut statement);
    Ok(statement)
}

pub(crate) fn select_older_than(
    table: Table,
    time_field: &str,
    cutoff: DateTime<Utc>,
    limit: u32,
) -> MetadataResult<Statement> {
    let column = table.column(time_field)?;
    if column.kind != ColumnKind::Time {
        return Err(MetadataError::InvalidFilter(format!(
            "`{}` is not a timestamp column",
            column.name
        )));
    }
    let mut statement = Statement {
        sql: format!(
            "SELECT {} FROM {} WHERE {} < ?",
            column_list(table),
            table.name(),
            column.name
        ),
        binds: vec![FieldValue::Time(cutoff)],
    };
    push_order(table, Order::Ascending, Some(limit), &mut statement);
    Ok(statement)
}

pub(crate) fn update(
    table: Table,
    field: &str,
    value: FieldValue,
    filter: &Filter,
) -> MetadataResult<Statement> {
    let column = table.column(field)?;
    if column.kind != value.kind() {
        return Err(MetadataError::InvalidRow {
            table: table.name(),
            reason: format!("column `{}` expects {:?}", column.name, column.kind),
        });
    }
    let mut statement = Statement {
        sql: format!("UPDATE {} SET {} = ?", table.name(), column.name),
        binds: vec![value],
    };
    push_where(table, filter, &mut statement)?;
    Ok(statement)
}

/// `SET col = col + ?` for every delta; the addition happens inside the
/// backend so concurrent increments never lose updates.
pub(crate) fn increment(
    table: Table,
    deltas: &[(&str, i64)],
    filter: &Filter,
) -> MetadataResult<Statement> {
    if deltas.is_empty() {
        return Err(MetadataError::InvalidFilter(
            "increment needs at least one column".into(),
        ));
    }
    let mut assignments = Vec::with_capacity(deltas.len());
    let mut binds = Vec::with_capacity(deltas.len());
    for (field, delta) in deltas {
        let column = table.column(field)?;
        if column.kind != ColumnKind::Int || column.name == table.ordering_key() {
            return Err(MetadataError::InvalidRow {
                table: table.name(),
                reason: format!("column `{}` is not a counter", column.name),
            });
        }
        assignments.push(format!("{0} = {0} + ?", column.name));
        binds.push(FieldValue::Int(*delta));
    }
    let mut statement = Statement {
        sql: format!("UPDATE {} SET {}", table.name(), assignments.join(", ")),
        binds,
    };
    push_where(table, filter, &mut statement)?;
    Ok(statement)
}

pub(crate) fn delete(table: Table, filter: &Filter) -> MetadataResult<Statement> {
    if filter.is_empty() {
        return Err(MetadataError::InvalidFilter(format!(
            "refusing to delete from `{}` without a filter",
            table.name()
        )));
    }
    let mut statement = Statement {
        sql: format!("DELETE FROM {}", table.name()),
        binds: Vec::new(),
    };
    push_where(table, filter, &mut statement)?;
    Ok(statement)
}

/// Map a unique-key violation to `AlreadyExists`; everything else stays a
/// database error.
pub(crate) fn classify(table: Table, err: sqlx::Error) -> MetadataError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            MetadataError::AlreadyExists(format!("{} row", table.name()))
        }
        _ => MetadataError::Database(err),
    }
}

fn column_list(table: Table) -> String {
    table
        .columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_where(table: Table, filter: &Filter, statement: &mut Statement) -> MetadataResult<()> {
    for (index, (name, value)) in filter.terms().iter().enumerate() {
        let column = table.column(name)?;
        if column.kind != value.kind() {
            return Err(MetadataError::InvalidFilter(format!(
                "column `{}` expects {:?}",
                column.name, column.kind
            )));
        }
        statement
            .sql
            .push_str(if index == 0 { " WHERE " } else { " AND " });
        statement.sql.push_str(column.name);
        statement.sql.push_str(" = ?");
        statement.binds.push(value.clone());
    }
    Ok(())
}

fn push_order(table: Table, order: Order, limit: Option<u32>, statement: &mut Statement) {
    let direction = match order {
        Order::Ascending => "ASC",
        Order::Descending => "DESC",
    };
    statement
        .sql
        .push_str(&format!(" ORDER BY {} {}", table.ordering_key(), direction));
    if let Some(limit) = limit {
        statement.sql.push_str(&format!(" LIMIT {limit}"));
    }
}
