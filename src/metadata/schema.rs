//! Logical schema shared by every backend: the three tables, their columns,
//! and the value/filter/row types that travel through `MetadataStore`.

use super::error::{MetadataError, MetadataResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Storage class of a column, identical across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Text,
    Time,
}

#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

const IMAGE_INFO: &[Column] = &[
    col("guid", ColumnKind::Text),
    col("year", ColumnKind::Int),
    col("month", ColumnKind::Int),
    col("file_size_byte", ColumnKind::Int),
    col("file_storage_format", ColumnKind::Text),
    col("upload_time", ColumnKind::Time),
    col("app_code", ColumnKind::Text),
    col("md5", ColumnKind::Text),
    col("download_count", ColumnKind::Int),
];

const GC_LOG: &[Column] = &[
    col("id", ColumnKind::Int),
    col("collection_time", ColumnKind::Time),
    col("garbage_count", ColumnKind::Int),
];

const IMAGE_STATISTICS: &[Column] = &[
    col("date", ColumnKind::Text),
    col("upload_count", ColumnKind::Int),
    col("download_count", ColumnKind::Int),
    col("upload_size_byte", ColumnKind::Int),
    col("download_size_byte", ColumnKind::Int),
];

/// The tables of the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ImageInfo,
    GcLog,
    ImageStatistics,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::ImageInfo => "image_info",
            Table::GcLog => "gc_log",
            Table::ImageStatistics => "image_statistics",
        }
    }

    /// All columns in declaration order.
    pub fn columns(self) -> &'static [Column] {
        match self {
            Table::ImageInfo => IMAGE_INFO,
            Table::GcLog => GC_LOG,
            Table::ImageStatistics => IMAGE_STATISTICS,
        }
    }

    /// Columns supplied on insert. `gc_log.id` is assigned by the backend.
    pub fn insert_columns(self) -> &'static [Column] {
        match self {
            Table::GcLog => &GC_LOG[1..],
            other => other.columns(),
        }
    }

    /// Explicit ordering key for `select`/`select_last`. For `gc_log` this is
    /// the auto-increment id, so "last" means last inserted even under clock
    /// skew.
    pub fn ordering_key(self) -> &'static str {
        match self {
            Table::ImageInfo => "guid",
            Table::GcLog => "id",
            Table::ImageStatistics => "date",
        }
    }

    pub fn column(self, name: &str) -> MetadataResult<&'static Column> {
        self.columns()
            .iter()
            .find(|column| column.name == name)
            .ok_or_else(|| MetadataError::UnknownColumn {
                table: self.name(),
                column: name.to_string(),
            })
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl FieldValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            FieldValue::Int(_) => ColumnKind::Int,
            FieldValue::Text(_) => ColumnKind::Text,
            FieldValue::Time(_) => ColumnKind::Time,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Time(value)
    }
}

/// Equality-only filter; terms are combined with AND. An empty filter
/// matches every row.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    terms: Vec<(String, FieldValue)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.terms.push((column.to_string(), value.into()));
        self
    }

    pub fn terms(&self) -> &[(String, FieldValue)] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// One decoded row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<&'static str, FieldValue>,
}

impl Row {
    pub fn insert(&mut self, column: &'static str, value: FieldValue) {
        self.values.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }

    pub fn int(&self, column: &str) -> MetadataResult<i64> {
        match self.get(column) {
            Some(FieldValue::Int(value)) => Ok(*value),
            other => Err(decode_error(column, "integer", other)),
        }
    }

    /// Integer column that must not be negative (sizes and counters).
    pub fn unsigned(&self, column: &str) -> MetadataResult<u64> {
        let value = self.int(column)?;
        u64::try_from(value).map_err(|_| MetadataError::Decode {
            column: column.to_string(),
            reason: format!("negative value {value}"),
        })
    }

    pub fn text(&self, column: &str) -> MetadataResult<String> {
        match self.get(column) {
            Some(FieldValue::Text(value)) => Ok(value.clone()),
            other => Err(decode_error(column, "text", other)),
        }
    }

    pub fn time(&self, column: &str) -> MetadataResult<DateTime<Utc>> {
        match self.get(column) {
            Some(FieldValue::Time(value)) => Ok(*value),
            other => Err(decode_error(column, "timestamp", other)),
        }
    }
}

fn decode_error(column: &str, expected: &str, found: Option<&FieldValue>) -> MetadataError {
    MetadataError::Decode {
        column: column.to_string(),
        reason: match found {
            Some(value) => format!("expected {expected}, found {value:?}"),
            None => "column missing from row".to_string(),
        },
    }
}
