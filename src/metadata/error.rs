//! Metadata store error types.

use std::io;
use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unknown column `{column}` in table `{table}`")]
    UnknownColumn { table: &'static str, column: String },

    #[error("invalid row for table `{table}`: {reason}")]
    InvalidRow { table: &'static str, reason: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("failed to decode `{column}`: {reason}")]
    Decode { column: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MetadataError {
    /// True when the failure is in the connection or I/O path rather than in
    /// the request itself, so repeating the call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            MetadataError::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(MetadataError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!MetadataError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!MetadataError::AlreadyExists("image_info".into()).is_transient());
    }

    #[test]
    fn unknown_column_names_table() {
        let err = MetadataError::UnknownColumn {
            table: "gc_log",
            column: "guid".into(),
        };
        assert_eq!(err.to_string(), "unknown column `guid` in table `gc_log`");
    }
}
