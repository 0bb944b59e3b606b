use crate::metadata::MetadataError;
use crate::services::gc_service::GcReport;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors surfaced by the cache, blob store and GC scheduler.
///
/// A cache miss is not an error; it is `CacheLookup::Miss`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("invalid storage format `{0}`")]
    InvalidFormat(String),
    #[error("invalid md5 checksum `{0}`")]
    InvalidChecksum(String),
    #[error("invalid app code `{0}`")]
    InvalidAppCode(String),
    #[error("invalid bucket {year}/{month}")]
    InvalidBucket { year: i32, month: u32 },
    #[error("image `{0}` already exists")]
    AlreadyExists(String),
    #[error("blob {} already exists", .0.display())]
    BlobExists(PathBuf),
    #[error("storage fault at {}: {source}", path.display())]
    StorageFault {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("consistency fault for `{guid}`: {reason}")]
    ConsistencyFault { guid: String, reason: String },
    #[error(
        "garbage collection partially failed: {} reclaimed, {} failed",
        report.garbage_count,
        report.failed.len()
    )]
    PartialGcFailure { report: GcReport },
    #[error("garbage collection already running")]
    GcInProgress,
    #[error(transparent)]
    Metadata(MetadataError),
}

impl CacheError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::StorageFault {
            path: path.into(),
            source,
        }
    }

    /// Failures a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::StorageFault { .. } | CacheError::Timeout(_) => true,
            CacheError::Metadata(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<MetadataError> for CacheError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Config(msg) => CacheError::Configuration(msg),
            other => CacheError::Metadata(other),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        let status = match &err {
            CacheError::InvalidIdentifier(_)
            | CacheError::InvalidFormat(_)
            | CacheError::InvalidChecksum(_)
            | CacheError::InvalidAppCode(_)
            | CacheError::InvalidBucket { .. } => StatusCode::BAD_REQUEST,
            CacheError::AlreadyExists(_)
            | CacheError::BlobExists(_)
            | CacheError::GcInProgress => StatusCode::CONFLICT,
            CacheError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Configuration(_)
            | CacheError::StorageFault { .. }
            | CacheError::ConsistencyFault { .. }
            | CacheError::PartialGcFailure { .. }
            | CacheError::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_map_to_client_statuses() {
        let err: AppError = CacheError::InvalidIdentifier("a/b".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: AppError = CacheError::AlreadyExists("abc".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err: AppError = CacheError::ConsistencyFault {
            guid: "orphan1".into(),
            reason: "blob missing".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("orphan1"));
    }

    #[test]
    fn only_io_shaped_failures_are_transient() {
        assert!(CacheError::storage("x", io::Error::other("disk")).is_transient());
        assert!(CacheError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!CacheError::InvalidFormat("".into()).is_transient());
        assert!(
            !CacheError::ConsistencyFault {
                guid: "g".into(),
                reason: "r".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn metadata_config_errors_become_configuration() {
        let err: CacheError = MetadataError::Config("bad backend".into()).into();
        assert!(matches!(err, CacheError::Configuration(_)));
    }
}
