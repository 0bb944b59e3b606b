//! Backend selection for the metadata store.

use super::error::{MetadataError, MetadataResult};
use std::fmt;
use std::str::FromStr;

/// Which relational backend holds the metadata. Exactly one is active per
/// deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    /// Single-file SQLite database, no external server.
    Embedded,
    /// MySQL server, for multi-process access.
    ClientServer,
}

impl FromStr for MetadataBackend {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(MetadataBackend::Embedded),
            "client-server" | "mysql" => Ok(MetadataBackend::ClientServer),
            other => Err(MetadataError::Config(format!(
                "unsupported metadata backend `{other}`"
            ))),
        }
    }
}

impl fmt::Display for MetadataBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataBackend::Embedded => write!(f, "embedded"),
            MetadataBackend::ClientServer => write!(f, "client-server"),
        }
    }
}

/// Connection settings for the selected backend.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    pub url: String,
    /// Pool size for the client/server backend. The embedded backend always
    /// uses a single connection.
    pub max_connections: u32,
}

impl MetadataConfig {
    /// Reject a URL whose scheme does not belong to the selected backend.
    pub fn validate(&self) -> MetadataResult<()> {
        let expected = match self.backend {
            MetadataBackend::Embedded => "sqlite:",
            MetadataBackend::ClientServer => "mysql:",
        };
        if !self.url.starts_with(expected) {
            return Err(MetadataError::Config(format!(
                "{} backend requires a `{}` url",
                self.backend, expected
            )));
        }
        if self.max_connections == 0 {
            return Err(MetadataError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
