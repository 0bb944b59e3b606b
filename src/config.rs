use crate::metadata::{MetadataBackend, MetadataConfig};
use crate::services::{cache_service::CacheConfig, gc_service::GcConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "IMAGE_CACHE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; flags win over the
/// environment, the environment wins over defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub metadata: MetadataConfig,
    pub gc_interval_secs: u64,
    pub gc_check_secs: u64,
    /// `None` keeps records forever.
    pub retention_days: Option<u64>,
    pub orphan_grace_secs: u64,
    pub operation_timeout_secs: u64,
    pub put_retries: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image cache for static resources")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_CACHE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_CACHE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Blob root directory (overrides IMAGE_CACHE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata backend: embedded|sqlite or client-server|mysql
    /// (overrides IMAGE_CACHE_DB_TYPE)
    #[arg(long)]
    pub db_type: Option<String>,

    /// Database URL (overrides IMAGE_CACHE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Connection pool size for client-server backends
    /// (overrides IMAGE_CACHE_DB_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Minimum seconds between GC runs (overrides IMAGE_CACHE_GC_INTERVAL_SECS)
    #[arg(long)]
    pub gc_interval_secs: Option<u64>,

    /// How often the scheduler checks whether GC is due
    /// (overrides IMAGE_CACHE_GC_CHECK_SECS)
    #[arg(long)]
    pub gc_check_secs: Option<u64>,

    /// Reclaim images older than this many days (overrides IMAGE_CACHE_RETENTION_DAYS)
    #[arg(long)]
    pub retention_days: Option<u64>,

    /// Minimum age of an orphan blob before GC removes it
    /// (overrides IMAGE_CACHE_ORPHAN_GRACE_SECS)
    #[arg(long)]
    pub orphan_grace_secs: Option<u64>,

    /// Per-call timeout for blob and metadata operations
    /// (overrides IMAGE_CACHE_OPERATION_TIMEOUT_SECS)
    #[arg(long)]
    pub operation_timeout_secs: Option<u64>,

    /// Retries for a put that failed transiently (overrides IMAGE_CACHE_PUT_RETRIES)
    #[arg(long)]
    pub put_retries: Option<u32>,

    /// Create the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge parsed flags over values from `lookup` (normally `env::var`).
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_host = env_value::<String, _>(&lookup, "HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_value(&lookup, "PORT")?.unwrap_or(3000);
        let env_storage =
            env_value::<String, _>(&lookup, "STORAGE_DIR")?.unwrap_or_else(|| "./data/images".into());
        let env_db_type =
            env_value::<String, _>(&lookup, "DB_TYPE")?.unwrap_or_else(|| "embedded".into());
        let env_db = env_value::<String, _>(&lookup, "DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/image_cache.db".into());

        let db_type = args.db_type.unwrap_or(env_db_type);
        let backend = MetadataBackend::from_str(&db_type)
            .with_context(|| format!("parsing metadata backend `{}`", db_type))?;

        let metadata = MetadataConfig {
            backend,
            url: args.database_url.unwrap_or(env_db),
            max_connections: pick(args.max_connections, &lookup, "DB_MAX_CONNECTIONS", 5)?,
        };

        let retention_days = match args.retention_days {
            Some(days) => Some(days),
            None => env_value(&lookup, "RETENTION_DAYS")?,
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            metadata,
            gc_interval_secs: pick(args.gc_interval_secs, &lookup, "GC_INTERVAL_SECS", 86_400)?,
            gc_check_secs: pick(args.gc_check_secs, &lookup, "GC_CHECK_SECS", 60)?,
            retention_days,
            orphan_grace_secs: pick(args.orphan_grace_secs, &lookup, "ORPHAN_GRACE_SECS", 3_600)?,
            operation_timeout_secs: pick(
                args.operation_timeout_secs,
                &lookup,
                "OPERATION_TIMEOUT_SECS",
                30,
            )?,
            put_retries: pick(args.put_retries, &lookup, "PUT_RETRIES", 2)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            operation_timeout: Duration::from_secs(self.operation_timeout_secs.max(1)),
            put_retries: self.put_retries,
            ..CacheConfig::default()
        }
    }

    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            min_interval: Duration::from_secs(self.gc_interval_secs),
            retention: self
                .retention_days
                .map(|days| Duration::from_secs(days.saturating_mul(86_400))),
            orphan_grace: Duration::from_secs(self.orphan_grace_secs),
            ..GcConfig::default()
        }
    }

    pub fn gc_check_interval(&self) -> Duration {
        Duration::from_secs(self.gc_check_secs.max(1))
    }
}

/// Flag, else `IMAGE_CACHE_<key>`, else `default`.
fn pick<T, F>(flag: Option<T>, lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match flag {
        Some(value) => Ok(value),
        None => Ok(env_value(lookup, key)?.unwrap_or(default)),
    }
}

fn env_value<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    let name = format!("{ENV_PREFIX}{key}");
    match lookup(&name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
