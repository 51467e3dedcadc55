use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "MEDIA_PIPELINE_";

/// Centralized application configuration.
/// CLI flags win over `MEDIA_PIPELINE_*` environment variables, which win over
/// the built-in defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub blob_domain: String,
    pub cache_ttl_secs: u64,
    pub workers: usize,
    pub queue_poll_ms: u64,
    pub visibility_timeout_secs: u64,
    pub max_deliveries: u32,
    pub io_retry_attempts: u32,
    pub io_retry_backoff_ms: u64,
    pub watermark_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub dedupe_in_flight: bool,
    pub in_flight_lease_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/blobs".into(),
            database_url: "sqlite://./data/meta/media.db".into(),
            blob_domain: "media-pipeline".into(),
            cache_ttl_secs: 300,
            workers: 2,
            queue_poll_ms: 250,
            visibility_timeout_secs: 120,
            max_deliveries: 5,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 100,
            watermark_timeout_secs: 10,
            max_upload_bytes: 10 * 1024 * 1024,
            dedupe_in_flight: true,
            in_flight_lease_secs: 60,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Media storage with an asynchronous transform pipeline")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_PIPELINE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_PIPELINE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides MEDIA_PIPELINE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_PIPELINE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Leading segment of every blob key (overrides MEDIA_PIPELINE_BLOB_DOMAIN)
    #[arg(long)]
    pub blob_domain: Option<String>,

    /// Number of transform consumers (overrides MEDIA_PIPELINE_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Cache entry lifetime in seconds (overrides MEDIA_PIPELINE_CACHE_TTL_SECS)
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// Largest accepted upload in bytes (overrides MEDIA_PIPELINE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Environment lookup, injectable for tests.
pub trait EnvSource {
    fn var(&self, name: &str) -> Result<Option<String>>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Result<Option<String>> {
        match env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {name}")),
        }
    }
}

fn env_or<T>(source: &dyn EnvSource, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{ENV_PREFIX}{key}");
    match source.var(&name)? {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::resolve(args, &ProcessEnv)?, migrate))
    }

    pub fn resolve(args: Args, source: &dyn EnvSource) -> Result<Self> {
        let d = Self::default();

        // --- Environment fallback ---
        let env_cfg = Self {
            host: env_or(source, "HOST", d.host)?,
            port: env_or(source, "PORT", d.port)?,
            storage_dir: env_or(source, "STORAGE_DIR", d.storage_dir)?,
            database_url: env_or(source, "DATABASE_URL", d.database_url)?,
            blob_domain: env_or(source, "BLOB_DOMAIN", d.blob_domain)?,
            cache_ttl_secs: env_or(source, "CACHE_TTL_SECS", d.cache_ttl_secs)?,
            workers: env_or(source, "WORKERS", d.workers)?,
            queue_poll_ms: env_or(source, "QUEUE_POLL_MS", d.queue_poll_ms)?,
            visibility_timeout_secs: env_or(
                source,
                "VISIBILITY_TIMEOUT_SECS",
                d.visibility_timeout_secs,
            )?,
            max_deliveries: env_or(source, "MAX_DELIVERIES", d.max_deliveries)?,
            io_retry_attempts: env_or(source, "IO_RETRY_ATTEMPTS", d.io_retry_attempts)?,
            io_retry_backoff_ms: env_or(source, "IO_RETRY_BACKOFF_MS", d.io_retry_backoff_ms)?,
            watermark_timeout_secs: env_or(
                source,
                "WATERMARK_TIMEOUT_SECS",
                d.watermark_timeout_secs,
            )?,
            max_upload_bytes: env_or(source, "MAX_UPLOAD_BYTES", d.max_upload_bytes)?,
            dedupe_in_flight: env_or(source, "DEDUPE_IN_FLIGHT", d.dedupe_in_flight)?,
            in_flight_lease_secs: env_or(source, "IN_FLIGHT_LEASE_SECS", d.in_flight_lease_secs)?,
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_cfg.host),
            port: args.port.unwrap_or(env_cfg.port),
            storage_dir: args.storage_dir.unwrap_or(env_cfg.storage_dir),
            database_url: args.database_url.unwrap_or(env_cfg.database_url),
            blob_domain: args.blob_domain.unwrap_or(env_cfg.blob_domain),
            workers: args.workers.unwrap_or(env_cfg.workers),
            cache_ttl_secs: args.cache_ttl_secs.unwrap_or(env_cfg.cache_ttl_secs),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_cfg.max_upload_bytes),
            ..env_cfg
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.io_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<String, String>);

    impl MapEnv {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
                    .collect(),
            )
        }
    }

    impl EnvSource for MapEnv {
        fn var(&self, name: &str) -> Result<Option<String>> {
            Ok(self.0.get(name).cloned())
        }
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let cfg = AppConfig::resolve(Args::default(), &MapEnv::new(&[])).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
    }

    #[test]
    fn flags_override_env() {
        let env = MapEnv::new(&[("PORT", "8080"), ("WORKERS", "4"), ("DEDUPE_IN_FLIGHT", "false")]);
        let args = Args {
            port: Some(9090),
            ..Default::default()
        };
        let cfg = AppConfig::resolve(args, &env).unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.workers, 4);
        assert!(!cfg.dedupe_in_flight);
    }

    #[test]
    fn malformed_number_names_the_variable() {
        let env = MapEnv::new(&[("CACHE_TTL_SECS", "soon")]);
        let err = AppConfig::resolve(Args::default(), &env).unwrap_err();
        assert!(format!("{err:#}").contains("MEDIA_PIPELINE_CACHE_TTL_SECS"));
    }
}
