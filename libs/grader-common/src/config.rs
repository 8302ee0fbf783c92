use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Where job records live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub store_backend: StoreBackend,
    pub port: u16,
    /// Retention of job records in the store
    pub job_ttl_secs: u64,
    pub stream_poll_ms: u64,
    /// Upper bound on one progress stream's lifetime
    pub stream_max_secs: u64,
    pub max_archive_bytes: usize,
    pub max_uncompressed_bytes: u64,
    /// Parent directory for per-run scratch workspaces
    pub workspace_root: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            store_backend: env_or("STORE_BACKEND", StoreBackend::Redis),
            port: env_or("PORT", 8081),
            job_ttl_secs: env_or("JOB_TTL_SECS", 7 * 24 * 3600),
            stream_poll_ms: env_or("STREAM_POLL_MS", 800),
            stream_max_secs: env_or("STREAM_MAX_SECS", 300),
            max_archive_bytes: env_or("MAX_ARCHIVE_BYTES", 20 * 1024 * 1024),
            max_uncompressed_bytes: env_or("MAX_UNCOMPRESSED_BYTES", 200 * 1024 * 1024),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
