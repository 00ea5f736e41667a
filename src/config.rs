//! Configuration: environment-driven settings for the client and the
//! server, plus the JSON state files persisted under the client's
//! per-user configuration directory.

use crate::error::{Error, Result};
use crate::sync::conflict::Strategy;
use crate::util::{atomic_write, ensure_private_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment flavor; mostly drives log formatting defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    #[default]
    Local,
    Dev,
    Prod,
}

impl AppEnv {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => Err(Error::Storage(format!(
                "APP_ENV must be local|dev|prod, got '{other}'"
            ))),
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Client process configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_address: String,
    pub config_dir: PathBuf,
    pub app_env: AppEnv,
    pub enable_tls: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub sync_interval: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_address = lookup("SERVER_ADDRESS")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let config_dir = match lookup("CONFIG_DIR") {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_config_dir()?,
        };

        let app_env = match lookup("APP_ENV") {
            Some(v) if !v.trim().is_empty() => AppEnv::parse(v.trim())?,
            _ => AppEnv::Local,
        };

        let enable_tls = lookup("ENABLE_TLS")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let ca_cert_path = lookup("CA_CERT_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let sync_interval = lookup("SYNC_INTERVAL_SECONDS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        Ok(Self {
            server_address,
            config_dir,
            app_env,
            enable_tls,
            ca_cert_path,
            sync_interval,
        })
    }

    /// Create the config directory (0700) if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        ensure_private_dir(&self.config_dir)
    }

    pub fn records_db_path(&self) -> PathBuf {
        self.config_dir.join("records.db")
    }

    pub fn token_path(&self) -> PathBuf {
        self.config_dir.join("token")
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    pub fn sync_metadata_path(&self) -> PathBuf {
        self.config_dir.join("sync_metadata.json")
    }

    pub fn sync_stats_path(&self) -> PathBuf {
        self.config_dir.join("sync_stats.json")
    }

    pub fn sync_config_path(&self) -> PathBuf {
        self.config_dir.join("sync_config.json")
    }
}

fn default_config_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("dev", "keepr", "keepr")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| Error::Storage("cannot resolve a home directory".into()))
}

// ── Server ──────────────────────────────────────────────────────────

/// Server process configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite path from `DATABASE_URI` (`sqlite://<path>` or a bare path).
    pub database_path: PathBuf,
    pub run_address: String,
    pub app_env: AppEnv,
    /// Validated if set; the embedded schema bootstrap remains authoritative.
    pub migrations_path: Option<PathBuf>,
    /// Per-user storage quota in bytes.
    pub storage_quota_bytes: u64,
    /// Bearer session lifetime in seconds.
    pub session_ttl_secs: u64,
    /// Default page size for change feeds.
    pub batch_size: u32,
    /// Hard cap any client-requested limit is clamped to.
    pub max_batch_size: u32,
}

/// Default per-user quota: 256 MiB.
const DEFAULT_QUOTA_BYTES: u64 = 256 * 1024 * 1024;

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_path = lookup("DATABASE_URI")
            .filter(|v| !v.trim().is_empty())
            .map(|uri| parse_database_uri(&uri))
            .transpose()?
            .unwrap_or_else(|| PathBuf::from("keepr-server.db"));

        let run_address = lookup("RUN_ADDRESS")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let app_env = match lookup("APP_ENV") {
            Some(v) if !v.trim().is_empty() => AppEnv::parse(v.trim())?,
            _ => AppEnv::Local,
        };

        let migrations_path = lookup("MIGRATIONS_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        if let Some(ref path) = migrations_path {
            if !path.exists() {
                return Err(Error::Storage(format!(
                    "MIGRATIONS_PATH does not exist: {}",
                    path.display()
                )));
            }
        }

        let storage_quota_bytes = lookup("KEEPR_STORAGE_QUOTA_BYTES")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_QUOTA_BYTES);

        let session_ttl_secs = lookup("KEEPR_SESSION_TTL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30 * 24 * 3600);

        Ok(Self {
            database_path,
            run_address,
            app_env,
            migrations_path,
            storage_quota_bytes,
            session_ttl_secs,
            batch_size: 100,
            max_batch_size: 500,
        })
    }
}

fn parse_database_uri(uri: &str) -> Result<PathBuf> {
    let trimmed = uri.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);
    if path.is_empty() {
        return Err(Error::Storage("DATABASE_URI has an empty path".into()));
    }
    Ok(PathBuf::from(path))
}

// ── sync_config.json ────────────────────────────────────────────────

/// Client sync policy, persisted as `sync_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    /// Fixed delay between retries, seconds.
    pub retry_delay: u64,
    pub conflict_strategy: Strategy,
    pub auto_resolve: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            batch_size: 100,
            max_retries: 3,
            retry_delay: 2,
            conflict_strategy: Strategy::Newer,
            auto_resolve: true,
        }
    }
}

impl SyncConfig {
    /// Load from disk, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("corrupt sync_config.json: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Storage(format!("sync_config encode: {e}")))?;
        atomic_write(path, &json)
    }
}

// ── state.json ──────────────────────────────────────────────────────

/// Client-local bookkeeping, persisted as `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientState {
    pub initialized: bool,
    #[serde(default)]
    pub user_login: String,
    /// Epoch milliseconds of the last successful sync.
    #[serde(default)]
    pub last_sync: i64,
    #[serde(default)]
    pub records_count: u64,
    /// The vault header's verifier, for display only.
    #[serde(default)]
    pub master_key_hash: String,
    /// Epoch seconds; the locally known bearer-token expiry.
    #[serde(default)]
    pub token_expires_at: i64,
}

impl ClientState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("corrupt state.json: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Storage(format!("state encode: {e}")))?;
        atomic_write(path, &json)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
