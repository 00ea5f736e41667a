//! Sync bookkeeping persisted between runs: `sync_metadata.json` and
//! `sync_stats.json`.

use crate::error::{Error, Result};
use crate::util::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-client replication cursor, persisted as `sync_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Stable random id identifying this installation to the server.
    pub client_id: String,
    /// Epoch milliseconds of the last completed run; the change-feed cursor.
    pub last_sync_time: i64,
    /// Count of completed runs on this client.
    pub sync_version: i64,
    pub device_name: String,
    pub client_version: String,
}

impl SyncMetadata {
    fn fresh() -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        let device_name = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| format!("keepr-{}", &client_id[..8]));
        Self {
            client_id,
            last_sync_time: 0,
            sync_version: 0,
            device_name,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load the cursor, minting a fresh client identity on first use.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let meta = Self::fresh();
            meta.save(path)?;
            return Ok(meta);
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("corrupt sync_metadata.json: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Storage(format!("sync_metadata encode: {e}")))?;
        atomic_write(path, &json)
    }
}

/// Cumulative client-side counters, persisted as `sync_stats.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub total_uploads: u64,
    pub total_downloads: u64,
    pub total_conflicts: u64,
    pub total_resolutions: u64,
    pub total_duration_ms: u64,
}

impl SyncStats {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("corrupt sync_stats.json: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Storage(format!("sync_stats encode: {e}")))?;
        atomic_write(path, &json)
    }

    /// Fold one finished run into the totals.
    pub fn record_run(&mut self, result: &super::SyncResult) {
        self.total_syncs += 1;
        self.total_uploads += u64::from(result.uploaded);
        self.total_downloads += u64::from(result.downloaded);
        self.total_conflicts += u64::from(result.conflicts_found);
        self.total_resolutions += u64::from(result.conflicts_resolved);
        self.total_duration_ms += result.duration_ms;
    }

    pub fn avg_duration_ms(&self) -> u64 {
        if self.total_syncs == 0 {
            0
        } else {
            self.total_duration_ms / self.total_syncs
        }
    }
}
