//! The replication orchestrator.
//!
//! One [`SyncEngine::run`] call performs a full client sync pass: check
//! preconditions, gather local and server changes, detect and resolve
//! conflicts, upload, apply downloads, advance the cursor, update stats.
//!
//! Record-level failures are collected into [`SyncResult::errors`] and
//! never abort the pass; only precondition failures abort.

use crate::config::{ClientState, SyncConfig};
use crate::error::{Error, Result};
use crate::protocol::{BatchOutcome, BatchRequest, BatchStatus, ChangesRequest, WireRecord};
use crate::store::record::Record;
use crate::store::LocalStore;
use crate::sync::conflict::{self, Applied, DetectedConflict, Strategy};
use crate::sync::metadata::{SyncMetadata, SyncStats};
use crate::sync::SyncResult;
use crate::transport::ApiClient;
use crate::util::epoch_ms;
use crate::vault::Vault;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Minimum gap between two runs.
const COOLDOWN_SECS: i64 = 5;

/// Upper bound on change-feed pages fetched in one pass.
const MAX_PAGES: u32 = 50;

/// On-disk files the engine owns.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub metadata: PathBuf,
    pub stats: PathBuf,
    pub state: PathBuf,
}

/// The client sync engine. One per process; `run` is single-flight.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    transport: Arc<ApiClient>,
    vault: Arc<Vault>,
    config: SyncConfig,
    paths: EnginePaths,
    running: RwLock<bool>,
}

/// Clears the single-runner flag when the run unwinds, panics included.
struct RunGuard<'a> {
    flag: &'a RwLock<bool>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.flag.write() = false;
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<ApiClient>,
        vault: Arc<Vault>,
        config: SyncConfig,
        paths: EnginePaths,
    ) -> Self {
        Self {
            store,
            transport,
            vault,
            config,
            paths,
            running: RwLock::new(false),
        }
    }

    /// True while a run is in flight.
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        let mut flag = self.running.write();
        if *flag {
            return Err(Error::InProgress);
        }
        *flag = true;
        Ok(RunGuard {
            flag: &self.running,
        })
    }

    /// Preconditions, checked in order: enabled, authenticated, server
    /// reachable, vault unlocked, cooldown elapsed.
    async fn check_preconditions(&self, meta: &SyncMetadata) -> Result<()> {
        if !self.config.enabled {
            return Err(Error::Unprocessable(
                "sync is disabled in sync_config.json".into(),
            ));
        }

        if !self.transport.has_token() {
            return Err(Error::Unauthenticated);
        }
        let state = ClientState::load(&self.paths.state)?;
        if state.token_expires_at != 0 && state.token_expires_at <= crate::util::epoch_secs() {
            return Err(Error::TokenExpired);
        }

        self.transport.health().await?;

        if !self.vault.is_unlocked() {
            return Err(Error::Locked);
        }

        if meta.last_sync_time != 0 {
            let elapsed_ms = epoch_ms() - meta.last_sync_time;
            if elapsed_ms < COOLDOWN_SECS * 1000 {
                return Err(Error::Cooldown((elapsed_ms / 1000).max(0) as u64));
            }
        }
        Ok(())
    }

    /// One full sync pass.
    pub async fn run(&self) -> Result<SyncResult> {
        let _guard = self.begin()?;

        // 1. Load the replication cursor.
        let mut meta = SyncMetadata::load_or_create(&self.paths.metadata)?;
        self.check_preconditions(&meta).await?;

        let started = Instant::now();
        let since = meta.last_sync_time;
        let mut result = SyncResult::default();

        tracing::info!(since, device = %meta.device_name, "sync run started");

        // 2. Local upload candidates.
        let local_changes = self.store.modified_after(since, self.config.batch_size)?;

        // 3. Server change feed (paged).
        let server_changes = self.fetch_server_changes(&meta, since, &mut result).await;

        // 4. Conflict detection: pair server records with local rows.
        let conflicts = self.detect_conflicts(&server_changes);
        result.conflicts_found = conflicts.len() as u32;

        // 5. Resolve per the configured strategy, persisting winners.
        let conflicted_ids = self.resolve_conflicts(&conflicts, &mut result);

        // 6. Upload. A synced record already matches the server at its
        //    version, and a just-conflicted record's resolved successor
        //    goes up on the next run. Both stay home.
        let to_upload: Vec<Record> = local_changes
            .into_iter()
            .filter(|r| !r.synced)
            .filter(|r| r.server_id == 0 || !conflicted_ids.contains(&r.server_id))
            .collect();
        self.upload(&meta, to_upload, &mut result).await;

        // 7. Apply server changes locally.
        self.apply_server_changes(&server_changes, &conflicted_ids, &mut result);

        // 8. Advance the cursor.
        meta.last_sync_time = epoch_ms();
        meta.sync_version += 1;
        if let Err(e) = meta.save(&self.paths.metadata) {
            result.errors.push(format!("persist sync metadata: {e}"));
        }

        // 9. Counters.
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.persist_stats(&meta, &result);

        tracing::info!(
            uploaded = result.uploaded,
            downloaded = result.downloaded,
            conflicts = result.conflicts_found,
            errors = result.errors.len(),
            "sync run finished"
        );
        Ok(result)
    }

    // ── Step 3: change feed ─────────────────────────────────────────

    async fn fetch_server_changes(
        &self,
        meta: &SyncMetadata,
        since: i64,
        result: &mut SyncResult,
    ) -> Vec<WireRecord> {
        let mut records = Vec::new();
        let mut offset = 0u32;
        for _page in 0..MAX_PAGES {
            let req = ChangesRequest {
                last_sync_time: since,
                limit: self.config.batch_size,
                offset,
                device_id: meta.client_id.clone(),
                device_name: meta.device_name.clone(),
            };
            match self.transport.get_changes(&req).await {
                Ok(resp) => {
                    let fetched = resp.records.len() as u32;
                    records.extend(resp.records);
                    if !resp.has_more {
                        break;
                    }
                    offset += fetched;
                }
                Err(e) => {
                    result.errors.push(format!("fetch changes: {e}"));
                    break;
                }
            }
        }
        records
    }

    // ── Step 4: detection ───────────────────────────────────────────

    fn detect_conflicts(&self, server_changes: &[WireRecord]) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();
        for server_rec in server_changes {
            if server_rec.server_id == 0 {
                continue;
            }
            let local = match self.store.get_by_server_id(server_rec.server_id) {
                Ok(local) => local,
                Err(Error::NotFound) => continue,
                Err(e) => {
                    tracing::warn!("conflict scan: {e}");
                    continue;
                }
            };
            if let Some(kind) = conflict::detect(&local, server_rec) {
                tracing::debug!(
                    server_id = server_rec.server_id,
                    kind = kind.as_str(),
                    "conflict detected"
                );
                conflicts.push(DetectedConflict {
                    local,
                    server: server_rec.clone(),
                    kind,
                });
            }
        }
        conflicts
    }

    // ── Step 5: resolution ──────────────────────────────────────────

    fn resolve_conflicts(
        &self,
        conflicts: &[DetectedConflict],
        result: &mut SyncResult,
    ) -> HashSet<i64> {
        let mut conflicted_ids = HashSet::new();
        let strategy = if self.config.auto_resolve {
            self.config.conflict_strategy
        } else {
            Strategy::Manual
        };

        for c in conflicts {
            conflicted_ids.insert(c.server.server_id);
            match conflict::resolve(strategy, &c.local, &c.server) {
                Ok(Applied::Local(mut resolved)) => match self.store.save(&mut resolved) {
                    Ok(()) => result.conflicts_resolved += 1,
                    Err(e) => result
                        .errors
                        .push(format!("persist resolution for record {}: {e}", c.local.local_id)),
                },
                Ok(Applied::Manual) => {
                    tracing::info!(
                        server_id = c.server.server_id,
                        kind = c.kind.as_str(),
                        "conflict left for manual resolution"
                    );
                }
                Err(e) => result
                    .errors
                    .push(format!("resolve record {}: {e}", c.local.local_id)),
            }
        }
        conflicted_ids
    }

    // ── Step 6: upload ──────────────────────────────────────────────

    async fn upload(&self, meta: &SyncMetadata, records: Vec<Record>, result: &mut SyncResult) {
        if records.is_empty() {
            return;
        }

        let mut pending = records;
        let mut attempt = 0u32;
        loop {
            let req = BatchRequest {
                records: pending.iter().map(WireRecord::from_record).collect(),
                device_id: meta.client_id.clone(),
                device_name: meta.device_name.clone(),
            };

            let resp = match self.transport.process_batch(&req).await {
                Ok(resp) => resp,
                Err(e) => {
                    result.errors.push(format!("upload batch: {e}"));
                    return;
                }
            };

            let mut retry: Vec<Record> = Vec::new();
            for outcome in &resp.results {
                match outcome.status {
                    BatchStatus::Applied => {
                        self.acknowledge(outcome, result);
                    }
                    BatchStatus::Conflict => {
                        // The server opened a conflict row; it surfaces as a
                        // server change on the next pass.
                        result.errors.push(format!(
                            "record {}: version conflict on upload{}",
                            outcome.temp_id,
                            outcome
                                .message
                                .as_deref()
                                .map(|m| format!(" ({m})"))
                                .unwrap_or_default()
                        ));
                    }
                    BatchStatus::Failed => {
                        if let Some(r) = pending.iter().find(|r| r.local_id == outcome.temp_id) {
                            retry.push(r.clone());
                        }
                    }
                }
            }

            if retry.is_empty() {
                return;
            }
            if attempt >= self.config.max_retries {
                for r in &retry {
                    result
                        .errors
                        .push(format!("record {}: upload failed after retries", r.local_id));
                }
                return;
            }
            attempt += 1;
            tracing::debug!(attempt, records = retry.len(), "retrying failed uploads");
            tokio::time::sleep(std::time::Duration::from_secs(self.config.retry_delay)).await;
            pending = retry;
        }
    }

    fn acknowledge(&self, outcome: &BatchOutcome, result: &mut SyncResult) {
        match self
            .store
            .mark_synced(outcome.temp_id, outcome.server_id, outcome.version)
        {
            Ok(true) => result.uploaded += 1,
            Ok(false) => {
                // Raced by a local edit; it goes up on the next pass.
                tracing::debug!(local_id = outcome.temp_id, "ack skipped, record changed");
            }
            Err(e) => result
                .errors
                .push(format!("acknowledge record {}: {e}", outcome.temp_id)),
        }
    }

    // ── Step 7: apply downloads ─────────────────────────────────────

    fn apply_server_changes(
        &self,
        server_changes: &[WireRecord],
        conflicted_ids: &HashSet<i64>,
        result: &mut SyncResult,
    ) {
        for server_rec in server_changes {
            if server_rec.server_id == 0 || conflicted_ids.contains(&server_rec.server_id) {
                continue;
            }
            match self.store.get_by_server_id(server_rec.server_id) {
                Err(Error::NotFound) => {
                    // Unknown record: adopt the server copy as-is.
                    match server_rec.to_record() {
                        Ok(mut record) => {
                            record.synced = true;
                            record.sync_version = record.version;
                            match self.store.save(&mut record) {
                                Ok(()) => result.downloaded += 1,
                                Err(e) => result.errors.push(format!(
                                    "insert server record {}: {e}",
                                    server_rec.server_id
                                )),
                            }
                        }
                        Err(e) => result
                            .errors
                            .push(format!("decode server record {}: {e}", server_rec.server_id)),
                    }
                }
                Ok(local) => {
                    if !local.synced {
                        // Locally newer and unsynced: a conflict was (or will
                        // be) opened; never clobber unpushed edits.
                        continue;
                    }
                    if server_rec.version <= local.version {
                        continue; // already have this state
                    }
                    match server_rec.to_record() {
                        Ok(mut record) => {
                            record.local_id = local.local_id;
                            record.synced = true;
                            record.sync_version = record.version;
                            match self.store.save(&mut record) {
                                Ok(()) => result.downloaded += 1,
                                Err(e) => result.errors.push(format!(
                                    "apply server record {}: {e}",
                                    server_rec.server_id
                                )),
                            }
                        }
                        Err(e) => result
                            .errors
                            .push(format!("decode server record {}: {e}", server_rec.server_id)),
                    }
                }
                Err(e) => result
                    .errors
                    .push(format!("lookup server record {}: {e}", server_rec.server_id)),
            }
        }
    }

    // ── Step 9: counters ────────────────────────────────────────────

    fn persist_stats(&self, meta: &SyncMetadata, result: &SyncResult) {
        match SyncStats::load(&self.paths.stats) {
            Ok(mut stats) => {
                stats.record_run(result);
                if let Err(e) = stats.save(&self.paths.stats) {
                    tracing::warn!("persist sync stats: {e}");
                }
            }
            Err(e) => tracing::warn!("load sync stats: {e}"),
        }

        match ClientState::load(&self.paths.state) {
            Ok(mut state) => {
                state.last_sync = meta.last_sync_time;
                state.records_count = self.store.count().unwrap_or(state.records_count);
                if let Err(e) = state.save(&self.paths.state) {
                    tracing::warn!("persist client state: {e}");
                }
            }
            Err(e) => tracing::warn!("load client state: {e}"),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
