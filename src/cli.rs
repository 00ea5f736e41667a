//! Client command implementations.
//!
//! Thin glue between the parsed CLI and the core components. Prompts come
//! from `dialoguer`; everything secret is encrypted by the vault before it
//! touches the store or the wire.

use crate::config::{ClientConfig, ClientState, SyncConfig};
use crate::error::{Error, Result};
use crate::protocol::{Resolution, ResolveRequest};
use crate::store::record::{Meta, Record, RecordKind, RecordPayload};
use crate::store::{ListFilter, LocalStore};
use crate::sync::engine::EnginePaths;
use crate::sync::metadata::{SyncMetadata, SyncStats};
use crate::sync::SyncEngine;
use crate::transport::ApiClient;
use crate::util::{atomic_write, epoch_ms};
use crate::vault::{Vault, DEFAULT_SESSION_TTL};
use std::sync::Arc;

/// Assembled client application.
pub struct App {
    pub config: ClientConfig,
    pub sync_config: SyncConfig,
    pub store: Arc<LocalStore>,
    pub vault: Arc<Vault>,
    pub transport: Arc<ApiClient>,
    pub engine: Arc<SyncEngine>,
}

impl App {
    /// Wire everything up from the environment and the config directory.
    pub fn bootstrap() -> Result<Self> {
        let config = ClientConfig::from_env()?;
        config.ensure_dirs()?;
        tracing::debug!(
            env = ?config.app_env,
            dir = %config.config_dir.display(),
            server = %config.server_address,
            "client configured"
        );

        let sync_config = SyncConfig::load(&config.sync_config_path())?;
        let store = Arc::new(LocalStore::open(&config.records_db_path())?);
        crate::util::restrict_file(&config.records_db_path())?;

        let vault = Arc::new(Vault::open(&config.config_dir, DEFAULT_SESSION_TTL));
        // A fresh process picks up a still-valid crypto session silently.
        let _ = vault.try_restore_session()?;

        let transport = Arc::new(ApiClient::new(&config, &sync_config)?);
        if let Some(token) = read_token(&config) {
            transport.set_token(Some(token));
        }

        let paths = EnginePaths {
            metadata: config.sync_metadata_path(),
            stats: config.sync_stats_path(),
            state: config.state_path(),
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&vault),
            sync_config.clone(),
            paths,
        ));

        Ok(Self {
            config,
            sync_config,
            store,
            vault,
            transport,
            engine,
        })
    }

    fn device_id(&self) -> String {
        SyncMetadata::load_or_create(&self.config.sync_metadata_path())
            .map(|m| m.client_id)
            .unwrap_or_default()
    }

    fn require_unlocked(&self) -> Result<()> {
        if !self.vault.is_unlocked() {
            return Err(Error::Locked);
        }
        Ok(())
    }

    // ── Vault commands ──────────────────────────────────────────────

    pub fn init(&self) -> Result<()> {
        let password = prompt_new_password("Master password")?;
        self.vault.initialize(&password)?;
        self.vault.unlock(&password)?;

        let mut state = ClientState::load(&self.config.state_path())?;
        state.initialized = true;
        state.master_key_hash = self.vault.key_hash()?;
        state.save(&self.config.state_path())?;

        println!("🔐 vault initialized and unlocked");
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let password = prompt_password("Master password")?;
        self.vault.unlock(&password)?;
        println!("🔓 vault unlocked");
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        self.vault.lock()?;
        println!("🔒 vault locked");
        Ok(())
    }

    pub fn change_master(&self) -> Result<()> {
        let old = prompt_password("Current master password")?;
        let new = prompt_new_password("New master password")?;
        self.vault.change_password(&old, &new)?;

        let mut state = ClientState::load(&self.config.state_path())?;
        state.master_key_hash = self.vault.key_hash()?;
        state.save(&self.config.state_path())?;

        println!("🔐 master password changed; records unchanged");
        Ok(())
    }

    // ── Account commands ────────────────────────────────────────────

    pub async fn register(&self, login: &str) -> Result<()> {
        let password = prompt_new_password("Account password")?;
        let resp = self.transport.register(login, &password).await?;
        println!("account created (user id {})", resp.user_id);
        Ok(())
    }

    pub async fn login(&self, login: &str) -> Result<()> {
        let password = prompt_password("Account password")?;
        let resp = self.transport.login(login, &password).await?;

        atomic_write(&self.config.token_path(), resp.token.as_bytes())?;
        self.transport.set_token(Some(resp.token));

        let mut state = ClientState::load(&self.config.state_path())?;
        state.user_login = login.to_string();
        state.token_expires_at = resp.expires_at;
        state.save(&self.config.state_path())?;

        println!("signed in as {login}");
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        let token_path = self.config.token_path();
        if token_path.exists() {
            std::fs::remove_file(&token_path)?;
        }
        self.transport.set_token(None);

        let mut state = ClientState::load(&self.config.state_path())?;
        state.token_expires_at = 0;
        state.save(&self.config.state_path())?;

        println!("signed out");
        Ok(())
    }

    pub async fn change_password(&self) -> Result<()> {
        let old = prompt_password("Current account password")?;
        let new = prompt_new_password("New account password")?;
        self.transport.change_password(&old, &new).await?;
        println!("account password changed");
        Ok(())
    }

    // ── Record commands ─────────────────────────────────────────────

    /// Encrypt a payload and save it as a new local record.
    pub fn add_record(&self, payload: RecordPayload, title: &str, mut meta: Meta) -> Result<i64> {
        self.require_unlocked()?;
        payload.validate()?;

        if !title.is_empty() {
            meta.insert("title".into(), title.to_string());
        }
        let ciphertext = self.vault.encrypt(&payload.to_bytes()?)?;
        let mut record = Record::new(payload.kind(), ciphertext, meta, &self.device_id());
        self.store.save(&mut record)?;

        println!("added {} record #{}", record.kind, record.local_id);
        Ok(record.local_id)
    }

    pub fn list(&self, kind: Option<RecordKind>, deleted: bool, limit: u32, offset: u32) -> Result<()> {
        let records = self.store.list(&ListFilter {
            kind,
            show_deleted: deleted,
            limit,
            offset,
        })?;
        if records.is_empty() {
            println!("no records");
            return Ok(());
        }
        for r in records {
            println!("{}", format_record_line(&r));
        }
        Ok(())
    }

    pub fn show(&self, local_id: i64) -> Result<()> {
        self.require_unlocked()?;
        let record = self.store.get(local_id)?;
        let plaintext = self.vault.decrypt(&record.ciphertext)?;
        let payload = RecordPayload::from_bytes(&plaintext)?;

        println!("#{} {} v{}", record.local_id, record.kind, record.version);
        if !record.title().is_empty() {
            println!("title: {}", record.title());
        }
        match payload {
            RecordPayload::Login {
                username,
                password,
                url,
                notes,
            } => {
                println!("username: {username}");
                println!("password: {password}");
                if !url.is_empty() {
                    println!("url: {url}");
                }
                if !notes.is_empty() {
                    println!("notes: {notes}");
                }
            }
            RecordPayload::Text { content } => println!("{content}"),
            RecordPayload::Card {
                number,
                holder,
                expiry,
                cvv,
            } => {
                println!("number: {number}");
                if !holder.is_empty() {
                    println!("holder: {holder}");
                }
                println!("expiry: {expiry}");
                println!("cvv: {cvv}");
            }
            RecordPayload::Binary { filename, data } => {
                println!("filename: {filename} ({} bytes)", data.len());
            }
        }
        Ok(())
    }

    /// Write a decrypted binary record to a file.
    pub fn export(&self, local_id: i64, out_path: &std::path::Path) -> Result<()> {
        self.require_unlocked()?;
        let record = self.store.get(local_id)?;
        let plaintext = self.vault.decrypt(&record.ciphertext)?;
        match RecordPayload::from_bytes(&plaintext)? {
            RecordPayload::Binary { data, .. } => {
                std::fs::write(out_path, data)?;
                println!("wrote {}", out_path.display());
                Ok(())
            }
            _ => Err(Error::Unprocessable("record is not a binary blob".into())),
        }
    }

    pub fn edit_title(&self, local_id: i64, title: &str) -> Result<()> {
        let mut record = self.store.get(local_id)?;
        if record.is_deleted() {
            return Err(Error::Deleted);
        }
        record.meta.insert("title".into(), title.to_string());
        record.touch(&self.device_id());
        self.store.update(&mut record)?;
        println!("record #{local_id} renamed");
        Ok(())
    }

    pub fn remove(&self, local_id: i64, purge: bool) -> Result<()> {
        if purge {
            self.store.hard_delete(local_id)?;
            println!("record #{local_id} purged locally");
        } else {
            self.store.soft_delete(local_id, &self.device_id())?;
            println!("record #{local_id} deleted (syncs on next run)");
        }
        Ok(())
    }

    // ── Sync commands ───────────────────────────────────────────────

    pub async fn sync(&self) -> Result<()> {
        let result = self.engine.run().await?;
        println!(
            "sync: {} up, {} down, {} conflicts ({} resolved) in {}ms",
            result.uploaded,
            result.downloaded,
            result.conflicts_found,
            result.conflicts_resolved,
            result.duration_ms
        );
        for err in &result.errors {
            eprintln!("  ⚠️  {err}");
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<()> {
        let state = ClientState::load(&self.config.state_path())?;
        let stats = SyncStats::load(&self.config.sync_stats_path())?;

        println!("vault: {}", match (self.vault.exists(), self.vault.is_unlocked()) {
            (false, _) => "not initialized",
            (true, true) => "unlocked",
            (true, false) => "locked",
        });
        println!(
            "account: {}",
            if state.user_login.is_empty() {
                "not signed in".to_string()
            } else {
                state.user_login.clone()
            }
        );
        println!("records: {}", self.store.count()?);
        if state.last_sync > 0 {
            println!("last sync: {}ms ago", epoch_ms() - state.last_sync);
        } else {
            println!("last sync: never");
        }
        println!(
            "totals: {} syncs, {} up, {} down, {} conflicts, avg {}ms",
            stats.total_syncs,
            stats.total_uploads,
            stats.total_downloads,
            stats.total_conflicts,
            stats.avg_duration_ms()
        );

        // Server-side view, best effort.
        if self.transport.has_token() {
            match self.transport.get_status().await {
                Ok(remote) => println!(
                    "server: {} records, {} open conflicts",
                    remote.records_count, remote.open_conflicts
                ),
                Err(e) => println!("server: unavailable ({e})"),
            }
        }
        Ok(())
    }

    pub async fn conflicts_list(&self) -> Result<()> {
        let resp = self.transport.get_conflicts().await?;
        if resp.conflicts.is_empty() {
            println!("no open conflicts");
            return Ok(());
        }
        for c in resp.conflicts {
            println!(
                "#{} record {} ({}) from device {} at {}",
                c.id,
                c.record_id,
                c.conflict_type.as_str(),
                c.device_id,
                c.created_at
            );
        }
        Ok(())
    }

    pub async fn conflicts_resolve(&self, id: i64, resolution: Resolution) -> Result<()> {
        let resp = self
            .transport
            .resolve_conflict(
                id,
                &ResolveRequest {
                    resolution,
                    resolved_data: None,
                },
            )
            .await?;
        println!(
            "conflict #{id} resolved: record {} now at v{}",
            resp.record_id, resp.version
        );
        Ok(())
    }

    pub async fn devices_list(&self) -> Result<()> {
        let resp = self.transport.list_devices().await?;
        if resp.devices.is_empty() {
            println!("no devices registered");
            return Ok(());
        }
        for d in resp.devices {
            println!("{}  {}  last sync {}", d.id, d.name, d.last_sync_time);
        }
        Ok(())
    }

    pub async fn devices_remove(&self, id: &str) -> Result<()> {
        self.transport.remove_device(id).await?;
        println!("device {id} removed");
        Ok(())
    }

    /// Foreground periodic sync until ctrl-c.
    pub async fn watch(&self) -> Result<()> {
        let cancel = tokio_util::sync::CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                signal_cancel.cancel();
            }
        });

        println!(
            "watching; syncing every {}s (ctrl-c to stop)",
            self.config.sync_interval.as_secs()
        );
        crate::sync::ticker::run_loop(
            Arc::clone(&self.engine),
            self.config.sync_interval,
            cancel,
        )
        .await;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn read_token(config: &ClientConfig) -> Option<String> {
    let raw = std::fs::read_to_string(config.token_path()).ok()?;
    let token = raw.trim().to_string();
    (!token.is_empty()).then_some(token)
}

fn prompt_password(prompt: &str) -> Result<String> {
    dialoguer::Password::new()
        .with_prompt(prompt)
        .interact()
        .map_err(|e| Error::Storage(format!("prompt failed: {e}")))
}

fn prompt_new_password(prompt: &str) -> Result<String> {
    dialoguer::Password::new()
        .with_prompt(prompt)
        .with_confirmation("Confirm", "passwords do not match")
        .interact()
        .map_err(|e| Error::Storage(format!("prompt failed: {e}")))
}

fn format_record_line(r: &Record) -> String {
    let mut flags = String::new();
    if r.is_deleted() {
        flags.push_str(" [deleted]");
    }
    if !r.synced {
        flags.push_str(" [unsynced]");
    }
    let title = if r.title().is_empty() { "(untitled)" } else { r.title() };
    format!("#{:<4} {:<7} v{:<3} {}{}", r.local_id, r.kind.to_string(), r.version, title, flags)
}
