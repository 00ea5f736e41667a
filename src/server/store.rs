//! Server-side durable store.
//!
//! Tables:
//! - `users`: login, password hash (PBKDF2-HMAC-SHA256), salt
//! - `sessions`: token_hash, user_id, expires_at
//! - `records`: per-user encrypted records with version + soft-delete
//! - `record_versions`: append-only history, one row per mutation
//! - `conflicts`: open/closed replication disagreements
//! - `devices`: registered devices with last sync times
//! - `sync_state` / `sync_stats`: per-user counters
//!
//! Record ciphertext is an opaque BLOB; the server never holds plaintext.
//! Concurrency correctness hinges on the conditional update in
//! [`ServerStore::update_record`]: a single `UPDATE … WHERE id=? AND
//! version=? AND deleted_at IS NULL` linearizes concurrent writers.

use crate::error::{Error, Result};
use crate::protocol::{ConflictType, Resolution, SyncStatsSummary, WireRecord};
use crate::store::record::{checksum_of, Meta, RecordKind};
use crate::util::{constant_time_eq, epoch_ms, epoch_secs};
use base64::Engine as _;
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::path::Path;

/// PBKDF2 iterations for account passwords.
const PASSWORD_ITERATIONS: u32 = 100_000;

/// Salt bytes for account password hashing.
const SALT_BYTES: usize = 16;

/// Token bytes before hex encoding.
const TOKEN_BYTES: usize = 32;

/// A stored user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub login: String,
}

/// A record as the server stores it.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: RecordKind,
    pub ciphertext: Vec<u8>,
    pub meta: Meta,
    pub version: i64,
    pub last_modified: i64,
    pub deleted_at: Option<i64>,
    pub checksum: String,
    pub device_id: String,
}

impl ServerRecord {
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            server_id: self.id,
            temp_id: 0,
            kind: self.kind,
            ciphertext: base64::engine::general_purpose::STANDARD.encode(&self.ciphertext),
            meta: self.meta.clone(),
            version: self.version,
            last_modified: self.last_modified,
            deleted_at: self.deleted_at,
            checksum: self.checksum.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// A stored conflict row.
#[derive(Debug, Clone)]
pub struct ConflictRow {
    pub id: i64,
    pub user_id: i64,
    pub record_id: i64,
    pub device_id: String,
    pub local_data: WireRecord,
    pub server_data: WireRecord,
    pub conflict_type: ConflictType,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    pub device_type: String,
    pub last_sync_time: i64,
    pub created_at: i64,
}

/// Outcome of one record inside a batch.
#[derive(Debug)]
pub enum BatchItemOutcome {
    Applied { server_id: i64, version: i64 },
    Conflict { server_id: i64, stored_version: i64 },
    Failed { message: String },
}

/// SQLite-backed server store.
pub struct ServerStore {
    conn: Mutex<Connection>,
    session_ttl_secs: u64,
    quota_bytes: u64,
}

impl ServerStore {
    pub fn open(db_path: &Path, session_ttl_secs: u64, quota_bytes: u64) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl_secs,
            quota_bytes,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(quota_bytes: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl_secs: 3600,
            quota_bytes,
        })
    }

    // ── Users & sessions ────────────────────────────────────────────

    /// Register a new user. Returns the user id.
    pub fn register(&self, login: &str, password: &str) -> Result<i64> {
        let trimmed = login.trim();
        if trimmed.is_empty() {
            return Err(Error::Unprocessable("login cannot be empty".into()));
        }
        if trimmed.len() > 64 {
            return Err(Error::Unprocessable("login too long (max 64)".into()));
        }
        if password.len() < 8 {
            return Err(Error::Unprocessable(
                "password must be at least 8 characters".into(),
            ));
        }

        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs();

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (login, password_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![trimmed, password_hash, salt, now],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Unprocessable(format!(
                    "login '{trimmed}' is already taken"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify credentials. Returns the user on success.
    pub fn authenticate(&self, login: &str, password: &str) -> Result<User> {
        let conn = self.conn.lock();
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT id, password_hash, salt FROM users WHERE login = ?1 COLLATE NOCASE",
                params![login.trim()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((id, stored_hash, salt)) => {
                let attempt = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt.as_bytes()) {
                    return Err(Error::BadCredentials);
                }
                Ok(User {
                    id,
                    login: login.trim().to_string(),
                })
            }
            None => {
                // Dummy hash to keep unknown-user timing in line
                let _ = hash_password(password, "0000000000000000");
                Err(Error::BadCredentials)
            }
        }
    }

    /// Mint a bearer token. Only its hash is stored.
    pub fn create_session(&self, user_id: i64) -> Result<(String, i64)> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();
        let expires_at = now + self.session_ttl_secs as i64;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_hash, user_id, now, expires_at],
        )?;
        Ok((token, expires_at))
    }

    /// Resolve a bearer token to its user. Expired or unknown → error.
    pub fn validate_token(&self, token: &str) -> Result<i64> {
        let token_hash = hash_token(token);
        let now = epoch_secs();

        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id FROM sessions WHERE token_hash = ?1 AND expires_at > ?2",
            params![token_hash, now],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::Unauthenticated)
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Drop expired sessions. Called from a periodic sweep.
    pub fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = epoch_secs();
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(deleted as u64)
    }

    /// Change the account password after verifying the old one.
    pub fn change_password(&self, user_id: i64, old: &str, new: &str) -> Result<()> {
        if new.len() < 8 {
            return Err(Error::Unprocessable(
                "password must be at least 8 characters".into(),
            ));
        }
        let conn = self.conn.lock();
        let (stored_hash, salt): (String, String) = conn
            .query_row(
                "SELECT password_hash, salt FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        if !constant_time_eq(stored_hash.as_bytes(), hash_password(old, &salt).as_bytes()) {
            return Err(Error::BadCredentials);
        }

        let new_salt = generate_salt();
        let new_hash = hash_password(new, &new_salt);
        conn.execute(
            "UPDATE users SET password_hash = ?2, salt = ?3 WHERE id = ?1",
            params![user_id, new_hash, new_salt],
        )?;
        Ok(())
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Create a record at version 1 and write its first history row.
    pub fn create_record(
        &self,
        user_id: i64,
        kind: RecordKind,
        ciphertext: Vec<u8>,
        meta: Meta,
        device_id: &str,
    ) -> Result<ServerRecord> {
        let now = epoch_ms();
        let checksum = checksum_of(&ciphertext, kind, &meta);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO records
             (user_id, kind, ciphertext, meta, version, last_modified,
              deleted_at, checksum, device_id, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, ?6, ?7, ?8)",
            params![
                user_id,
                kind.as_str(),
                ciphertext,
                encode_meta(&meta)?,
                now,
                checksum,
                device_id,
                epoch_secs(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        insert_history(&tx, id, 1, &ciphertext, &meta, device_id)?;
        tx.commit()?;

        Ok(ServerRecord {
            id,
            user_id,
            kind,
            ciphertext,
            meta,
            version: 1,
            last_modified: now,
            deleted_at: None,
            checksum,
            device_id: device_id.to_string(),
        })
    }

    /// The conditional update: succeeds only when the stored version equals
    /// `expected_version` and the record is not deleted. Exactly one of two
    /// concurrent callers with the same expectation wins.
    pub fn update_record(
        &self,
        user_id: i64,
        id: i64,
        kind: RecordKind,
        ciphertext: Vec<u8>,
        meta: Meta,
        expected_version: i64,
        device_id: &str,
    ) -> Result<(i64, i64)> {
        let now = epoch_ms();
        let checksum = checksum_of(&ciphertext, kind, &meta);
        let new_version = expected_version + 1;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE records SET
                kind = ?4, ciphertext = ?5, meta = ?6, version = ?7,
                last_modified = MAX(?8, last_modified + 1), checksum = ?9, device_id = ?10
             WHERE id = ?1 AND user_id = ?2 AND version = ?3 AND deleted_at IS NULL",
            params![
                id,
                user_id,
                expected_version,
                kind.as_str(),
                ciphertext,
                encode_meta(&meta)?,
                new_version,
                now,
                checksum,
                device_id,
            ],
        )?;

        if changed == 0 {
            // Distinguish stale from missing/deleted. No history row either way.
            let stored: Option<(i64, Option<i64>)> = tx
                .query_row(
                    "SELECT version, deleted_at FROM records WHERE id = ?1 AND user_id = ?2",
                    params![id, user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            return match stored {
                Some((version, None)) => Err(Error::VersionMismatch {
                    expected: expected_version,
                    stored: version,
                }),
                _ => Err(Error::NotFound),
            };
        }

        insert_history(&tx, id, new_version, &ciphertext, &meta, device_id)?;
        let last_modified: i64 = tx.query_row(
            "SELECT last_modified FROM records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((new_version, last_modified))
    }

    /// Fetch one record. Soft-deleted records report `Deleted`.
    pub fn find_record(&self, user_id: i64, id: i64) -> Result<ServerRecord> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {REC_COLUMNS} FROM records WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
                row_to_server_record,
            )
            .optional()?
            .ok_or(Error::NotFound)?;
        if record.deleted_at.is_some() {
            return Err(Error::Deleted);
        }
        Ok(record)
    }

    /// Soft-delete. Idempotent: deleting a deleted record succeeds without
    /// a version bump.
    pub fn soft_delete_record(&self, user_id: i64, id: i64, device_id: &str) -> Result<i64> {
        let now = epoch_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let stored: Option<(i64, Option<i64>)> = tx
            .query_row(
                "SELECT version, deleted_at FROM records WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (version, deleted_at) = stored.ok_or(Error::NotFound)?;
        if deleted_at.is_some() {
            tx.commit()?;
            return Ok(version);
        }

        let new_version = version + 1;
        tx.execute(
            "UPDATE records SET
                deleted_at = ?3, version = ?4,
                last_modified = MAX(?3, last_modified + 1), device_id = ?5
             WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, now, new_version, device_id],
        )?;
        tx.commit()?;
        Ok(new_version)
    }

    /// Live records for a user, newest first. No ciphertext is exposed by
    /// the listing handler, but rows carry it for internal reuse.
    pub fn list_records(&self, user_id: i64) -> Result<Vec<ServerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REC_COLUMNS} FROM records
             WHERE user_id = ?1 AND deleted_at IS NULL
             ORDER BY last_modified DESC"
        ))?;
        let records = stmt
            .query_map(params![user_id], row_to_server_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Title-substring search over live records, optionally by kind.
    pub fn search_records(
        &self,
        user_id: i64,
        title_query: &str,
        kind: Option<RecordKind>,
    ) -> Result<Vec<ServerRecord>> {
        let all = self.list_records(user_id)?;
        let needle = title_query.to_lowercase();
        Ok(all
            .into_iter()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| {
                r.meta
                    .get("title")
                    .map(|t| t.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Change feed: records modified after `since`, soft-deleted included,
    /// ascending. Returns `(page, has_more)`.
    pub fn modified_since(
        &self,
        user_id: i64,
        since: i64,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ServerRecord>, bool)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REC_COLUMNS} FROM records
             WHERE user_id = ?1 AND last_modified > ?2
             ORDER BY last_modified ASC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let records = stmt
            .query_map(params![user_id, since, limit, offset], row_to_server_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let has_more = records.len() as u32 == limit;
        Ok((records, has_more))
    }

    pub fn count_records(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE user_id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Bytes of ciphertext currently stored for a user.
    pub fn storage_usage(&self, user_id: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(ciphertext)), 0) FROM records WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    /// Per-kind live record counts.
    pub fn record_kind_counts(&self, user_id: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM records
             WHERE user_id = ?1 AND deleted_at IS NULL
             GROUP BY kind ORDER BY kind",
        )?;
        let counts = stmt
            .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    pub fn history_count(&self, record_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM record_versions WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ── Batch sync ──────────────────────────────────────────────────

    /// Apply a client batch. The whole batch is refused when it would
    /// exceed the user's storage quota; otherwise records apply in
    /// `(version, last_modified)` order, each in its own transaction, and
    /// failures never roll back earlier successes.
    pub fn apply_batch(
        &self,
        user_id: i64,
        mut records: Vec<WireRecord>,
        device_id: &str,
    ) -> Result<Vec<(i64, BatchItemOutcome)>> {
        // Quota first: current usage + incoming payload, no partial writes.
        let incoming_bytes: u64 = records
            .iter()
            .map(|r| r.ciphertext_bytes().map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        if self.storage_usage(user_id)? + incoming_bytes > self.quota_bytes {
            return Err(Error::QuotaExceeded);
        }

        // Minimize spurious conflicts from out-of-order submissions.
        records.sort_by_key(|r| (r.version, r.last_modified));

        let mut outcomes = Vec::with_capacity(records.len());
        for wire in records {
            let temp_id = wire.temp_id;
            // Per-record failures never abort the batch or roll back
            // earlier successes.
            let outcome = match self.apply_one(user_id, &wire, device_id) {
                Ok(outcome) => outcome,
                Err(e) => BatchItemOutcome::Failed {
                    message: e.to_string(),
                },
            };
            outcomes.push((temp_id, outcome));
        }

        self.bump_sync_version(user_id)?;
        Ok(outcomes)
    }

    /// One record, one transaction.
    fn apply_one(
        &self,
        user_id: i64,
        wire: &WireRecord,
        device_id: &str,
    ) -> Result<BatchItemOutcome> {
        let ciphertext = match wire.ciphertext_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(Error::Unprocessable(e.to_string())),
        };
        let checksum = checksum_of(&ciphertext, wire.kind, &wire.meta);
        let meta_json = encode_meta(&wire.meta)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let stored: Option<ServerRecord> = if wire.server_id != 0 {
            tx.query_row(
                &format!("SELECT {REC_COLUMNS} FROM records WHERE id = ?1 AND user_id = ?2"),
                params![wire.server_id, user_id],
                row_to_server_record,
            )
            .optional()?
        } else {
            None
        };

        let outcome = match stored {
            None => {
                // Unknown to the server: insert, preserving an explicit id
                // when the client already holds one.
                if wire.server_id != 0 {
                    tx.execute(
                        "INSERT INTO records
                         (id, user_id, kind, ciphertext, meta, version, last_modified,
                          deleted_at, checksum, device_id, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        params![
                            wire.server_id,
                            user_id,
                            wire.kind.as_str(),
                            ciphertext,
                            meta_json,
                            wire.version,
                            wire.last_modified,
                            wire.deleted_at,
                            checksum,
                            device_id,
                            epoch_secs(),
                        ],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO records
                         (user_id, kind, ciphertext, meta, version, last_modified,
                          deleted_at, checksum, device_id, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            user_id,
                            wire.kind.as_str(),
                            ciphertext,
                            meta_json,
                            wire.version,
                            wire.last_modified,
                            wire.deleted_at,
                            checksum,
                            device_id,
                            epoch_secs(),
                        ],
                    )?;
                }
                let id = if wire.server_id != 0 {
                    wire.server_id
                } else {
                    tx.last_insert_rowid()
                };
                insert_history(&tx, id, wire.version, &ciphertext, &wire.meta, device_id)?;
                BatchItemOutcome::Applied {
                    server_id: id,
                    version: wire.version,
                }
            }
            Some(existing) if wire.version > existing.version => {
                // deleted_at is monotonic: once set it may move forward,
                // never revert to null.
                let deleted_at = match (existing.deleted_at, wire.deleted_at) {
                    (Some(prev), Some(incoming)) => Some(prev.max(incoming)),
                    (Some(prev), None) => Some(prev),
                    (None, incoming) => incoming,
                };
                tx.execute(
                    "UPDATE records SET
                        kind = ?3, ciphertext = ?4, meta = ?5, version = ?6,
                        last_modified = ?7, deleted_at = ?8, checksum = ?9, device_id = ?10
                     WHERE id = ?1 AND user_id = ?2",
                    params![
                        existing.id,
                        user_id,
                        wire.kind.as_str(),
                        ciphertext,
                        meta_json,
                        wire.version,
                        wire.last_modified,
                        deleted_at,
                        checksum,
                        device_id,
                    ],
                )?;
                insert_history(&tx, existing.id, wire.version, &ciphertext, &wire.meta, device_id)?;
                BatchItemOutcome::Applied {
                    server_id: existing.id,
                    version: wire.version,
                }
            }
            Some(existing) => {
                // Stale upload: open a conflict row, keep the server copy.
                let mut incoming = wire.clone();
                incoming.server_id = existing.id;
                tx.execute(
                    "INSERT INTO conflicts
                     (user_id, record_id, device_id, local_data, server_data,
                      conflict_type, resolved, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                    params![
                        user_id,
                        existing.id,
                        device_id,
                        encode_wire(&incoming)?,
                        encode_wire(&existing.to_wire())?,
                        ConflictType::VersionMismatch.as_str(),
                        epoch_secs(),
                    ],
                )?;
                BatchItemOutcome::Conflict {
                    server_id: existing.id,
                    stored_version: existing.version,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    // ── Conflicts ───────────────────────────────────────────────────

    pub fn open_conflicts(&self, user_id: i64) -> Result<Vec<ConflictRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE user_id = ?1 AND resolved = 0
             ORDER BY created_at ASC"
        ))?;
        let conflicts = stmt
            .query_map(params![user_id], row_to_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    pub fn open_conflict_count(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE user_id = ?1 AND resolved = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Close a conflict. Every resolution bumps the record version exactly
    /// once; `client` and `merged` also replace the record content.
    pub fn resolve_conflict(
        &self,
        user_id: i64,
        conflict_id: i64,
        resolution: Resolution,
        resolved_ciphertext: Option<Vec<u8>>,
        resolved_meta: Option<Meta>,
    ) -> Result<(i64, i64)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let conflict = tx
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM conflicts
                     WHERE id = ?1 AND user_id = ?2"
                ),
                params![conflict_id, user_id],
                row_to_conflict,
            )
            .optional()?
            .ok_or(Error::NotFound)?;
        if conflict.resolved {
            return Err(Error::Unprocessable("conflict is already resolved".into()));
        }

        let record = tx
            .query_row(
                &format!("SELECT {REC_COLUMNS} FROM records WHERE id = ?1 AND user_id = ?2"),
                params![conflict.record_id, user_id],
                row_to_server_record,
            )
            .optional()?
            .ok_or(Error::NotFound)?;
        let new_version = record.version + 1;
        let now = epoch_ms();

        // Pick the content the record ends up holding.
        let replacement: Option<(RecordKind, Vec<u8>, Meta)> = match resolution {
            Resolution::Server => None,
            Resolution::Client => {
                let bytes = conflict.local_data.ciphertext_bytes()?;
                Some((conflict.local_data.kind, bytes, conflict.local_data.meta.clone()))
            }
            Resolution::Merged => {
                let ciphertext = resolved_ciphertext.ok_or_else(|| {
                    Error::Unprocessable("merged resolution requires resolved_data".into())
                })?;
                Some((record.kind, ciphertext, resolved_meta.unwrap_or_default()))
            }
        };

        match replacement {
            Some((kind, ciphertext, meta)) => {
                let checksum = checksum_of(&ciphertext, kind, &meta);
                tx.execute(
                    "UPDATE records SET
                        kind = ?3, ciphertext = ?4, meta = ?5, version = ?6,
                        last_modified = MAX(?7, last_modified + 1), checksum = ?8
                     WHERE id = ?1 AND user_id = ?2",
                    params![
                        record.id,
                        user_id,
                        kind.as_str(),
                        ciphertext,
                        encode_meta(&meta)?,
                        new_version,
                        now,
                        checksum,
                    ],
                )?;
                insert_history(&tx, record.id, new_version, &ciphertext, &meta, &conflict.device_id)?;
            }
            None => {
                tx.execute(
                    "UPDATE records SET
                        version = ?3, last_modified = MAX(?4, last_modified + 1)
                     WHERE id = ?1 AND user_id = ?2",
                    params![record.id, user_id, new_version, now],
                )?;
                insert_history(
                    &tx,
                    record.id,
                    new_version,
                    &record.ciphertext,
                    &record.meta,
                    &conflict.device_id,
                )?;
            }
        }

        tx.execute(
            "UPDATE conflicts SET resolved = 1, resolution = ?2, resolved_at = ?3
             WHERE id = ?1",
            params![conflict_id, resolution.as_str(), epoch_secs()],
        )?;
        tx.commit()?;
        drop(conn); // note_resolution re-locks

        self.note_resolution(user_id)?;
        Ok((record.id, new_version))
    }

    // ── Devices ─────────────────────────────────────────────────────

    /// Register or refresh a device. Called on every sync endpoint hit.
    pub fn upsert_device(
        &self,
        user_id: i64,
        device_id: &str,
        name: &str,
        device_type: &str,
    ) -> Result<()> {
        if device_id.trim().is_empty() {
            return Ok(());
        }
        let now = epoch_secs();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (id, user_id, name, type, last_sync_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE name END,
                last_sync_time = excluded.last_sync_time",
            params![device_id, user_id, name, device_type, now],
        )?;
        Ok(())
    }

    pub fn list_devices(&self, user_id: i64) -> Result<Vec<DeviceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, type, last_sync_time, created_at
             FROM devices WHERE user_id = ?1 ORDER BY last_sync_time DESC",
        )?;
        let devices = stmt
            .query_map(params![user_id], |row| {
                Ok(DeviceRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    device_type: row.get(3)?,
                    last_sync_time: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Unregister a device. A device owned by a different user is not
    /// visible to the caller and reports `NotFound`.
    pub fn remove_device(&self, user_id: i64, device_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM devices WHERE id = ?1 AND user_id = ?2",
            params![device_id, user_id],
        )?;
        if deleted == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn device_last_sync(&self, user_id: i64, device_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let t = conn
            .query_row(
                "SELECT last_sync_time FROM devices WHERE id = ?1 AND user_id = ?2",
                params![device_id, user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(t)
    }

    // ── Per-user counters ───────────────────────────────────────────

    pub fn sync_version(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let v = conn
            .query_row(
                "SELECT sync_version FROM sync_state WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(v)
    }

    fn bump_sync_version(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_state (user_id, sync_version) VALUES (?1, 1)
             ON CONFLICT(user_id) DO UPDATE SET sync_version = sync_version + 1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Fold one sync interaction into the per-user stats.
    pub fn note_sync(
        &self,
        user_id: i64,
        uploads: i64,
        downloads: i64,
        conflicts: i64,
        duration_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_stats
             (user_id, syncs, uploads, downloads, conflicts, resolutions, total_duration_ms)
             VALUES (?1, 1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                syncs = syncs + 1,
                uploads = uploads + excluded.uploads,
                downloads = downloads + excluded.downloads,
                conflicts = conflicts + excluded.conflicts,
                total_duration_ms = total_duration_ms + excluded.total_duration_ms",
            params![user_id, uploads, downloads, conflicts, duration_ms],
        )?;
        Ok(())
    }

    /// Count records served through the change feed.
    pub fn note_downloads(&self, user_id: i64, downloads: i64) -> Result<()> {
        if downloads == 0 {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_stats (user_id, syncs, downloads) VALUES (?1, 0, ?2)
             ON CONFLICT(user_id) DO UPDATE SET downloads = downloads + excluded.downloads",
            params![user_id, downloads],
        )?;
        Ok(())
    }

    fn note_resolution(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_stats (user_id, syncs, resolutions) VALUES (?1, 0, 1)
             ON CONFLICT(user_id) DO UPDATE SET resolutions = resolutions + 1",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn sync_stats(&self, user_id: i64) -> Result<SyncStatsSummary> {
        let conn = self.conn.lock();
        let row: Option<(i64, i64, i64, i64, i64, i64)> = conn
            .query_row(
                "SELECT syncs, uploads, downloads, conflicts, resolutions, total_duration_ms
                 FROM sync_stats WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let (syncs, uploads, downloads, conflicts, resolutions, total_ms) =
            row.unwrap_or((0, 0, 0, 0, 0, 0));
        Ok(SyncStatsSummary {
            syncs,
            uploads,
            downloads,
            conflicts,
            resolutions,
            avg_duration_ms: if syncs > 0 { total_ms / syncs } else { 0 },
        })
    }
}

// ── Schema & helpers ────────────────────────────────────────────────

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            login TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            ciphertext BLOB NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            last_modified INTEGER NOT NULL,
            deleted_at INTEGER,
            checksum TEXT NOT NULL,
            device_id TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_user ON records(user_id);
        CREATE INDEX IF NOT EXISTS idx_records_user_modified
            ON records(user_id, last_modified);

        CREATE TABLE IF NOT EXISTS record_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            ciphertext BLOB NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            device_id TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_versions_record ON record_versions(record_id);

        CREATE TABLE IF NOT EXISTS conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            record_id INTEGER NOT NULL,
            device_id TEXT NOT NULL DEFAULT '',
            local_data TEXT NOT NULL,
            server_data TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution TEXT,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_user_open
            ON conflicts(user_id, resolved);

        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL DEFAULT '',
            last_sync_time INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

        CREATE TABLE IF NOT EXISTS sync_state (
            user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            sync_version INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_stats (
            user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            syncs INTEGER NOT NULL DEFAULT 0,
            uploads INTEGER NOT NULL DEFAULT 0,
            downloads INTEGER NOT NULL DEFAULT 0,
            conflicts INTEGER NOT NULL DEFAULT 0,
            resolutions INTEGER NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0
        );",
    )
}

const REC_COLUMNS: &str = "id, user_id, kind, ciphertext, meta, version, \
                           last_modified, deleted_at, checksum, device_id";

fn row_to_server_record(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let kind_str: String = row.get(2)?;
    let meta_json: String = row.get(4)?;
    Ok(ServerRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: RecordKind::parse(&kind_str).unwrap_or(RecordKind::Text),
        ciphertext: row.get(3)?,
        meta: serde_json::from_str(&meta_json).unwrap_or_default(),
        version: row.get(5)?,
        last_modified: row.get(6)?,
        deleted_at: row.get(7)?,
        checksum: row.get(8)?,
        device_id: row.get(9)?,
    })
}

const CONFLICT_COLUMNS: &str = "id, user_id, record_id, device_id, local_data, server_data, \
                                conflict_type, resolved, resolution, created_at, resolved_at";

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRow> {
    let local_json: String = row.get(4)?;
    let server_json: String = row.get(5)?;
    let type_str: String = row.get(6)?;
    let resolution_str: Option<String> = row.get(8)?;
    Ok(ConflictRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        record_id: row.get(2)?,
        device_id: row.get(3)?,
        local_data: serde_json::from_str(&local_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        server_data: serde_json::from_str(&server_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        conflict_type: match type_str.as_str() {
            "delete_edit" => ConflictType::DeleteEdit,
            "edit_delete" => ConflictType::EditDelete,
            _ => ConflictType::VersionMismatch,
        },
        resolved: row.get::<_, i64>(7)? != 0,
        resolution: resolution_str.and_then(|s| match s.as_str() {
            "client" => Some(Resolution::Client),
            "server" => Some(Resolution::Server),
            "merged" => Some(Resolution::Merged),
            _ => None,
        }),
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

fn insert_history(
    tx: &rusqlite::Transaction<'_>,
    record_id: i64,
    version: i64,
    ciphertext: &[u8],
    meta: &Meta,
    device_id: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO record_versions (record_id, version, ciphertext, meta, device_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record_id,
            version,
            ciphertext,
            encode_meta(meta)?,
            device_id,
            epoch_secs(),
        ],
    )?;
    Ok(())
}

fn encode_meta(meta: &Meta) -> Result<String> {
    serde_json::to_string(meta).map_err(|e| Error::Storage(format!("meta encode: {e}")))
}

fn encode_wire(wire: &WireRecord) -> Result<String> {
    serde_json::to_string(wire).map_err(|e| Error::Storage(format!("wire encode: {e}")))
}

fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// PBKDF2-HMAC-SHA256 over salt-prefixed password, hex-encoded.
fn hash_password(password: &str, salt: &str) -> String {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PASSWORD_ITERATIONS,
        &mut out,
    );
    hex::encode(out)
}

/// Single SHA-256 pass; tokens are already high-entropy.
fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const BIG_QUOTA: u64 = 10 * 1024 * 1024;

    fn store() -> ServerStore {
        ServerStore::open_in_memory(BIG_QUOTA).unwrap()
    }

    fn user(store: &ServerStore) -> i64 {
        store.register("alice", "pw123456").unwrap()
    }

    fn meta_titled(title: &str) -> Meta {
        let mut m = Meta::new();
        m.insert("title".into(), title.into());
        m
    }

    fn wire_new(temp_id: i64, version: i64, lm: i64, payload: &[u8]) -> WireRecord {
        WireRecord {
            server_id: 0,
            temp_id,
            kind: RecordKind::Login,
            ciphertext: base64::engine::general_purpose::STANDARD.encode(payload),
            meta: meta_titled("uploaded"),
            version,
            last_modified: lm,
            deleted_at: None,
            checksum: String::new(),
            device_id: "dev-c".into(),
        }
    }

    // ── Users & sessions ────────────────────────────────────────

    #[test]
    fn register_and_authenticate() {
        let s = store();
        let id = user(&s);
        assert!(id > 0);

        let u = s.authenticate("alice", "pw123456").unwrap();
        assert_eq!(u.id, id);
        assert!(matches!(
            s.authenticate("alice", "wrong-password"),
            Err(Error::BadCredentials)
        ));
        assert!(matches!(
            s.authenticate("nobody", "pw123456"),
            Err(Error::BadCredentials)
        ));
    }

    #[test]
    fn register_validates_input() {
        let s = store();
        assert!(matches!(s.register("", "pw123456"), Err(Error::Unprocessable(_))));
        assert!(matches!(s.register("bob", "short"), Err(Error::Unprocessable(_))));
        s.register("bob", "pw123456").unwrap();
        assert!(matches!(
            s.register("BOB", "pw123456"),
            Err(Error::Unprocessable(_))
        ));
    }

    #[test]
    fn session_lifecycle() {
        let s = store();
        let uid = user(&s);

        let (token, expires_at) = s.create_session(uid).unwrap();
        assert!(expires_at > epoch_secs());
        assert_eq!(s.validate_token(&token).unwrap(), uid);

        assert!(s.revoke_session(&token).unwrap());
        assert!(matches!(
            s.validate_token(&token),
            Err(Error::Unauthenticated)
        ));
        assert!(matches!(
            s.validate_token("bogus"),
            Err(Error::Unauthenticated)
        ));
    }

    #[test]
    fn expired_sessions_are_swept() {
        let mut s = store();
        s.session_ttl_secs = 0;
        let uid = user(&s);
        let (token, _) = s.create_session(uid).unwrap();

        assert!(matches!(
            s.validate_token(&token),
            Err(Error::Unauthenticated)
        ));
        assert_eq!(s.cleanup_expired_sessions().unwrap(), 1);
    }

    #[test]
    fn change_password_requires_old() {
        let s = store();
        let uid = user(&s);

        assert!(matches!(
            s.change_password(uid, "bad-guess", "newpassword1"),
            Err(Error::BadCredentials)
        ));
        s.change_password(uid, "pw123456", "newpassword1").unwrap();
        s.authenticate("alice", "newpassword1").unwrap();
        assert!(s.authenticate("alice", "pw123456").is_err());
    }

    // ── Record service ──────────────────────────────────────────

    #[test]
    fn create_starts_history() {
        let s = store();
        let uid = user(&s);

        let r = s
            .create_record(uid, RecordKind::Login, vec![1, 2], meta_titled("gmail"), "dev-a")
            .unwrap();
        assert_eq!(r.version, 1);
        assert!(r.id > 0);
        assert_eq!(s.history_count(r.id).unwrap(), 1);
    }

    #[test]
    fn conditional_update_bumps_and_records_history() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Login, vec![1], meta_titled("t"), "dev-a")
            .unwrap();

        let (v2, lm2) = s
            .update_record(uid, r.id, RecordKind::Login, vec![2], meta_titled("t2"), 1, "dev-b")
            .unwrap();
        assert_eq!(v2, 2);
        assert!(lm2 > r.last_modified);
        assert_eq!(s.history_count(r.id).unwrap(), 2);

        let got = s.find_record(uid, r.id).unwrap();
        assert_eq!(got.ciphertext, vec![2]);
        assert_eq!(got.device_id, "dev-b");
    }

    #[test]
    fn stale_update_fails_and_leaves_no_history() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Login, vec![1], meta_titled("t"), "dev-a")
            .unwrap();
        s.update_record(uid, r.id, RecordKind::Login, vec![2], meta_titled("t"), 1, "dev-a")
            .unwrap();

        // Two writers raced with the same expectation; the loser gets
        // VersionMismatch and no new history row appears.
        let err = s
            .update_record(uid, r.id, RecordKind::Login, vec![3], meta_titled("t"), 1, "dev-b")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionMismatch { expected: 1, stored: 2 }
        ));
        assert_eq!(s.history_count(r.id).unwrap(), 2);
        assert_eq!(s.find_record(uid, r.id).unwrap().ciphertext, vec![2]);
    }

    #[test]
    fn update_missing_or_foreign_is_not_found() {
        let s = store();
        let uid = user(&s);
        let other = s.register("mallory", "pw123456").unwrap();
        let r = s
            .create_record(uid, RecordKind::Text, vec![1], Meta::new(), "dev-a")
            .unwrap();

        assert!(matches!(
            s.update_record(uid, 999, RecordKind::Text, vec![2], Meta::new(), 1, "d"),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            s.update_record(other, r.id, RecordKind::Text, vec![2], Meta::new(), 1, "d"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn soft_delete_is_idempotent_and_blocks_update() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Text, vec![1], Meta::new(), "dev-a")
            .unwrap();

        let v2 = s.soft_delete_record(uid, r.id, "dev-a").unwrap();
        assert_eq!(v2, 2);
        // Re-delete: success, no new version
        let again = s.soft_delete_record(uid, r.id, "dev-a").unwrap();
        assert_eq!(again, 2);

        assert!(matches!(s.find_record(uid, r.id), Err(Error::Deleted)));
        assert!(matches!(
            s.update_record(uid, r.id, RecordKind::Text, vec![2], Meta::new(), 2, "d"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn list_excludes_deleted_and_orders_by_recency() {
        let s = store();
        let uid = user(&s);
        let a = s
            .create_record(uid, RecordKind::Text, vec![1], meta_titled("a"), "d")
            .unwrap();
        let _b = s
            .create_record(uid, RecordKind::Text, vec![2], meta_titled("b"), "d")
            .unwrap();
        s.soft_delete_record(uid, a.id, "d").unwrap();

        let listed = s.list_records(uid).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].meta.get("title").unwrap(), "b");
        assert_eq!(s.count_records(uid).unwrap(), 1);
    }

    #[test]
    fn search_matches_title_substring() {
        let s = store();
        let uid = user(&s);
        s.create_record(uid, RecordKind::Login, vec![1], meta_titled("Gmail work"), "d")
            .unwrap();
        s.create_record(uid, RecordKind::Card, vec![2], meta_titled("visa"), "d")
            .unwrap();

        let hits = s.search_records(uid, "gmail", None).unwrap();
        assert_eq!(hits.len(), 1);
        let typed = s.search_records(uid, "a", Some(RecordKind::Card)).unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].kind, RecordKind::Card);
    }

    #[test]
    fn change_feed_includes_deleted_and_pages() {
        let s = store();
        let uid = user(&s);
        let a = s
            .create_record(uid, RecordKind::Text, vec![1], Meta::new(), "d")
            .unwrap();
        s.create_record(uid, RecordKind::Text, vec![2], Meta::new(), "d")
            .unwrap();
        s.soft_delete_record(uid, a.id, "d").unwrap();

        let (page, has_more) = s.modified_since(uid, 0, 1, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert!(has_more);

        let (rest, _) = s.modified_since(uid, 0, 10, 1).unwrap();
        assert_eq!(rest.len(), 1);

        let (all, _) = s.modified_since(uid, 0, 10, 0).unwrap();
        assert!(all.iter().any(|r| r.deleted_at.is_some()));
        // Ascending by last_modified
        assert!(all.windows(2).all(|w| w[0].last_modified <= w[1].last_modified));
    }

    // ── Batch sync ──────────────────────────────────────────────

    #[test]
    fn batch_inserts_new_records_and_bumps_sync_version() {
        let s = store();
        let uid = user(&s);

        let outcomes = s
            .apply_batch(uid, vec![wire_new(11, 1, 1000, b"one")], "dev-c")
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let (temp_id, outcome) = &outcomes[0];
        assert_eq!(*temp_id, 11);
        match outcome {
            BatchItemOutcome::Applied { server_id, version } => {
                assert!(*server_id > 0);
                assert_eq!(*version, 1);
                let stored = s.find_record(uid, *server_id).unwrap();
                assert_eq!(stored.ciphertext, b"one");
                // Checksum recomputed server-side over the raw bytes
                assert_eq!(
                    stored.checksum,
                    checksum_of(b"one", RecordKind::Login, &meta_titled("uploaded"))
                );
            }
            other => panic!("expected applied, got {other:?}"),
        }
        assert_eq!(s.sync_version(uid).unwrap(), 1);
    }

    #[test]
    fn batch_replaces_when_newer_and_conflicts_when_stale() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Login, vec![1], meta_titled("t"), "dev-a")
            .unwrap();

        // Newer incoming replaces
        let mut newer = wire_new(5, 3, r.last_modified + 10, b"newer");
        newer.server_id = r.id;
        let outcomes = s.apply_batch(uid, vec![newer], "dev-b").unwrap();
        assert!(matches!(
            outcomes[0].1,
            BatchItemOutcome::Applied { version: 3, .. }
        ));
        assert_eq!(s.find_record(uid, r.id).unwrap().ciphertext, b"newer");

        // Stale incoming opens a conflict, server copy untouched
        let mut stale = wire_new(6, 2, r.last_modified + 20, b"stale");
        stale.server_id = r.id;
        let outcomes = s.apply_batch(uid, vec![stale], "dev-b").unwrap();
        match &outcomes[0].1 {
            BatchItemOutcome::Conflict { server_id, stored_version } => {
                assert_eq!(*server_id, r.id);
                assert_eq!(*stored_version, 3);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(s.find_record(uid, r.id).unwrap().ciphertext, b"newer");

        let open = s.open_conflicts(uid).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].record_id, r.id);
        assert_eq!(open[0].conflict_type, ConflictType::VersionMismatch);
        assert_eq!(open[0].local_data.ciphertext_bytes().unwrap(), b"stale");
        assert_eq!(open[0].server_data.ciphertext_bytes().unwrap(), b"newer");
    }

    #[test]
    fn batch_applies_in_version_order() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Login, vec![1], meta_titled("t"), "dev-a")
            .unwrap();

        // Submitted out of order: v3 before v2. Sorted application applies
        // v2 then v3, so no spurious conflict.
        let mut v3 = wire_new(1, 3, 3000, b"v3");
        v3.server_id = r.id;
        let mut v2 = wire_new(2, 2, 2000, b"v2");
        v2.server_id = r.id;

        let outcomes = s.apply_batch(uid, vec![v3, v2], "dev-b").unwrap();
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, BatchItemOutcome::Applied { .. })));
        assert_eq!(s.find_record(uid, r.id).unwrap().version, 3);
        assert_eq!(s.open_conflict_count(uid).unwrap(), 0);
    }

    #[test]
    fn quota_excess_fails_whole_batch_without_writes() {
        let s = ServerStore::open_in_memory(1024).unwrap();
        let uid = s.register("alice", "pw123456").unwrap();

        let batch = vec![
            wire_new(1, 1, 1000, &[0u8; 800]),
            wire_new(2, 1, 1001, &[0u8; 800]),
        ];
        assert!(matches!(
            s.apply_batch(uid, batch, "dev-c"),
            Err(Error::QuotaExceeded)
        ));
        // Nothing landed, not even the first record that alone would fit
        assert_eq!(s.count_records(uid).unwrap(), 0);
        assert_eq!(s.sync_version(uid).unwrap(), 0);
    }

    #[test]
    fn batch_isolates_per_record_failures() {
        let s = store();
        let uid = user(&s);

        let mut bad = wire_new(1, 1, 1000, b"ignored");
        bad.ciphertext = "***not-base64***".into();
        let good = wire_new(2, 1, 2000, b"good");

        let outcomes = s.apply_batch(uid, vec![bad, good], "dev-c").unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .any(|(t, o)| *t == 1 && matches!(o, BatchItemOutcome::Failed { .. })));
        assert!(outcomes
            .iter()
            .any(|(t, o)| *t == 2 && matches!(o, BatchItemOutcome::Applied { .. })));
        assert_eq!(s.count_records(uid).unwrap(), 1);
    }

    #[test]
    fn batch_preserves_delete_monotonicity() {
        let s = store();
        let uid = user(&s);
        let r = s
            .create_record(uid, RecordKind::Text, vec![1], Meta::new(), "dev-a")
            .unwrap();
        s.soft_delete_record(uid, r.id, "dev-a").unwrap();

        // A newer incoming version without the deletion marker cannot
        // resurrect the record.
        let mut undelete = wire_new(1, 9, 9000, b"zombie");
        undelete.server_id = r.id;
        s.apply_batch(uid, vec![undelete], "dev-b").unwrap();

        assert!(matches!(s.find_record(uid, r.id), Err(Error::Deleted)));
    }

    // ── Conflict resolution ─────────────────────────────────────

    fn open_one_conflict(s: &ServerStore, uid: i64) -> (i64, i64) {
        let r = s
            .create_record(uid, RecordKind::Login, b"server-copy".to_vec(), meta_titled("t"), "dev-a")
            .unwrap();
        let mut stale = wire_new(1, 1, r.last_modified + 5, b"client-copy");
        stale.server_id = r.id;
        s.apply_batch(uid, vec![stale], "dev-b").unwrap();
        let conflicts = s.open_conflicts(uid).unwrap();
        (conflicts[0].id, r.id)
    }

    #[test]
    fn resolve_client_takes_client_data() {
        let s = store();
        let uid = user(&s);
        let (conflict_id, record_id) = open_one_conflict(&s, uid);

        let (rid, version) = s
            .resolve_conflict(uid, conflict_id, Resolution::Client, None, None)
            .unwrap();
        assert_eq!(rid, record_id);
        assert_eq!(version, 2); // exactly one bump

        let record = s.find_record(uid, record_id).unwrap();
        assert_eq!(record.ciphertext, b"client-copy");
        assert_eq!(s.open_conflict_count(uid).unwrap(), 0);
        assert_eq!(s.sync_stats(uid).unwrap().resolutions, 1);
    }

    #[test]
    fn resolve_server_keeps_server_data_but_bumps_once() {
        let s = store();
        let uid = user(&s);
        let (conflict_id, record_id) = open_one_conflict(&s, uid);

        let (_, version) = s
            .resolve_conflict(uid, conflict_id, Resolution::Server, None, None)
            .unwrap();
        assert_eq!(version, 2);
        let record = s.find_record(uid, record_id).unwrap();
        assert_eq!(record.ciphertext, b"server-copy");
    }

    #[test]
    fn resolve_merged_requires_and_uses_payload() {
        let s = store();
        let uid = user(&s);
        let (conflict_id, record_id) = open_one_conflict(&s, uid);

        assert!(matches!(
            s.resolve_conflict(uid, conflict_id, Resolution::Merged, None, None),
            Err(Error::Unprocessable(_))
        ));

        let (_, version) = s
            .resolve_conflict(
                uid,
                conflict_id,
                Resolution::Merged,
                Some(b"merged-copy".to_vec()),
                Some(meta_titled("merged")),
            )
            .unwrap();
        assert_eq!(version, 2);
        let record = s.find_record(uid, record_id).unwrap();
        assert_eq!(record.ciphertext, b"merged-copy");
    }

    #[test]
    fn resolve_twice_is_refused() {
        let s = store();
        let uid = user(&s);
        let (conflict_id, _) = open_one_conflict(&s, uid);

        s.resolve_conflict(uid, conflict_id, Resolution::Server, None, None)
            .unwrap();
        assert!(matches!(
            s.resolve_conflict(uid, conflict_id, Resolution::Server, None, None),
            Err(Error::Unprocessable(_))
        ));
    }

    #[test]
    fn resolve_foreign_conflict_is_not_found() {
        let s = store();
        let uid = user(&s);
        let other = s.register("mallory", "pw123456").unwrap();
        let (conflict_id, _) = open_one_conflict(&s, uid);

        assert!(matches!(
            s.resolve_conflict(other, conflict_id, Resolution::Server, None, None),
            Err(Error::NotFound)
        ));
    }

    // ── Devices & counters ──────────────────────────────────────

    #[test]
    fn devices_upsert_list_remove() {
        let s = store();
        let uid = user(&s);
        let other = s.register("mallory", "pw123456").unwrap();

        s.upsert_device(uid, "dev-1", "Laptop", "cli").unwrap();
        s.upsert_device(uid, "dev-1", "Laptop Renamed", "cli").unwrap();
        s.upsert_device(uid, "dev-2", "Phone", "cli").unwrap();

        let devices = s.list_devices(uid).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.name == "Laptop Renamed"));

        // Foreign removal refused
        assert!(matches!(
            s.remove_device(other, "dev-1"),
            Err(Error::NotFound)
        ));
        s.remove_device(uid, "dev-1").unwrap();
        assert_eq!(s.list_devices(uid).unwrap().len(), 1);
    }

    #[test]
    fn kind_counts_group_live_records() {
        let s = store();
        let uid = user(&s);
        s.create_record(uid, RecordKind::Login, vec![1], Meta::new(), "d")
            .unwrap();
        s.create_record(uid, RecordKind::Login, vec![2], Meta::new(), "d")
            .unwrap();
        let t = s
            .create_record(uid, RecordKind::Text, vec![3], Meta::new(), "d")
            .unwrap();
        s.soft_delete_record(uid, t.id, "d").unwrap();

        let counts = s.record_kind_counts(uid).unwrap();
        assert_eq!(counts, vec![("login".to_string(), 2)]);
    }

    #[test]
    fn sync_stats_accumulate() {
        let s = store();
        let uid = user(&s);

        s.note_sync(uid, 2, 3, 1, 100).unwrap();
        s.note_sync(uid, 1, 0, 0, 300).unwrap();

        let stats = s.sync_stats(uid).unwrap();
        assert_eq!(stats.syncs, 2);
        assert_eq!(stats.uploads, 3);
        assert_eq!(stats.downloads, 3);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.avg_duration_ms, 200);
    }
}
