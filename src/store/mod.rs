//! Local embedded record store (`records.db`).
//!
//! Durable, indexed storage of records plus the sync metadata the engine
//! needs (`server_id`, `synced`, `sync_version`, `deleted_at`). One writer
//! per process; the connection sits behind a mutex.

pub mod record;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use self::record::{Meta, Record, RecordKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Listing filter. Soft-deleted records are excluded unless asked for.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub kind: Option<RecordKind>,
    pub show_deleted: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            kind: None,
            show_deleted: false,
            limit: 100,
            offset: 0,
        }
    }
}

/// SQLite-backed local record store.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Save / fetch ────────────────────────────────────────────────

    /// Insert when `local_id == 0` (assigning it), otherwise persist the
    /// given state by `local_id`. Writes that do not strictly increase the
    /// stored `version` fail; an assigned `server_id` never changes.
    pub fn save(&self, record: &mut Record) -> Result<()> {
        if record.local_id == 0 {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO records
                 (server_id, kind, ciphertext, meta, version, last_modified,
                  deleted_at, checksum, device_id, synced, sync_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.server_id,
                    record.kind.as_str(),
                    record.ciphertext,
                    encode_meta(&record.meta)?,
                    record.version,
                    record.last_modified,
                    record.deleted_at,
                    record.checksum,
                    record.device_id,
                    record.synced as i64,
                    record.sync_version,
                ],
            )?;
            record.local_id = conn.last_insert_rowid();
            return Ok(());
        }

        let stored = self.get(record.local_id)?;
        if stored.server_id != 0 && record.server_id != stored.server_id {
            return Err(Error::Storage(format!(
                "server_id is frozen once assigned (record {})",
                record.local_id
            )));
        }
        if record.version <= stored.version {
            return Err(Error::VersionMismatch {
                expected: record.version,
                stored: stored.version,
            });
        }

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE records SET
                server_id = ?2, kind = ?3, ciphertext = ?4, meta = ?5,
                version = ?6, last_modified = ?7, deleted_at = ?8,
                checksum = ?9, device_id = ?10, synced = ?11, sync_version = ?12
             WHERE local_id = ?1",
            params![
                record.local_id,
                record.server_id,
                record.kind.as_str(),
                record.ciphertext,
                encode_meta(&record.meta)?,
                record.version,
                record.last_modified,
                record.deleted_at,
                record.checksum,
                record.device_id,
                record.synced as i64,
                record.sync_version,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, local_id: i64) -> Result<Record> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM records WHERE local_id = ?1"),
            params![local_id],
            row_to_record,
        )
        .optional()?
        .ok_or(Error::NotFound)
    }

    pub fn get_by_server_id(&self, server_id: i64) -> Result<Record> {
        if server_id == 0 {
            return Err(Error::NotFound);
        }
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM records WHERE server_id = ?1"),
            params![server_id],
            row_to_record,
        )
        .optional()?
        .ok_or(Error::NotFound)
    }

    /// Filtered listing, newest first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM records
             WHERE (?1 IS NULL OR kind = ?1)
               AND (?2 = 1 OR deleted_at IS NULL)
             ORDER BY last_modified DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let records = stmt
            .query_map(
                params![
                    filter.kind.map(|k| k.as_str()),
                    filter.show_deleted as i64,
                    filter.limit,
                    filter.offset,
                ],
                row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Persist a user mutation. The record must exist; `synced` is cleared.
    pub fn update(&self, record: &mut Record) -> Result<()> {
        record.synced = false;
        self.save(record)
    }

    /// Set `deleted_at`, advance `last_modified`, clear `synced`.
    pub fn soft_delete(&self, local_id: i64, device_id: &str) -> Result<Record> {
        let mut record = self.get(local_id)?;
        record.mark_deleted(device_id);
        self.save(&mut record)?;
        Ok(record)
    }

    /// Remove the row entirely.
    pub fn hard_delete(&self, local_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM records WHERE local_id = ?1", params![local_id])?;
        if deleted == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// The `limit` oldest records that are unsynced or newer than `t`,
    /// ascending by `last_modified`. This is the upload candidate set.
    pub fn modified_after(&self, t: i64, limit: u32) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM records
             WHERE synced = 0 OR last_modified > ?1
             ORDER BY last_modified ASC
             LIMIT ?2"
        ))?;
        let records = stmt
            .query_map(params![t, limit], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Acknowledge a server upload: set `synced`, store `sync_version`,
    /// assign `server_id` if still zero. The flag is only set while the
    /// local `version` still equals the acknowledged one, so an edit racing
    /// the upload keeps the record unsynced. Returns whether it applied.
    pub fn mark_synced(&self, local_id: i64, server_id: i64, sync_version: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE records SET
                synced = 1,
                sync_version = ?3,
                server_id = CASE WHEN server_id = 0 THEN ?2 ELSE server_id END
             WHERE local_id = ?1 AND version = ?3",
            params![local_id, server_id, sync_version],
        )?;
        if changed == 0 {
            // Distinguish a missing row from a raced edit.
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM records WHERE local_id = ?1",
                    params![local_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(Error::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Total record count (soft-deleted included).
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL,
            ciphertext BLOB NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            last_modified INTEGER NOT NULL,
            deleted_at INTEGER,
            checksum TEXT NOT NULL,
            device_id TEXT NOT NULL DEFAULT '',
            synced INTEGER NOT NULL DEFAULT 0,
            sync_version INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_records_server
            ON records(server_id) WHERE server_id != 0;
        CREATE INDEX IF NOT EXISTS idx_records_modified
            ON records(last_modified);
        CREATE INDEX IF NOT EXISTS idx_records_unsynced
            ON records(synced) WHERE synced = 0;",
    )
}

const COLUMNS: &str = "local_id, server_id, kind, ciphertext, meta, version, \
                       last_modified, deleted_at, checksum, device_id, synced, sync_version";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    let kind_str: String = row.get(2)?;
    let meta_json: String = row.get(4)?;
    Ok(Record {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        kind: RecordKind::parse(&kind_str).unwrap_or(RecordKind::Text),
        ciphertext: row.get(3)?,
        meta: serde_json::from_str(&meta_json).unwrap_or_default(),
        version: row.get(5)?,
        last_modified: row.get(6)?,
        deleted_at: row.get(7)?,
        checksum: row.get(8)?,
        device_id: row.get(9)?,
        synced: row.get::<_, i64>(10)? != 0,
        sync_version: row.get(11)?,
    })
}

fn encode_meta(meta: &Meta) -> Result<String> {
    serde_json::to_string(meta).map_err(|e| Error::Storage(format!("meta encode: {e}")))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::checksum_of;

    fn sample(kind: RecordKind, title: &str) -> Record {
        let mut meta = Meta::new();
        meta.insert("title".into(), title.into());
        Record::new(kind, vec![1, 2, 3], meta, "dev-test")
    }

    #[test]
    fn save_assigns_monotonic_local_ids() {
        let store = LocalStore::open_in_memory().unwrap();

        let mut a = sample(RecordKind::Login, "a");
        let mut b = sample(RecordKind::Login, "b");
        store.save(&mut a).unwrap();
        store.save(&mut b).unwrap();

        assert!(a.local_id > 0);
        assert_eq!(b.local_id, a.local_id + 1);
    }

    #[test]
    fn get_roundtrips_all_fields() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Card, "visa");
        r.server_id = 42;
        r.sync_version = 1;
        r.synced = true;
        store.save(&mut r).unwrap();

        let got = store.get(r.local_id).unwrap();
        assert_eq!(got, r);
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(matches!(store.get(999), Err(Error::NotFound)));
        assert!(matches!(store.get_by_server_id(999), Err(Error::NotFound)));
        assert!(matches!(store.get_by_server_id(0), Err(Error::NotFound)));
    }

    #[test]
    fn lookup_by_server_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Text, "note");
        r.server_id = 7;
        store.save(&mut r).unwrap();

        let got = store.get_by_server_id(7).unwrap();
        assert_eq!(got.local_id, r.local_id);
    }

    #[test]
    fn stale_version_write_fails() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Text, "note");
        store.save(&mut r).unwrap();

        // Same version again: rejected
        let mut stale = r.clone();
        assert!(matches!(
            store.save(&mut stale),
            Err(Error::VersionMismatch { .. })
        ));

        // Bumped version: accepted
        r.touch("dev-test");
        store.save(&mut r).unwrap();
        assert_eq!(store.get(r.local_id).unwrap().version, 2);
    }

    #[test]
    fn server_id_is_frozen_once_assigned() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Text, "note");
        r.server_id = 5;
        store.save(&mut r).unwrap();

        r.touch("dev-test");
        r.server_id = 6;
        assert!(store.save(&mut r).is_err());
    }

    #[test]
    fn update_clears_synced() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Login, "mail");
        r.synced = true;
        r.sync_version = 1;
        store.save(&mut r).unwrap();

        r.touch("dev-test");
        r.synced = true; // caller forgot; update() clears it anyway
        store.update(&mut r).unwrap();

        assert!(!store.get(r.local_id).unwrap().synced);
    }

    #[test]
    fn update_missing_record_fails() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut ghost = sample(RecordKind::Login, "ghost");
        ghost.local_id = 123;
        assert!(matches!(store.update(&mut ghost), Err(Error::NotFound)));
    }

    #[test]
    fn list_excludes_deleted_by_default() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut keep = sample(RecordKind::Login, "keep");
        let mut gone = sample(RecordKind::Login, "gone");
        store.save(&mut keep).unwrap();
        store.save(&mut gone).unwrap();
        store.soft_delete(gone.local_id, "dev-test").unwrap();

        let visible = store.list(&ListFilter::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title(), "keep");

        let all = store
            .list(&ListFilter {
                show_deleted: true,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn list_filters_by_kind_and_paginates() {
        let store = LocalStore::open_in_memory().unwrap();
        for i in 0..5 {
            let mut r = sample(RecordKind::Text, &format!("t{i}"));
            store.save(&mut r).unwrap();
        }
        let mut card = sample(RecordKind::Card, "card");
        store.save(&mut card).unwrap();

        let texts = store
            .list(&ListFilter {
                kind: Some(RecordKind::Text),
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(texts.len(), 5);

        let page = store
            .list(&ListFilter {
                kind: Some(RecordKind::Text),
                limit: 2,
                offset: 2,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn list_orders_newest_first() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut old = sample(RecordKind::Text, "old");
        old.last_modified = 1_000;
        let mut new = sample(RecordKind::Text, "new");
        new.last_modified = 2_000;
        store.save(&mut old).unwrap();
        store.save(&mut new).unwrap();

        let listed = store.list(&ListFilter::default()).unwrap();
        assert_eq!(listed[0].title(), "new");
        assert_eq!(listed[1].title(), "old");
    }

    #[test]
    fn soft_delete_marks_and_keeps_row() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Binary, "blob");
        r.synced = true;
        store.save(&mut r).unwrap();

        let deleted = store.soft_delete(r.local_id, "dev-2").unwrap();
        assert!(deleted.is_deleted());
        assert!(!deleted.synced);
        assert!(deleted.last_modified > r.last_modified);
        assert_eq!(deleted.version, r.version + 1);

        // Row still fetchable directly
        assert!(store.get(r.local_id).unwrap().is_deleted());
    }

    #[test]
    fn hard_delete_removes_row() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Text, "tmp");
        store.save(&mut r).unwrap();

        store.hard_delete(r.local_id).unwrap();
        assert!(matches!(store.get(r.local_id), Err(Error::NotFound)));
        assert!(matches!(store.hard_delete(r.local_id), Err(Error::NotFound)));
    }

    #[test]
    fn modified_after_selects_unsynced_and_newer() {
        let store = LocalStore::open_in_memory().unwrap();

        let mut synced_old = sample(RecordKind::Text, "synced-old");
        synced_old.synced = true;
        synced_old.last_modified = 100;
        store.save(&mut synced_old).unwrap();

        let mut synced_new = sample(RecordKind::Text, "synced-new");
        synced_new.synced = true;
        synced_new.last_modified = 900;
        store.save(&mut synced_new).unwrap();

        let mut unsynced = sample(RecordKind::Text, "unsynced");
        unsynced.last_modified = 50;
        store.save(&mut unsynced).unwrap();

        let picked = store.modified_after(500, 10).unwrap();
        let titles: Vec<_> = picked.iter().map(Record::title).collect();
        // Ascending by last_modified: unsynced (50) before synced-new (900)
        assert_eq!(titles, vec!["unsynced", "synced-new"]);

        let limited = store.modified_after(0, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].title(), "unsynced");
    }

    #[test]
    fn mark_synced_assigns_server_id_once() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Login, "mail");
        store.save(&mut r).unwrap();

        assert!(store.mark_synced(r.local_id, 33, r.version).unwrap());
        let got = store.get(r.local_id).unwrap();
        assert!(got.synced);
        assert_eq!(got.server_id, 33);
        assert_eq!(got.sync_version, got.version);

        // A later ack never rebinds the server id
        let mut edited = got.clone();
        edited.touch("dev-test");
        store.save(&mut edited).unwrap();
        assert!(store.mark_synced(edited.local_id, 44, edited.version).unwrap());
        assert_eq!(store.get(edited.local_id).unwrap().server_id, 33);
    }

    #[test]
    fn mark_synced_skips_raced_edits() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Login, "mail");
        store.save(&mut r).unwrap();
        let uploaded_version = r.version;

        // Edit lands between upload and ack
        r.touch("dev-test");
        store.save(&mut r).unwrap();

        assert!(!store.mark_synced(r.local_id, 33, uploaded_version).unwrap());
        let got = store.get(r.local_id).unwrap();
        assert!(!got.synced);
        // server_id not assigned either; the ack did not apply
        assert_eq!(got.server_id, 0);
    }

    #[test]
    fn mark_synced_missing_record() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(matches!(
            store.mark_synced(404, 1, 1),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn count_includes_deleted() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut a = sample(RecordKind::Text, "a");
        let mut b = sample(RecordKind::Text, "b");
        store.save(&mut a).unwrap();
        store.save(&mut b).unwrap();
        store.soft_delete(a.local_id, "dev-test").unwrap();

        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn checksum_survives_storage() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut r = sample(RecordKind::Login, "mail");
        let expected = checksum_of(&r.ciphertext, r.kind, &r.meta);
        store.save(&mut r).unwrap();
        assert_eq!(store.get(r.local_id).unwrap().checksum, expected);
    }
}
