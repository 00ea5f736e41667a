//! Conflict detection and resolution for the replication engine.
//!
//! A conflict is a disagreement between the local and the server view of
//! one record at the same logical identity. Detection only ever fires for
//! records the local side has not finished syncing; resolution picks a
//! winner per the configured strategy and rewrites it as a fresh local
//! mutation, to be uploaded on the next run.

use crate::error::Result;
use crate::protocol::WireRecord;
use crate::store::record::Record;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Configured resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Keep the local record.
    Client,
    /// Take the server record.
    Server,
    /// Pick the side with the greater `last_modified`; ties break to the
    /// higher `version`, then to the client.
    Newer,
    /// Leave the record in the conflict set for the user.
    Manual,
}

/// How the two sides disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    EditEdit,
    DeleteEdit,
    EditDelete,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EditEdit => "edit-edit",
            Self::DeleteEdit => "delete-edit",
            Self::EditDelete => "edit-delete",
        }
    }
}

/// A detected conflict, carried through a sync run.
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub local: Record,
    pub server: WireRecord,
    pub kind: ConflictKind,
}

/// One side's view, reduced to the fields detection compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideView {
    pub version: i64,
    pub last_modified: i64,
    pub deleted: bool,
}

impl SideView {
    pub fn of_record(record: &Record) -> Self {
        Self {
            version: record.version,
            last_modified: record.last_modified,
            deleted: record.is_deleted(),
        }
    }

    pub fn of_wire(record: &WireRecord) -> Self {
        Self {
            version: record.version,
            last_modified: record.last_modified,
            deleted: record.is_deleted(),
        }
    }
}

/// Compare two views of one record. Symmetric: swapping the arguments
/// yields the mirrored kind or `None` in both directions.
pub fn classify(a: &SideView, b: &SideView) -> Option<ConflictKind> {
    match (a.deleted, b.deleted) {
        (true, true) => None,
        (true, false) => Some(ConflictKind::DeleteEdit),
        (false, true) => Some(ConflictKind::EditDelete),
        (false, false) => {
            if a.version != b.version || a.last_modified != b.last_modified {
                Some(ConflictKind::EditEdit)
            } else {
                None
            }
        }
    }
}

/// Detect a conflict between an unsynced local record and the server's
/// view. A local record that is fully synced cannot conflict.
pub fn detect(local: &Record, server: &WireRecord) -> Option<ConflictKind> {
    if local.synced {
        return None;
    }
    classify(&SideView::of_record(local), &SideView::of_wire(server))
}

/// Outcome of applying a strategy.
#[derive(Debug)]
pub enum Applied {
    /// The resolved record, ready to be written back locally (unsynced)
    /// and uploaded on the next run.
    Local(Record),
    /// Strategy `manual`: counted, not applied.
    Manual,
}

/// Apply the configured strategy to a detected conflict.
///
/// The resolved version is always strictly above BOTH sides, so the write
/// passes the local store's monotonic check and the next upload supersedes
/// the server copy. For the client winner that is exactly
/// `local.version + 1`.
pub fn resolve(strategy: Strategy, local: &Record, server: &WireRecord) -> Result<Applied> {
    match strategy {
        Strategy::Manual => Ok(Applied::Manual),
        Strategy::Client => Ok(Applied::Local(keep_local(local, server))),
        Strategy::Server => Ok(Applied::Local(take_server(local, server)?)),
        Strategy::Newer => {
            let local_wins = match local.last_modified.cmp(&server.last_modified) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => match local.version.cmp(&server.version) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => true, // final tie-break: client
                },
            };
            if local_wins {
                Ok(Applied::Local(keep_local(local, server)))
            } else {
                Ok(Applied::Local(take_server(local, server)?))
            }
        }
    }
}

fn resolved_version(local: &Record, server: &WireRecord) -> i64 {
    local.version.max(server.version) + 1
}

fn keep_local(local: &Record, server: &WireRecord) -> Record {
    let mut resolved = local.clone();
    resolved.version = resolved_version(local, server);
    resolved.synced = false;
    resolved
}

fn take_server(local: &Record, server: &WireRecord) -> Result<Record> {
    let mut resolved = server.to_record()?;
    resolved.local_id = local.local_id;
    // server_id is frozen; the wire copy carries the same one
    resolved.server_id = if local.server_id != 0 {
        local.server_id
    } else {
        server.server_id
    };
    resolved.version = resolved_version(local, server);
    resolved.synced = false;
    resolved.sync_version = local.sync_version;
    Ok(resolved)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::{Meta, RecordKind};
    use base64::Engine;

    fn local(version: i64, last_modified: i64, deleted: bool, synced: bool) -> Record {
        let mut r = Record::new(RecordKind::Login, vec![1], Meta::new(), "dev-local");
        r.local_id = 1;
        r.server_id = 10;
        r.version = version;
        r.last_modified = last_modified;
        r.deleted_at = deleted.then_some(last_modified);
        r.synced = synced;
        r
    }

    fn server(version: i64, last_modified: i64, deleted: bool) -> WireRecord {
        WireRecord {
            server_id: 10,
            temp_id: 0,
            kind: RecordKind::Login,
            ciphertext: base64::engine::general_purpose::STANDARD.encode([9u8]),
            meta: Meta::new(),
            version,
            last_modified,
            deleted_at: deleted.then_some(last_modified),
            checksum: "server-checksum".into(),
            device_id: "dev-remote".into(),
        }
    }

    // ── Detection ───────────────────────────────────────────────

    #[test]
    fn synced_local_never_conflicts() {
        assert!(detect(&local(1, 100, false, true), &server(2, 200, false)).is_none());
    }

    #[test]
    fn identical_views_do_not_conflict() {
        assert!(detect(&local(2, 500, false, false), &server(2, 500, false)).is_none());
    }

    #[test]
    fn both_deleted_do_not_conflict() {
        assert!(detect(&local(2, 500, true, false), &server(3, 700, true)).is_none());
    }

    #[test]
    fn version_or_timestamp_divergence_is_edit_edit() {
        assert_eq!(
            detect(&local(2, 500, false, false), &server(3, 500, false)),
            Some(ConflictKind::EditEdit)
        );
        assert_eq!(
            detect(&local(2, 500, false, false), &server(2, 700, false)),
            Some(ConflictKind::EditEdit)
        );
    }

    #[test]
    fn deletion_disagreements_classify_by_side() {
        assert_eq!(
            detect(&local(2, 500, true, false), &server(2, 500, false)),
            Some(ConflictKind::DeleteEdit)
        );
        assert_eq!(
            detect(&local(2, 500, false, false), &server(2, 500, true)),
            Some(ConflictKind::EditDelete)
        );
    }

    #[test]
    fn classification_is_symmetric() {
        let cases = [
            (SideView { version: 1, last_modified: 10, deleted: false },
             SideView { version: 2, last_modified: 20, deleted: false }),
            (SideView { version: 1, last_modified: 10, deleted: true },
             SideView { version: 1, last_modified: 10, deleted: false }),
            (SideView { version: 3, last_modified: 30, deleted: false },
             SideView { version: 3, last_modified: 30, deleted: true }),
            (SideView { version: 3, last_modified: 30, deleted: true },
             SideView { version: 9, last_modified: 90, deleted: true }),
            (SideView { version: 3, last_modified: 30, deleted: false },
             SideView { version: 3, last_modified: 30, deleted: false }),
        ];
        // Swapping sides flips the delete direction and nothing else.
        let mirrored = |kind: ConflictKind| match kind {
            ConflictKind::EditEdit => ConflictKind::EditEdit,
            ConflictKind::DeleteEdit => ConflictKind::EditDelete,
            ConflictKind::EditDelete => ConflictKind::DeleteEdit,
        };
        for (a, b) in cases {
            let forward = classify(&a, &b);
            let backward = classify(&b, &a);
            assert_eq!(forward.map(mirrored), backward, "{a:?} vs {b:?}");
        }
    }

    // ── Resolution ──────────────────────────────────────────────

    #[test]
    fn client_strategy_keeps_local_content_and_bumps() {
        let l = local(2, 500, false, false);
        let s = server(2, 700, false);
        match resolve(Strategy::Client, &l, &s).unwrap() {
            Applied::Local(r) => {
                assert_eq!(r.ciphertext, l.ciphertext);
                assert_eq!(r.version, 3);
                assert!(!r.synced);
                assert_eq!(r.local_id, l.local_id);
            }
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn server_strategy_takes_server_content() {
        let l = local(2, 500, false, false);
        let s = server(2, 700, false);
        match resolve(Strategy::Server, &l, &s).unwrap() {
            Applied::Local(r) => {
                assert_eq!(r.ciphertext, vec![9u8]);
                assert_eq!(r.version, 3);
                assert_eq!(r.local_id, l.local_id);
                assert_eq!(r.server_id, l.server_id);
                assert!(!r.synced);
            }
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn resolved_version_clears_both_sides() {
        // Local edited three times offline; server only at v2. Either
        // winner must exceed both, or the local write / next upload stalls.
        let l = local(5, 500, false, false);
        let s = server(2, 900, false);
        for strategy in [Strategy::Client, Strategy::Server] {
            match resolve(strategy, &l, &s).unwrap() {
                Applied::Local(r) => assert_eq!(r.version, 6),
                Applied::Manual => panic!("expected a resolved record"),
            }
        }
    }

    #[test]
    fn newer_picks_greater_last_modified() {
        let l = local(2, 900, false, false);
        let s = server(2, 700, false);
        match resolve(Strategy::Newer, &l, &s).unwrap() {
            Applied::Local(r) => assert_eq!(r.ciphertext, l.ciphertext),
            Applied::Manual => panic!("expected a resolved record"),
        }

        let l = local(2, 600, false, false);
        let s = server(2, 700, false);
        match resolve(Strategy::Newer, &l, &s).unwrap() {
            Applied::Local(r) => assert_eq!(r.ciphertext, vec![9u8]),
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn newer_breaks_timestamp_ties_by_version_then_client() {
        // Equal timestamps: higher version wins
        let l = local(3, 700, false, false);
        let s = server(2, 700, false);
        match resolve(Strategy::Newer, &l, &s).unwrap() {
            Applied::Local(r) => assert_eq!(r.ciphertext, l.ciphertext),
            Applied::Manual => panic!("expected a resolved record"),
        }

        let l = local(2, 700, false, false);
        let s = server(3, 700, false);
        match resolve(Strategy::Newer, &l, &s).unwrap() {
            Applied::Local(r) => assert_eq!(r.ciphertext, vec![9u8]),
            Applied::Manual => panic!("expected a resolved record"),
        }

        // Full tie (differs only in deletion flags elsewhere): client wins
        let l = local(2, 700, false, false);
        let s = server(2, 700, true);
        match resolve(Strategy::Newer, &l, &s).unwrap() {
            Applied::Local(r) => assert_eq!(r.ciphertext, l.ciphertext),
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn newer_is_monotone_in_last_modified() {
        // Whatever else differs, a strictly larger last_modified wins.
        for (lv, sv) in [(1, 9), (9, 1), (4, 4)] {
            let l = local(lv, 1_000, false, false);
            let s = server(sv, 999, false);
            match resolve(Strategy::Newer, &l, &s).unwrap() {
                Applied::Local(r) => assert_eq!(r.ciphertext, l.ciphertext),
                Applied::Manual => panic!("expected a resolved record"),
            }
        }
    }

    #[test]
    fn manual_strategy_applies_nothing() {
        let l = local(2, 500, false, false);
        let s = server(3, 700, false);
        assert!(matches!(
            resolve(Strategy::Manual, &l, &s).unwrap(),
            Applied::Manual
        ));
    }

    #[test]
    fn edit_delete_server_strategy_deletes_locally() {
        // Offline edit against a record the server has since deleted:
        // siding with the server makes the local copy deleted too.
        let l = local(2, 900, false, false);
        let s = server(3, 700, true);
        match resolve(Strategy::Server, &l, &s).unwrap() {
            Applied::Local(r) => {
                assert!(r.is_deleted());
                assert_eq!(r.version, 4);
                assert!(!r.synced);
            }
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn edit_delete_client_strategy_restores_the_record() {
        // Siding with the client keeps the edit alive; the bumped version
        // re-uploads and the record reappears everywhere.
        let l = local(2, 900, false, false);
        let s = server(3, 700, true);
        match resolve(Strategy::Client, &l, &s).unwrap() {
            Applied::Local(r) => {
                assert!(!r.is_deleted());
                assert_eq!(r.ciphertext, l.ciphertext);
                assert_eq!(r.version, 4); // above both sides
            }
            Applied::Manual => panic!("expected a resolved record"),
        }
    }

    #[test]
    fn server_strategy_resurrects_on_delete_edit() {
        // Local deleted, server edited: taking the server restores the record.
        let l = local(2, 500, true, false);
        let s = server(3, 700, false);
        match resolve(Strategy::Server, &l, &s).unwrap() {
            Applied::Local(r) => {
                assert!(!r.is_deleted());
                assert_eq!(r.version, 4);
            }
            Applied::Manual => panic!("expected a resolved record"),
        }
    }
}
