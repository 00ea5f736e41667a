//! Wire protocol types: the JSON bodies both sides of the REST API speak.
//!
//! Every response rides in the envelope `{status: "Ok"|"Error", error?,
//! …payload}`. Record ciphertext travels base64-encoded and is stored as
//! raw bytes at rest on both ends; the two representations are never
//! conflated.

use crate::error::{Error, Result};
use crate::store::record::{Meta, Record, RecordKind};
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const STATUS_OK: &str = "Ok";
pub const STATUS_ERROR: &str = "Error";

// ── Records on the wire ─────────────────────────────────────────────

/// A record as replicated between client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    /// Server-assigned id; 0 for records the server has not seen yet.
    pub server_id: i64,
    /// Client-chosen id echoed back in batch outcomes so the uploader can
    /// match acknowledgements to local rows. Meaningful when `server_id == 0`.
    #[serde(default)]
    pub temp_id: i64,
    pub kind: RecordKind,
    /// base64 of the client-side ciphertext.
    pub ciphertext: String,
    #[serde(default)]
    pub meta: Meta,
    pub version: i64,
    /// Epoch milliseconds UTC.
    pub last_modified: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub device_id: String,
}

impl WireRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            server_id: record.server_id,
            temp_id: record.local_id,
            kind: record.kind,
            ciphertext: base64::engine::general_purpose::STANDARD.encode(&record.ciphertext),
            meta: record.meta.clone(),
            version: record.version,
            last_modified: record.last_modified,
            deleted_at: record.deleted_at,
            checksum: record.checksum.clone(),
            device_id: record.device_id.clone(),
        }
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.ciphertext)
            .map_err(|e| Error::BadResponse(format!("ciphertext is not base64: {e}")))
    }

    /// Materialize as a local record (unsaved, unsynced).
    pub fn to_record(&self) -> Result<Record> {
        Ok(Record {
            local_id: 0,
            server_id: self.server_id,
            kind: self.kind,
            ciphertext: self.ciphertext_bytes()?,
            meta: self.meta.clone(),
            version: self.version,
            last_modified: self.last_modified,
            deleted_at: self.deleted_at,
            checksum: self.checksum.clone(),
            device_id: self.device_id.clone(),
            synced: false,
            sync_version: 0,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ── Auth ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    /// Epoch seconds after which the token is dead.
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

// ── Record CRUD ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordCreateRequest {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// base64 payload.
    pub data: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordCreateResponse {
    pub id: i64,
    pub version: i64,
    pub last_modified: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordUpdateRequest {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub data: String,
    #[serde(default)]
    pub meta: Meta,
    pub expected_version: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordUpdateResponse {
    pub version: i64,
    pub last_modified: i64,
}

/// Listing entry: everything except the ciphertext.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: i64,
    pub kind: RecordKind,
    #[serde(default)]
    pub meta: Meta,
    pub version: i64,
    pub last_modified: i64,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordListResponse {
    pub records: Vec<RecordSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordGetResponse {
    pub record: WireRecord,
}

// ── Typed creation ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginCreateRequest {
    #[serde(default)]
    pub title: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TextCreateRequest {
    #[serde(default)]
    pub title: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CardCreateRequest {
    #[serde(default)]
    pub title: String,
    pub number: String,
    #[serde(default)]
    pub holder: String,
    /// `MM/YYYY`
    pub expiry: String,
    pub cvv: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BinaryCreateRequest {
    #[serde(default)]
    pub title: String,
    pub filename: String,
    /// base64 content.
    pub data: String,
}

// ── Sync ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Epoch milliseconds; 0 means "everything".
    pub last_sync_time: i64,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub records: Vec<WireRecord>,
    pub has_more: bool,
    pub server_time: i64,
    pub sync_version: i64,
    #[serde(default)]
    pub stats: SyncStatsSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub records: Vec<WireRecord>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Applied,
    Conflict,
    Failed,
}

/// Per-record acknowledgement inside a batch reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub temp_id: i64,
    pub server_id: i64,
    pub version: i64,
    pub status: BatchStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub processed: u32,
    pub failed: u32,
    pub results: Vec<BatchOutcome>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Per-user counters as reported by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatsSummary {
    pub syncs: i64,
    pub uploads: i64,
    pub downloads: i64,
    pub conflicts: i64,
    pub resolutions: i64,
    pub avg_duration_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub last_sync_time: i64,
    pub sync_version: i64,
    pub records_count: i64,
    pub open_conflicts: i64,
    /// Live record counts per kind.
    #[serde(default)]
    pub records_by_kind: std::collections::BTreeMap<String, i64>,
    #[serde(default)]
    pub stats: SyncStatsSummary,
}

// ── Conflicts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    VersionMismatch,
    DeleteEdit,
    EditDelete,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "version_mismatch",
            Self::DeleteEdit => "delete_edit",
            Self::EditDelete => "edit_delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Client,
    Server,
    Merged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Merged => "merged",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictDto {
    pub id: i64,
    pub record_id: i64,
    #[serde(default)]
    pub device_id: String,
    /// The rejected client view, as uploaded.
    pub local_data: WireRecord,
    /// The winning server view at detection time.
    pub server_data: WireRecord,
    pub conflict_type: ConflictType,
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub created_at: i64,
    #[serde(default)]
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictListResponse {
    pub conflicts: Vec<ConflictDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
    /// Required when `resolution == merged`.
    #[serde(default)]
    pub resolved_data: Option<ResolvedData>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolvedData {
    /// base64 payload.
    pub ciphertext: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub record_id: i64,
    pub version: i64,
}

// ── Devices ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub last_sync_time: i64,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceDto>,
}

// ── Tests ───────────────────────────────────────────────────────────
