//! Record model: the four record kinds, their typed payloads, validation,
//! and the content checksum.
//!
//! A [`Record`] is the replicated entity. Its `ciphertext` is opaque past
//! this module boundary: the vault encrypts a serialized [`RecordPayload`]
//! and nobody else ever sees plaintext. `meta` carries the non-secret
//! attributes (`title`, `tags`, `filename`) kept in clear for listing.

use crate::error::{Error, Result};
use crate::util::epoch_ms;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hard ceiling for free-text content (10 MiB).
pub const MAX_TEXT_BYTES: usize = 10 * 1024 * 1024;

/// Hard ceiling for binary payloads (100 MiB).
pub const MAX_BINARY_BYTES: usize = 100 * 1024 * 1024;

/// Non-secret attributes as an ordered map (deterministic checksums).
pub type Meta = BTreeMap<String, String>;

// ── Record kind ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Login,
    Text,
    Card,
    Binary,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Text => "text",
            Self::Card => "card",
            Self::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "login" => Ok(Self::Login),
            "text" => Ok(Self::Text),
            "card" => Ok(Self::Card),
            "binary" => Ok(Self::Binary),
            other => Err(Error::Unprocessable(format!("unknown record kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Record ──────────────────────────────────────────────────────────

/// The replicated entity with its sync metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Monotonic id assigned by the local store; 0 before first save.
    pub local_id: i64,
    /// Id assigned by the server on first upload; 0 until then, then frozen.
    pub server_id: i64,
    pub kind: RecordKind,
    /// Client-encrypted payload. Opaque bytes.
    pub ciphertext: Vec<u8>,
    pub meta: Meta,
    /// Monotonic per-record counter; incremented on every mutation.
    pub version: i64,
    /// Last mutation timestamp, epoch milliseconds UTC.
    pub last_modified: i64,
    /// Soft-delete marker; set once, only ever moves forward.
    pub deleted_at: Option<i64>,
    /// SHA-256 over ciphertext ‖ kind ‖ canonical meta.
    pub checksum: String,
    /// Mutator identity; informational.
    pub device_id: String,
    /// Client-only: true once local state matches the server.
    pub synced: bool,
    /// Client-only: last version the server acknowledged.
    pub sync_version: i64,
}

impl Record {
    /// Fresh unsaved record at version 1.
    pub fn new(kind: RecordKind, ciphertext: Vec<u8>, meta: Meta, device_id: &str) -> Self {
        let checksum = checksum_of(&ciphertext, kind, &meta);
        Self {
            local_id: 0,
            server_id: 0,
            kind,
            ciphertext,
            meta,
            version: 1,
            last_modified: epoch_ms(),
            deleted_at: None,
            checksum,
            device_id: device_id.to_string(),
            synced: false,
            sync_version: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn title(&self) -> &str {
        self.meta.get("title").map(String::as_str).unwrap_or("")
    }

    /// Register a mutation: bump version, advance `last_modified` strictly,
    /// clear `synced`, refresh the checksum.
    pub fn touch(&mut self, device_id: &str) {
        self.version += 1;
        self.last_modified = epoch_ms().max(self.last_modified + 1);
        self.device_id = device_id.to_string();
        self.synced = false;
        self.checksum = checksum_of(&self.ciphertext, self.kind, &self.meta);
    }

    /// Soft-delete: sets `deleted_at` once and only moves it forward.
    pub fn mark_deleted(&mut self, device_id: &str) {
        let now = epoch_ms().max(self.last_modified + 1);
        self.deleted_at = Some(self.deleted_at.map_or(now, |prev| prev.max(now)));
        self.version += 1;
        self.last_modified = now;
        self.device_id = device_id.to_string();
        self.synced = false;
    }
}

/// SHA-256 over `ciphertext ‖ kind ‖ meta` with unit separators, meta in
/// key order. Deterministic for identical content.
pub fn checksum_of(ciphertext: &[u8], kind: RecordKind, meta: &Meta) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    hasher.update([0x1f]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0x1f]);
    for (k, v) in meta {
        hasher.update(k.as_bytes());
        hasher.update([0x1e]);
        hasher.update(v.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

// ── Typed payloads ──────────────────────────────────────────────────

mod b64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Plaintext shape of a record, one variant per kind. Serialized with
/// serde_json and encrypted by the vault before it ever leaves the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    Login {
        username: String,
        password: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        notes: String,
    },
    Text {
        content: String,
    },
    Card {
        number: String,
        holder: String,
        /// `MM/YYYY`
        expiry: String,
        cvv: String,
    },
    Binary {
        filename: String,
        #[serde(with = "b64_bytes")]
        data: Vec<u8>,
    },
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Login { .. } => RecordKind::Login,
            Self::Text { .. } => RecordKind::Text,
            Self::Card { .. } => RecordKind::Card,
            Self::Binary { .. } => RecordKind::Binary,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Unprocessable(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            tracing::debug!("payload parse failed: {e}");
            Error::BadCiphertext
        })
    }

    /// Field-level validation per kind. Same rules on client and server.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Login { username, password, .. } => {
                if username.is_empty() {
                    return Err(Error::Unprocessable("login: username is required".into()));
                }
                if password.is_empty() {
                    return Err(Error::Unprocessable("login: password is required".into()));
                }
                Ok(())
            }
            Self::Text { content } => {
                if content.len() > MAX_TEXT_BYTES {
                    return Err(Error::Unprocessable(format!(
                        "text content exceeds {} bytes",
                        MAX_TEXT_BYTES
                    )));
                }
                Ok(())
            }
            Self::Card {
                number,
                expiry,
                cvv,
                ..
            } => {
                validate_card_number(number)?;
                validate_card_expiry(expiry)?;
                validate_cvv(cvv)?;
                Ok(())
            }
            Self::Binary { filename, data } => {
                if filename.trim().is_empty() {
                    return Err(Error::Unprocessable("binary: filename is required".into()));
                }
                if data.len() > MAX_BINARY_BYTES {
                    return Err(Error::Unprocessable(format!(
                        "binary data exceeds {} bytes",
                        MAX_BINARY_BYTES
                    )));
                }
                Ok(())
            }
        }
    }
}

/// 13–19 digits after stripping spaces and dashes.
fn validate_card_number(number: &str) -> Result<()> {
    let digits: String = number
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Unprocessable(
            "card number may contain only digits, spaces, and dashes".into(),
        ));
    }
    if !(13..=19).contains(&digits.len()) {
        return Err(Error::Unprocessable(
            "card number must be 13-19 digits".into(),
        ));
    }
    Ok(())
}

fn validate_cvv(cvv: &str) -> Result<()> {
    if !(3..=4).contains(&cvv.len()) || !cvv.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Unprocessable("CVV must be 3-4 digits".into()));
    }
    Ok(())
}

/// `MM/YYYY` with month 01-12 and the month not already past.
fn validate_card_expiry(expiry: &str) -> Result<()> {
    let (mm, yyyy) = expiry
        .split_once('/')
        .ok_or_else(|| Error::Unprocessable("expiry must be MM/YYYY".into()))?;
    if mm.len() != 2 || yyyy.len() != 4 {
        return Err(Error::Unprocessable("expiry must be MM/YYYY".into()));
    }
    let month: u32 = mm
        .parse()
        .map_err(|_| Error::Unprocessable("expiry month is not a number".into()))?;
    let year: i32 = yyyy
        .parse()
        .map_err(|_| Error::Unprocessable("expiry year is not a number".into()))?;
    if !(1..=12).contains(&month) {
        return Err(Error::Unprocessable("expiry month must be 01-12".into()));
    }

    use chrono::Datelike;
    let now = chrono::Utc::now();
    if year < now.year() || (year == now.year() && month < now.month()) {
        return Err(Error::Unprocessable("card is expired".into()));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
