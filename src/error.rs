//! Crate-wide error taxonomy.
//!
//! Every fallible core operation returns [`enum@Error`]. The variants are
//! grouped by subsystem (auth, vault, store, validation, transport, sync)
//! and map 1:1 onto the HTTP status codes the server speaks and onto the
//! diagnostic lines the CLI prints.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // ── Auth ────────────────────────────────────────────────────────
    #[error("not authenticated; run `keepr login` first")]
    Unauthenticated,

    #[error("invalid login or password")]
    BadCredentials,

    #[error("session token expired; run `keepr login` again")]
    TokenExpired,

    // ── Vault ───────────────────────────────────────────────────────
    #[error("vault already initialized")]
    VaultExists,

    #[error("vault not initialized; run `keepr init` first")]
    VaultMissing,

    #[error("wrong master password")]
    BadPassword,

    #[error("vault is locked; run `keepr unlock` first")]
    Locked,

    #[error("ciphertext failed authentication")]
    BadCiphertext,

    #[error("vault session expired; run `keepr unlock` again")]
    SessionExpired,

    // ── Store ───────────────────────────────────────────────────────
    #[error("record not found")]
    NotFound,

    #[error("record was deleted")]
    Deleted,

    #[error("version mismatch: expected {expected}, stored {stored}")]
    VersionMismatch { expected: i64, stored: i64 },

    #[error("storage is full")]
    StorageFull,

    #[error("storage error: {0}")]
    Storage(String),

    // ── Validation ──────────────────────────────────────────────────
    #[error("validation failed: {0}")]
    Unprocessable(String),

    // ── Transport ───────────────────────────────────────────────────
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("server fault: {0}")]
    ServerFault(String),

    #[error("malformed server response: {0}")]
    BadResponse(String),

    // ── Sync ────────────────────────────────────────────────────────
    #[error("a sync is already in progress")]
    InProgress,

    #[error("sync ran {0}s ago, cooling down")]
    Cooldown(u64),

    #[error("server storage quota exceeded")]
    QuotaExceeded,
}

impl Error {
    /// True when a retry within the transport budget may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::ServerFault(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::DiskFull =>
            {
                let _ = msg;
                Self::StorageFull
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
