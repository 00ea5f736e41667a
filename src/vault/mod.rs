//! Client-side cryptographic vault.
//!
//! Owns the data encryption key (DEK). Records are encrypted and decrypted
//! here and nowhere else; the DEK never leaves the process in plaintext.
//!
//! ## Key hierarchy
//! - KEK: derived from the master password (PBKDF2-HMAC-SHA256, per-vault salt)
//! - DEK: random 256-bit key, wrapped under the KEK with AES-256-GCM
//! - Session key: random 256-bit key written to `vault.session`, wrapping
//!   the DEK + expiry so a restarted process can resume without the password
//!
//! All ciphertexts are AES-256-GCM with a fresh 96-bit nonce prepended.

pub mod kdf;

use crate::error::{Error, Result};
use crate::util::{atomic_write, constant_time_eq, epoch_secs, restrict_file};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use self::kdf::{derive_kek, verifier_of, VaultHeader, DEFAULT_ITERATIONS, KEY_LEN, SALT_LEN};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// Default unlock session length: 15 minutes.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// On-disk shape of `vault.key`.
#[derive(Serialize, Deserialize)]
struct VaultFile {
    header: VaultHeader,
    /// hex(nonce ‖ AES-256-GCM(KEK, DEK))
    data: String,
}

/// On-disk shape of `vault.session`.
#[derive(Serialize, Deserialize)]
struct SessionFile {
    /// hex of the random session key. Reading this file alone is useless
    /// without `data_hex` authenticating against it, and vice versa.
    key_hex: String,
    /// hex(nonce ‖ AES-256-GCM(session key, SessionEnvelope JSON))
    data_hex: String,
}

/// Plaintext of the session file's sealed envelope.
#[derive(Serialize, Deserialize)]
struct SessionEnvelope {
    dek_hex: String,
    /// Must match the current header's verifier, so a session file cannot
    /// be replayed against a different vault.
    key_hash: String,
    expires_at: i64,
}

/// In-memory unlock state.
struct VaultState {
    dek: Option<Zeroizing<Vec<u8>>>,
    unlocked_until: i64,
    /// Set once the process unlocked at least once; distinguishes
    /// `Locked` from `SessionExpired`.
    had_session: bool,
}

/// The vault manager. One per process.
pub struct Vault {
    key_path: PathBuf,
    session_path: PathBuf,
    session_ttl: Duration,
    state: Mutex<VaultState>,
}

impl Vault {
    /// Attach to the vault files under `config_dir`. Reads nothing yet.
    pub fn open(config_dir: &Path, session_ttl: Duration) -> Self {
        Self {
            key_path: config_dir.join("vault.key"),
            session_path: config_dir.join("vault.session"),
            session_ttl,
            state: Mutex::new(VaultState {
                dek: None,
                unlocked_until: 0,
                had_session: false,
            }),
        }
    }

    pub fn exists(&self) -> bool {
        self.key_path.exists()
    }

    // ── Initialize ──────────────────────────────────────────────────

    /// Create a fresh vault: derive a KEK, generate a random DEK, persist
    /// header + wrapped DEK. Fails with `VaultExists` when one is present.
    pub fn initialize(&self, master_password: &str) -> Result<()> {
        if self.exists() {
            return Err(Error::VaultExists);
        }

        let salt = random_bytes::<SALT_LEN>();
        let kek = derive_kek(master_password, &salt, DEFAULT_ITERATIONS);
        let header = VaultHeader::new(&salt, DEFAULT_ITERATIONS, verifier_of(kek.as_ref()));

        let dek = Zeroizing::new(random_bytes::<KEY_LEN>().to_vec());
        let wrapped = encrypt_with(kek.as_ref(), &dek)?;

        let file = VaultFile {
            header,
            data: hex::encode(wrapped),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::Storage(format!("vault header encode: {e}")))?;
        atomic_write(&self.key_path, &json)?;

        tracing::info!("vault initialized at {}", self.key_path.display());
        Ok(())
    }

    // ── Unlock / Lock ───────────────────────────────────────────────

    /// Re-derive the KEK, check the verifier in constant time, decrypt the
    /// DEK and start an unlock session. Also persists `vault.session` so a
    /// restarted process can recover without the password.
    pub fn unlock(&self, master_password: &str) -> Result<()> {
        let file = self.read_vault_file()?;
        file.header.check_supported()?;

        let salt = file.header.salt()?;
        let kek = derive_kek(master_password, &salt, file.header.iterations);
        let verifier = verifier_of(kek.as_ref());
        if !constant_time_eq(verifier.as_bytes(), file.header.key_hash.as_bytes()) {
            return Err(Error::BadPassword);
        }

        let wrapped = hex::decode(&file.data)
            .map_err(|e| Error::Storage(format!("corrupt wrapped DEK: {e}")))?;
        let dek = Zeroizing::new(decrypt_with(kek.as_ref(), &wrapped)?);
        if dek.len() != KEY_LEN {
            return Err(Error::BadCiphertext);
        }

        let expires_at = epoch_secs() + self.session_ttl.as_secs() as i64;
        self.persist_session(&dek, &file.header.key_hash, expires_at)?;

        let mut state = self.state.lock();
        state.dek = Some(dek);
        state.unlocked_until = expires_at;
        state.had_session = true;
        tracing::info!("vault unlocked for {}s", self.session_ttl.as_secs());
        Ok(())
    }

    /// Recover the DEK from a non-expired session file. Returns `true` on
    /// success, `false` when no usable session exists (missing, expired,
    /// tampered, or belonging to a different vault).
    pub fn try_restore_session(&self) -> Result<bool> {
        if !self.session_path.exists() {
            return Ok(false);
        }
        let header = match self.read_vault_file() {
            Ok(file) => file.header,
            Err(Error::VaultMissing) => return Ok(false),
            Err(e) => return Err(e),
        };

        let restored = self.read_session(&header);
        match restored {
            Some((dek, expires_at)) => {
                let mut state = self.state.lock();
                state.dek = Some(dek);
                state.unlocked_until = expires_at;
                state.had_session = true;
                Ok(true)
            }
            None => {
                // Unusable session files are dropped, not kept around.
                let _ = std::fs::remove_file(&self.session_path);
                Ok(false)
            }
        }
    }

    /// Zero the DEK and drop the session file.
    pub fn lock(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.dek = None; // Zeroizing wipes on drop
        state.unlocked_until = 0;
        state.had_session = false; // an explicit lock is Locked, not SessionExpired
        drop(state);

        if self.session_path.exists() {
            std::fs::remove_file(&self.session_path)?;
        }
        tracing::info!("vault locked");
        Ok(())
    }

    /// True while a non-expired unlock session holds the DEK.
    pub fn is_unlocked(&self) -> bool {
        let mut state = self.state.lock();
        if state.dek.is_some() && epoch_secs() >= state.unlocked_until {
            state.dek = None;
        }
        state.dek.is_some()
    }

    // ── Encrypt / Decrypt ───────────────────────────────────────────

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let dek = self.current_dek(&state)?;
        encrypt_with(dek, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let dek = self.current_dek(&state)?;
        decrypt_with(dek, ciphertext)
    }

    // ── Change password ─────────────────────────────────────────────

    /// Verify the old password, re-derive a KEK from the new one with a
    /// fresh salt, and rewrite header + rewrapped DEK atomically. The DEK
    /// itself is unchanged, so existing records need no re-encryption.
    pub fn change_password(&self, old: &str, new: &str) -> Result<()> {
        let file = self.read_vault_file()?;
        file.header.check_supported()?;

        let old_salt = file.header.salt()?;
        let old_kek = derive_kek(old, &old_salt, file.header.iterations);
        if !constant_time_eq(
            verifier_of(old_kek.as_ref()).as_bytes(),
            file.header.key_hash.as_bytes(),
        ) {
            return Err(Error::BadPassword);
        }

        let wrapped = hex::decode(&file.data)
            .map_err(|e| Error::Storage(format!("corrupt wrapped DEK: {e}")))?;
        let dek = Zeroizing::new(decrypt_with(old_kek.as_ref(), &wrapped)?);

        let new_salt = random_bytes::<SALT_LEN>();
        let new_kek = derive_kek(new, &new_salt, DEFAULT_ITERATIONS);
        let mut header = VaultHeader::new(&new_salt, DEFAULT_ITERATIONS, verifier_of(new_kek.as_ref()));
        header.created_at = file.header.created_at;

        let rewrapped = encrypt_with(new_kek.as_ref(), &dek)?;
        let out = VaultFile {
            header,
            data: hex::encode(rewrapped),
        };
        let json = serde_json::to_vec_pretty(&out)
            .map_err(|e| Error::Storage(format!("vault header encode: {e}")))?;
        atomic_write(&self.key_path, &json)?;

        // The old session envelope carries the old verifier; retire it.
        if self.session_path.exists() {
            let _ = std::fs::remove_file(&self.session_path);
        }
        tracing::info!("master password changed");
        Ok(())
    }

    /// The header's verifier hash, for status display.
    pub fn key_hash(&self) -> Result<String> {
        Ok(self.read_vault_file()?.header.key_hash)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn current_dek<'a>(&self, state: &'a parking_lot::MutexGuard<'_, VaultState>) -> Result<&'a [u8]> {
        match &state.dek {
            Some(dek) if epoch_secs() < state.unlocked_until => Ok(dek.as_ref()),
            _ if state.had_session => Err(Error::SessionExpired),
            _ => Err(Error::Locked),
        }
    }

    fn read_vault_file(&self) -> Result<VaultFile> {
        if !self.key_path.exists() {
            return Err(Error::VaultMissing);
        }
        let bytes = std::fs::read(&self.key_path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Storage(format!("corrupt vault.key: {e}")))
    }

    fn persist_session(&self, dek: &[u8], key_hash: &str, expires_at: i64) -> Result<()> {
        let session_key = random_bytes::<KEY_LEN>();
        let envelope = SessionEnvelope {
            dek_hex: hex::encode(dek),
            key_hash: key_hash.to_string(),
            expires_at,
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&envelope)
                .map_err(|e| Error::Storage(format!("session encode: {e}")))?,
        );
        let sealed = encrypt_with(&session_key, &plaintext)?;

        let file = SessionFile {
            key_hex: hex::encode(session_key),
            data_hex: hex::encode(sealed),
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| Error::Storage(format!("session encode: {e}")))?;
        std::fs::write(&self.session_path, &json)?;
        restrict_file(&self.session_path)?;
        Ok(())
    }

    /// Decrypt and vet the session file. `None` means "unusable".
    fn read_session(&self, header: &VaultHeader) -> Option<(Zeroizing<Vec<u8>>, i64)> {
        let bytes = std::fs::read(&self.session_path).ok()?;
        let file: SessionFile = serde_json::from_slice(&bytes).ok()?;

        let session_key = hex::decode(&file.key_hex).ok()?;
        let sealed = hex::decode(&file.data_hex).ok()?;
        let plaintext = Zeroizing::new(decrypt_with(&session_key, &sealed).ok()?);

        let envelope: SessionEnvelope = serde_json::from_slice(&plaintext).ok()?;
        if envelope.expires_at <= epoch_secs() {
            tracing::debug!("vault session expired");
            return None;
        }
        if !constant_time_eq(envelope.key_hash.as_bytes(), header.key_hash.as_bytes()) {
            tracing::warn!("vault session belongs to a different vault, discarding");
            return None;
        }

        let dek = Zeroizing::new(hex::decode(&envelope.dek_hex).ok()?);
        if dek.len() != KEY_LEN {
            return None;
        }
        Some((dek, envelope.expires_at))
    }
}

// ── AEAD primitives ─────────────────────────────────────────────────

/// AES-256-GCM with a fresh random nonce prepended to the ciphertext.
fn encrypt_with(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Storage(format!("cipher init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::BadCiphertext)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_with`]. Authentication failure is `BadCiphertext`.
fn decrypt_with(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(Error::BadCiphertext);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Storage(format!("cipher init failed: {e}")))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::BadCiphertext)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// ── Tests ───────────────────────────────────────────────────────────
