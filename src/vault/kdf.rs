//! Master-password key derivation and the persisted vault header.
//!
//! The KEK is derived with PBKDF2-HMAC-SHA256 over a per-vault 128-bit
//! salt. The header records the algorithm id and iteration count so the
//! parameters can be raised (or the algorithm swapped) without breaking
//! existing vaults, and a SHA-256 of the KEK as the password verifier.

use crate::error::{Error, Result};
use crate::util::epoch_secs;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Algorithm id written into the header.
pub const ALGORITHM_ID: &str = "pbkdf2-sha256";

/// Default PBKDF2 iteration count (OWASP figure for HMAC-SHA256).
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Vaults with fewer iterations than this are refused.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Salt length in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// KEK/DEK length in bytes (256-bit keys).
pub const KEY_LEN: usize = 32;

/// Persisted KDF parameters + password verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultHeader {
    pub algorithm: String,
    pub salt_hex: String,
    pub iterations: u32,
    /// hex(SHA-256(KEK)), compared in constant time on unlock.
    pub key_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VaultHeader {
    pub fn new(salt: &[u8], iterations: u32, key_hash: String) -> Self {
        let now = epoch_secs();
        Self {
            algorithm: ALGORITHM_ID.to_string(),
            salt_hex: hex::encode(salt),
            iterations,
            key_hash,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject headers this build cannot interpret.
    pub fn check_supported(&self) -> Result<()> {
        if self.algorithm != ALGORITHM_ID {
            return Err(Error::Storage(format!(
                "unsupported vault algorithm '{}'",
                self.algorithm
            )));
        }
        if self.iterations < MIN_ITERATIONS {
            return Err(Error::Storage(format!(
                "vault iteration count {} below minimum {}",
                self.iterations, MIN_ITERATIONS
            )));
        }
        Ok(())
    }

    pub fn salt(&self) -> Result<Vec<u8>> {
        hex::decode(&self.salt_hex).map_err(|e| Error::Storage(format!("corrupt salt: {e}")))
    }
}

/// Derive the 256-bit KEK from the master password.
pub fn derive_kek(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, kek.as_mut());
    kek
}

/// hex(SHA-256(KEK)), stored in the header, never the KEK itself.
pub fn verifier_of(kek: &[u8]) -> String {
    hex::encode(Sha256::digest(kek))
}
