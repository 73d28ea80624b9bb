//! # Crypto Vault
//!
//! Derives the at-rest encryption key from an operator passphrase and seals
//! every record before it touches persistent storage. Terminals live in
//! buses and on station walls; assume the disk walks away.
//!
//! Two primitives, nothing clever:
//!
//! - **PBKDF2-HMAC-SHA256** with a fixed iteration count
//!   ([`crate::config::KDF_ITERATIONS`]) turns the passphrase + salt into a
//!   256-bit key. The cost is intentional — it is the only thing standing
//!   between a stolen database file and an offline brute-force.
//! - **AES-256-GCM** with a random 96-bit nonce provides confidentiality and
//!   integrity in one operation. The sealed format is `nonce || ciphertext`,
//!   with the 16-byte GCM tag appended by the cipher itself.
//!
//! ## Integrity is a first-class failure
//!
//! [`Vault::open`] fails with [`VaultError::Integrity`] when the ciphertext
//! was tampered with or the key is wrong. Callers must keep that distinct
//! from "record not found": corrupted financial state is an alarm condition,
//! not an empty result.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::config::{VaultConfig, AES_KEY_LENGTH, AES_NONCE_LENGTH, KDF_ITERATIONS};

/// Errors that can occur while sealing or opening records.
///
/// Deliberately terse: the difference between "wrong key" and "flipped bit"
/// is not something we can know, and not something an attacker should learn.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Encryption itself failed. Practically unreachable with a valid key,
    /// but crypto code does not get to assume that.
    #[error("sealing record failed")]
    Seal,

    /// Authentication failed on open: the data was modified, truncated, or
    /// sealed under a different key. Never treat this as an absent record.
    #[error("record failed integrity check -- wrong key or tampered data")]
    Integrity,

    /// Sealed input shorter than a nonce; cannot even be malformed ciphertext.
    #[error("sealed record too short: need at least {AES_NONCE_LENGTH} bytes")]
    TooShort,
}

/// Derive the storage key from a passphrase and salt.
///
/// PBKDF2-HMAC-SHA256 at [`KDF_ITERATIONS`] rounds. Deterministic: the same
/// passphrase and salt always yield the same key, which is what lets a
/// terminal reopen its own store after a restart.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; AES_KEY_LENGTH] {
    let mut key = [0u8; AES_KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

/// Seals and opens records with a key derived once at construction.
///
/// Cheap to clone conceptually but deliberately not `Clone`: every copy of
/// key material is another thing to protect. Share it behind an `Arc`.
pub struct Vault {
    key: [u8; AES_KEY_LENGTH],
}

impl Vault {
    /// Builds a vault by running key derivation on the configured
    /// passphrase and salt. This is the expensive call — do it once at
    /// startup, not per record.
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            key: derive_key(&config.passphrase, &config.salt),
        }
    }

    /// Builds a vault from an already-derived raw key. Used by tests and by
    /// anything that manages key material out of band.
    pub fn from_key(key: [u8; AES_KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Encrypts a record for storage.
    ///
    /// Returns `nonce || ciphertext` as a single buffer; the nonce is fresh
    /// random per call, so sealing the same plaintext twice yields different
    /// bytes.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::Seal)?;

        let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::Seal)?;

        let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a record previously produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// [`VaultError::Integrity`] if the key is wrong or the data was
    /// modified in any way — bit flip, truncation past the nonce, appended
    /// garbage. [`VaultError::TooShort`] if there is not even a full nonce.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
        if sealed.len() < AES_NONCE_LENGTH {
            return Err(VaultError::TooShort);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::Integrity)?;
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Integrity)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in Debug output. Not even partially.
        write!(f, "Vault(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::new(&VaultConfig {
            passphrase: "terminal-passphrase".into(),
            salt: b"farebox_test_salt".to_vec(),
        })
    }

    #[test]
    fn seal_open_roundtrip() {
        let vault = test_vault();
        let plaintext = b"card 04A1B2C3 balance 4200";

        let sealed = vault.seal(plaintext).unwrap();
        let opened = vault.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn seal_empty_plaintext() {
        // Sealing nothing is valid: nonce + auth tag only.
        let vault = test_vault();
        let sealed = vault.seal(b"").unwrap();
        assert_eq!(sealed.len(), AES_NONCE_LENGTH + 16);
        assert!(vault.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn wrong_passphrase_fails_integrity() {
        let vault = test_vault();
        let sealed = vault.seal(b"balance 4200").unwrap();

        let wrong = Vault::new(&VaultConfig {
            passphrase: "not-the-passphrase".into(),
            salt: b"farebox_test_salt".to_vec(),
        });
        // Must be a hard integrity error, never garbage plaintext.
        assert!(matches!(wrong.open(&sealed), Err(VaultError::Integrity)));
    }

    #[test]
    fn wrong_salt_fails_integrity() {
        let vault = test_vault();
        let sealed = vault.seal(b"balance 4200").unwrap();

        let wrong = Vault::new(&VaultConfig {
            passphrase: "terminal-passphrase".into(),
            salt: b"some_other_salt".to_vec(),
        });
        assert!(matches!(wrong.open(&sealed), Err(VaultError::Integrity)));
    }

    #[test]
    fn tampered_ciphertext_fails_integrity() {
        let vault = test_vault();
        let mut sealed = vault.seal(b"balance 4200").unwrap();
        sealed[AES_NONCE_LENGTH] ^= 0xFF;
        assert!(matches!(vault.open(&sealed), Err(VaultError::Integrity)));
    }

    #[test]
    fn truncated_record_fails() {
        let vault = test_vault();
        let sealed = vault.seal(b"balance 4200").unwrap();

        // Truncated mid-ciphertext: integrity failure.
        assert!(matches!(
            vault.open(&sealed[..sealed.len() - 1]),
            Err(VaultError::Integrity)
        ));
        // Shorter than a nonce: structurally invalid.
        assert!(matches!(vault.open(&sealed[..4]), Err(VaultError::TooShort)));
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        // Same key, same plaintext, different sealed bytes. If this ever
        // fails the RNG is broken and GCM security is gone with it.
        let vault = test_vault();
        let a = vault.seal(b"tap").unwrap();
        let b = vault.seal(b"tap").unwrap();
        assert_ne!(&a[..AES_NONCE_LENGTH], &b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn key_derivation_is_deterministic() {
        // A terminal restart re-derives the same key from the same config.
        let a = derive_key("passphrase", b"salt");
        let b = derive_key("passphrase", b"salt");
        assert_eq!(a, b);
    }

    #[test]
    fn key_derivation_separates_inputs() {
        let base = derive_key("passphrase", b"salt");
        assert_ne!(base, derive_key("passphrase2", b"salt"));
        assert_ne!(base, derive_key("passphrase", b"salt2"));
    }

    #[test]
    fn debug_leaks_nothing() {
        let vault = test_vault();
        assert_eq!(format!("{:?}", vault), "Vault(..)");
    }
}
