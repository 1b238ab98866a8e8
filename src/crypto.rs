//! Keyed hashing for datagram authentication.
//!
//! Every datagram carries a full HMAC-SHA256 tag computed over the serialized
//! message. The HMAC key is never the raw operator secret: key material of any
//! length (a passphrase, the contents of a key file) is expanded with SHA-256
//! first, so both peers only need to agree on the same secret text.

use std::{fs, path::Path};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the authentication tag prefixed to each datagram.
pub const TAG_LENGTH: usize = 32;

/// Errors that can occur while loading key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// No key material was supplied.
    #[error("Key material is empty")]
    Empty,

    /// Failed to read key from file.
    #[error("Failed to read key file: {0}")]
    FileReadError(String),
}

/// Shared secret used to tag and verify datagrams.
#[derive(Clone)]
pub struct HmacKey([u8; 32]);

impl HmacKey {
    /// Derives a key from arbitrary key material.
    ///
    /// # Errors
    /// Returns `KeyError::Empty` if `material` is empty.
    pub fn derive(material: &[u8]) -> Result<Self, KeyError> {
        if material.is_empty() {
            return Err(KeyError::Empty);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(material));
        Ok(Self(key))
    }

    /// Derives a key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, KeyError> {
        Self::derive(passphrase.as_bytes())
    }

    /// Derives a key from the contents of a file.
    ///
    /// A file holding a hex string (surrounding whitespace ignored) contributes
    /// the decoded bytes. Anything else is used as raw bytes.
    ///
    /// # Errors
    /// Returns `KeyError::FileReadError` if the file cannot be read and
    /// `KeyError::Empty` if it holds no key material.
    pub fn from_file(path: &Path) -> Result<Self, KeyError> {
        let raw = fs::read(path).map_err(|e| KeyError::FileReadError(e.to_string()))?;

        if let Ok(text) = std::str::from_utf8(&raw) {
            if let Ok(decoded) = hex::decode(text.trim()) {
                return Self::derive(&decoded);
            }
        }

        Self::derive(&raw)
    }

    /// Computes the HMAC-SHA256 tag of `data`.
    #[must_use]
    pub fn compute(&self, data: &[u8]) -> [u8; TAG_LENGTH] {
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&self.mac(data).finalize().into_bytes());
        tag
    }

    /// Verifies a tag in constant time.
    ///
    /// A tag of any length other than [`TAG_LENGTH`] is rejected.
    #[must_use]
    pub fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        self.mac(data).verify_slice(expected).is_ok()
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(data);
        mac
    }

    /// Short hex fingerprint of the derived key, safe to log.
    ///
    /// Both peers print the same fingerprint when they share a secret.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.0)[..4])
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HmacKey({})", self.fingerprint())
    }
}
