// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Symmetric secret store for tenant database passwords and domain tokens.
//!
//! Secrets are encrypted with AES-256-GCM under a process-wide key and
//! persisted as an opaque envelope `enc:<nonce>:<ciphertext>` (both parts
//! base64-url, no padding). The envelope is the only path back to the
//! plaintext; rows never hold raw credentials.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use crate::error::{CoreError, Result};

/// Envelope prefix discriminating the encryption scheme version.
pub const ENVELOPE_PREFIX: &str = "enc:";

const NONCE_LEN: usize = 12;

/// AES-256-GCM secret store with a process-wide key.
#[derive(Clone)]
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Create a secret store from raw key material.
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
        Self { cipher }
    }

    /// Create a secret store from a base64-encoded 32-byte key.
    ///
    /// Accepts both url-safe and standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .or_else(|_| {
                base64::engine::general_purpose::STANDARD.decode(encoded.trim())
            })
            .map_err(|_| CoreError::InvalidSecret {
                reason: "encryption key is not valid base64".to_string(),
            })?;

        if decoded.len() != 32 {
            return Err(CoreError::InvalidSecret {
                reason: format!("encryption key must be 32 bytes, got {}", decoded.len()),
            });
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(Self::new(&key))
    }

    /// Encrypt a plaintext into an `enc:` envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CoreError::InvalidSecret {
                reason: "encryption failed".to_string(),
            })?;

        Ok(format!(
            "{}{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Decrypt an `enc:` envelope back to the plaintext.
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| CoreError::InvalidSecret {
                reason: "missing enc: prefix".to_string(),
            })?;

        let (nonce_b64, ciphertext_b64) =
            body.split_once(':').ok_or_else(|| CoreError::InvalidSecret {
                reason: "malformed envelope body".to_string(),
            })?;

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| CoreError::InvalidSecret {
                reason: "nonce is not valid base64".to_string(),
            })?;
        if nonce.len() != NONCE_LEN {
            return Err(CoreError::InvalidSecret {
                reason: "nonce length is invalid".to_string(),
            });
        }

        let ciphertext =
            URL_SAFE_NO_PAD
                .decode(ciphertext_b64)
                .map_err(|_| CoreError::InvalidSecret {
                    reason: "ciphertext is not valid base64".to_string(),
                })?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CoreError::InvalidSecret {
                reason: "decryption failed".to_string(),
            })?;

        String::from_utf8(plaintext).map_err(|_| CoreError::InvalidSecret {
            reason: "plaintext is not valid utf-8".to_string(),
        })
    }

    /// Mask a plaintext for display, keeping only the last 4 characters.
    pub fn preview(plaintext: &str) -> String {
        let chars: Vec<char> = plaintext.chars().collect();
        if chars.len() <= 4 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

/// Whether a persisted value is an encrypted envelope.
pub fn is_envelope(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::new(&[7u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let store = store();
        for plaintext in ["", "p", "hunter2", "päss wörd 🔑", &"x".repeat(4096)] {
            let envelope = store.encrypt(plaintext).unwrap();
            assert!(envelope.starts_with("enc:"), "envelope: {}", envelope);
            assert_eq!(store.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_distinct_nonces() {
        let store = store();
        let a = store.encrypt("same").unwrap();
        let b = store.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let store = store();
        let err = store.decrypt("not-an-envelope").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_SECRET");
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let store = store();
        let mut envelope = store.encrypt("secret").unwrap();
        envelope.pop();
        envelope.push('A');
        assert!(store.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = store().encrypt("secret").unwrap();
        let other = SecretStore::new(&[9u8; 32]);
        assert!(other.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_from_base64_validates_length() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(SecretStore::from_base64(&short).is_err());

        let ok = URL_SAFE_NO_PAD.encode([1u8; 32]);
        assert!(SecretStore::from_base64(&ok).is_ok());
    }

    #[test]
    fn test_preview_masks() {
        assert_eq!(SecretStore::preview("hunter2"), "****ter2");
        assert_eq!(SecretStore::preview("abc"), "****");
    }

    #[test]
    fn test_is_envelope() {
        assert!(is_envelope("enc:a:b"));
        assert!(!is_envelope("plaintext"));
    }
}
