// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Authenticated encryption for sensitive configuration values (spec §7).
//!
//! `encrypt` prepends a fresh random 96-bit nonce to the ciphertext and
//! base64-encodes the result; `decrypt` is the inverse. Round-trip:
//! `decrypt(encrypt(p)) == p`; `encrypt(p)` differs between independent calls.

use crate::error::{ConfigError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// A 256-bit key used to encrypt/decrypt sensitive values.
#[derive(Clone)]
pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    /// Builds a key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Key::<Aes256Gcm>::from(bytes))
    }

    /// Derives a key by truncating/padding an arbitrary secret to 32 bytes.
    /// Intended for environment-supplied master keys (`FLEETBENCH_CONFIG_KEY`).
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        for (i, b) in secret.iter().enumerate() {
            bytes[i % 32] ^= *b;
        }
        Self::from_bytes(bytes)
    }
}

/// Encrypts `plaintext`, returning a base64-encoded `nonce || ciphertext`.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String> {
    let cipher = Aes256Gcm::new(&key.0);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| ConfigError::DecryptionError(format!("encryption failed: {e}")))?;

    let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Decrypts a value produced by [`encrypt`].
pub fn decrypt(encoded: &str, key: &EncryptionKey) -> Result<String> {
    let combined = BASE64
        .decode(encoded)
        .map_err(|e| ConfigError::DecryptionError(format!("invalid base64: {e}")))?;

    if combined.len() < 12 {
        return Err(ConfigError::DecryptionError("ciphertext too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(&key.0);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| ConfigError::DecryptionError(format!("decryption failed: {e}")))?;

    String::from_utf8(plaintext)
        .map_err(|e| ConfigError::DecryptionError(format!("decrypted value is not utf-8: {e}")))
}
