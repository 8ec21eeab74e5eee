// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the environment config merger.

use thiserror::Error;

/// Result type for config merger operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A sensitive value could not be decrypted. Per the decryption invariant,
    /// callers treat this as non-fatal: leave the stored form in place and warn.
    #[error("failed to decrypt value: {0}")]
    DecryptionError(String),

    #[error("referenced domain not found: {0}")]
    DomainNotFound(String),

    #[error("referenced data source not found: {0}")]
    DataSourceNotFound(String),

    #[error("referenced MQ connection not found: {0}")]
    MqNotFound(String),

    #[error("unsupported database driver: {0}")]
    UnsupportedDriver(String),

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
