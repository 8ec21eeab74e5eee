// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Environment config merger for fleetbench workflows.
//!
//! This crate provides:
//! - Typed projections of domains, database connections, and MQ connections
//! - Authenticated encryption/decryption of sensitive configuration values
//! - A TTL cache for decrypted values
//! - The config merger that installs `__domains__`/`__databases__`/`__mqs__`
//!   reserved variables and rewrites step configs that reference connections
//!   by code
//!
//! # Example
//!
//! ```
//! use fleetbench_config::{ConfigMerger, EncryptionKey, EnvConfig, Domain};
//! use std::collections::HashMap;
//! use serde_json::Value;
//!
//! let key = EncryptionKey::from_bytes([0u8; 32]);
//! let merger = ConfigMerger::new(key);
//!
//! let mut env = EnvConfig::new();
//! env.domains.push(Domain::new("svc", "https://svc.example.com"));
//!
//! let mut variables: HashMap<String, Value> = HashMap::new();
//! merger.merge(&mut variables, &env).unwrap();
//! assert!(variables.contains_key("__domains__"));
//! ```

pub mod cache;
pub mod crypto;
pub mod env;
pub mod error;
pub mod merger;
pub mod models;

pub use cache::{CacheStats, DecryptedValueCache};
pub use crypto::EncryptionKey;
pub use error::{ConfigError, Result};
pub use merger::{ConfigMerger, DATABASES_VAR, DOMAINS_VAR, MQS_VAR};
pub use models::{DatabaseConnection, DatabaseDriver, Domain, EnvConfig, EnvVariable, MqConnection};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_reexports_build() {
        let key = EncryptionKey::from_bytes([1u8; 32]);
        let _merger = ConfigMerger::new(key);
        let _env = EnvConfig::new();
    }
}
