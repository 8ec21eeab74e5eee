// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Config merger (spec §4.M): merges environment data into a workflow's
//! variables and rewrites step configs so front-end placeholders resolve to
//! concrete connection fields.

use crate::cache::DecryptedValueCache;
use crate::crypto::{self, EncryptionKey};
use crate::error::{ConfigError, Result};
use crate::models::EnvConfig;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

pub const DOMAINS_VAR: &str = "__domains__";
pub const DATABASES_VAR: &str = "__databases__";
pub const MQS_VAR: &str = "__mqs__";

/// Merges [`EnvConfig`] data into a workflow's variable map and rewrites step
/// configs that reference domains/databases/MQs by code.
pub struct ConfigMerger {
    key: EncryptionKey,
    cache: DecryptedValueCache,
}

impl ConfigMerger {
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            key,
            cache: DecryptedValueCache::with_default_ttl(),
        }
    }

    /// Decrypts `value` if `sensitive`, else returns it unchanged. Per the
    /// *DecryptionError* taxonomy entry: a decryption failure is non-fatal —
    /// the stored form is left in place and a warning is recorded.
    fn decrypt_if_sensitive(&self, value: &str, sensitive: bool) -> String {
        if !sensitive {
            return value.to_string();
        }
        if let Some(cached) = self.cache.get(value) {
            return cached;
        }
        match crypto::decrypt(value, &self.key) {
            Ok(plain) => {
                self.cache.put(value, plain.clone());
                plain
            }
            Err(e) => {
                warn!("decryption failed, leaving stored form in place: {e}");
                value.to_string()
            }
        }
    }

    /// Merges `env` into `variables`: the workflow's own variables are kept
    /// as the base, environment variables are overlaid on top (environment
    /// precedence), then `__domains__`/`__databases__`/`__mqs__` are
    /// installed as reserved names.
    pub fn merge(&self, variables: &mut HashMap<String, Value>, env: &EnvConfig) -> Result<()> {
        for var in &env.variables {
            let resolved = self.decrypt_if_sensitive(&var.value, var.sensitive);
            variables.insert(var.name.clone(), Value::String(resolved));
        }

        let domains: Vec<Value> = env
            .domains
            .iter()
            .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
            .collect();
        variables.insert(DOMAINS_VAR.to_string(), Value::Array(domains));

        let databases: Vec<Value> = env
            .databases
            .iter()
            .map(|d| {
                let mut d = d.clone();
                d.password = self.decrypt_if_sensitive(&d.password, true);
                serde_json::to_value(&d).unwrap_or(Value::Null)
            })
            .collect();
        variables.insert(DATABASES_VAR.to_string(), Value::Array(databases));

        let mqs: Vec<Value> = env
            .mqs
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.password = self.decrypt_if_sensitive(&m.password, true);
                serde_json::to_value(&m).unwrap_or(Value::Null)
            })
            .collect();
        variables.insert(MQS_VAR.to_string(), Value::Array(mqs));

        Ok(())
    }

    /// Rewrites `domainCode`, `datasourceCode`, and `mq_config` placeholders
    /// in a step's config into concrete connection fields. For databases, a
    /// DSN string is constructed per driver and installed as `dsn`.
    pub fn resolve_step_config(&self, config: &mut HashMap<String, Value>, env: &EnvConfig) -> Result<()> {
        if let Some(Value::String(code)) = config.get("domainCode").cloned() {
            let domain = env
                .domain(&code)
                .ok_or_else(|| ConfigError::DomainNotFound(code.clone()))?;
            config.insert("base_url".to_string(), Value::String(domain.base_url.clone()));
            config.insert(
                "headers".to_string(),
                serde_json::to_value(&domain.headers).unwrap_or(Value::Null),
            );
        }

        if let Some(Value::String(code)) = config.get("datasourceCode").cloned() {
            let db = env
                .database(&code)
                .ok_or_else(|| ConfigError::DataSourceNotFound(code.clone()))?;
            let mut db = db.clone();
            db.password = self.decrypt_if_sensitive(&db.password, true);
            config.insert("dsn".to_string(), Value::String(db.dsn()));
            config.insert("database_config".to_string(), serde_json::to_value(&db).unwrap_or(Value::Null));
        }

        if let Some(Value::String(code)) = config.get("mq_config").cloned() {
            let mq = env
                .mq(&code)
                .ok_or_else(|| ConfigError::MqNotFound(code.clone()))?;
            let mut mq = mq.clone();
            mq.password = self.decrypt_if_sensitive(&mq.password, true);
            config.insert("mq_config".to_string(), serde_json::to_value(&mq).unwrap_or(Value::Null));
        }

        Ok(())
    }
}
