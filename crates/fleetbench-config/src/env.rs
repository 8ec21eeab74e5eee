// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Environment projection: parses raw external config data into the typed
//! [`EnvConfig`] and resolves `${VAR}` placeholders against the process
//! environment before the merger sees it.

use crate::error::{ConfigError, Result};
use crate::models::EnvConfig;
use tracing::{debug, warn};

/// Parses a raw JSON payload (as handed over by the control surface) into a
/// typed [`EnvConfig`], then resolves `${VAR}` placeholders in every string
/// field against the process environment.
pub fn project(raw: &serde_json::Value) -> Result<EnvConfig> {
    let mut config: EnvConfig = serde_json::from_value(raw.clone())?;
    resolve_placeholders(&mut config);
    Ok(config)
}

fn resolve_placeholders(config: &mut EnvConfig) {
    for domain in &mut config.domains {
        domain.base_url = resolve_string(&domain.base_url);
        for value in domain.headers.values_mut() {
            *value = resolve_string(value);
        }
    }
    for variable in &mut config.variables {
        variable.value = resolve_string(&variable.value);
    }
    for db in &mut config.databases {
        db.host = resolve_string(&db.host);
        db.username = resolve_string(&db.username);
        db.password = resolve_string(&db.password);
    }
    for mq in &mut config.mqs {
        mq.host = resolve_string(&mq.host);
        mq.username = resolve_string(&mq.username);
        mq.password = resolve_string(&mq.password);
    }
}

/// Replaces every `${NAME}` occurrence in `raw` with the value of the `NAME`
/// environment variable. Unresolved placeholders are left verbatim and a
/// warning is logged — this is a best-effort substitution, not a hard error.
pub fn resolve_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => {
                        debug!("resolved placeholder ${{{name}}}");
                        out.push_str(&value);
                    }
                    Err(_) => {
                        warn!("unresolved environment placeholder: ${{{name}}}");
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn parse_error_from_missing_field(field: &str) -> ConfigError {
    ConfigError::InvalidValue(format!("missing required field: {field}"))
}
