// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Step executor trait and registry (spec §9 "Dynamic dispatch over step
//! types").
//!
//! Concrete executors for `http`, `script`, `db`, `mq`, `ai`, and `ai_agent`
//! step types are external collaborators outside this engine's scope; only
//! `wait` ships as a reference implementation here.

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::workflow::Step;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Executes a single step's config against a context, producing its output
/// value or an error. Implementations must honor cancellation cooperatively
/// rather than being killed mid-call (spec §5).
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<Value>;
}

/// Executes `wait` steps: sleeps for the duration encoded in `config.duration`
/// (a humantime-style string such as `"10ms"` or `"2s"`).
pub struct WaitExecutor;

#[async_trait]
impl StepExecutor for WaitExecutor {
    async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<Value> {
        let raw = step
            .config
            .get("duration")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::config(step.id.clone(), "wait step missing duration"))?;

        let duration = parse_duration(raw)
            .ok_or_else(|| EngineError::config(step.id.clone(), format!("invalid duration '{raw}'")))?;

        tokio::time::sleep(duration).await;
        Ok(Value::String(format!("waited {raw}")))
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (value, unit) = raw.split_at(split_at);
    let value: f64 = value.parse().ok()?;

    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        _ => return None,
    };

    Some(Duration::from_millis(millis.max(0.0) as u64))
}

/// Maps step type tags to their registered executor (spec §4.F analogue for
/// step dispatch, mirroring the mode registry's `GetOrDefault` shape).
#[derive(Clone, Default)]
pub struct StepExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepExecutorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register("wait", Arc::new(WaitExecutor));
        registry
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<Value> {
        let executor = self.get(&step.step_type).ok_or_else(|| {
            EngineError::config(step.id.clone(), format!("no executor registered for step type '{}'", step.step_type))
        })?;
        executor.execute(step, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ErrorPolicy;
    use std::collections::HashMap as StdHashMap;

    fn wait_step(duration: &str) -> Step {
        let mut config = StdHashMap::new();
        config.insert("duration".to_string(), Value::String(duration.to_string()));
        Step {
            id: "w1".to_string(),
            name: "wait".to_string(),
            step_type: "wait".to_string(),
            config,
            timeout_seconds: None,
            error_policy: ErrorPolicy::default(),
            pre_hook: None,
            post_hook: None,
            branches: Vec::new(),
            loop_: None,
            children: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_wait_executor_sleeps_and_returns() {
        let ctx = ExecutionContext::default();
        let executor = WaitExecutor;
        let step = wait_step("5ms");
        let result = executor.execute(&step, &ctx).await.unwrap();
        assert_eq!(result, Value::String("waited 5ms".to_string()));
    }

    #[tokio::test]
    async fn test_wait_executor_missing_duration_fails() {
        let ctx = ExecutionContext::default();
        let executor = WaitExecutor;
        let step = Step {
            config: StdHashMap::new(),
            ..wait_step("1ms")
        };
        let err = executor.execute(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_step_type() {
        let registry = StepExecutorRegistry::new();
        let ctx = ExecutionContext::default();
        let step = wait_step("1ms");
        let result = registry.execute(&step, &ctx).await.unwrap();
        assert_eq!(result, Value::String("waited 1ms".to_string()));
    }

    #[tokio::test]
    async fn test_registry_unknown_type_fails() {
        let registry = StepExecutorRegistry::new();
        let ctx = ExecutionContext::default();
        let mut step = wait_step("1ms");
        step.step_type = "http".to_string();
        let err = registry.execute(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfigError { .. }));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10ms"), Some(Duration::from_millis(10)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_millis(2000)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_millis(60_000)));
        assert_eq!(parse_duration("bogus"), None);
    }
}
