// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Hook runner: pre/post hook execution around a step or a whole workflow
//! (spec §4.N).

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::steps::StepExecutorRegistry;
use crate::workflow::{Hook, Step};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Executes a hook's config, producing an opaque result value.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn execute(&self, hook: &Hook, ctx: &ExecutionContext) -> Result<Value>;
}

/// Maps hook type tags to their registered executor.
#[derive(Clone, Default)]
pub struct HookExecutorRegistry {
    executors: HashMap<String, Arc<dyn HookExecutor>>,
}

impl HookExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, hook_type: impl Into<String>, executor: Arc<dyn HookExecutor>) {
        self.executors.insert(hook_type.into(), executor);
    }

    async fn run(&self, hook: &Hook, ctx: &ExecutionContext) -> Result<Value> {
        let executor = self.executors.get(&hook.hook_type).ok_or_else(|| {
            EngineError::HookError {
                scope: hook.hook_type.clone(),
                reason: format!("no executor registered for hook type '{}'", hook.hook_type),
            }
        })?;
        executor.execute(hook, ctx).await
    }
}

/// Outcome of running a step through its pre/post hooks.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success(Value),
    Failed(String),
    /// The pre-hook failed, so the step itself never ran.
    Skipped,
}

/// `ExecuteStepWithHooks` (spec §4.N): runs the pre-hook, then the step
/// (unless the pre-hook failed), then always the post-hook, injecting
/// `__step_result`/`__step_error` into the context for the post-hook to see.
/// Post-hook failure is logged but never propagated into the step's outcome.
pub async fn execute_step_with_hooks(
    step: &Step,
    ctx: &ExecutionContext,
    step_executors: &StepExecutorRegistry,
    hook_executors: &HookExecutorRegistry,
) -> StepOutcome {
    if let Some(pre_hook) = &step.pre_hook {
        if let Err(e) = hook_executors.run(pre_hook, ctx).await {
            run_post_hook(step, ctx, hook_executors, None, Some(&e.to_string())).await;
            return StepOutcome::Skipped;
        }
    }

    let outcome = match step_executors.execute(step, ctx).await {
        Ok(value) => StepOutcome::Success(value),
        Err(e) => StepOutcome::Failed(e.to_string()),
    };

    let (result, error) = match &outcome {
        StepOutcome::Success(v) => (Some(v.clone()), None),
        StepOutcome::Failed(e) => (None, Some(e.as_str())),
        StepOutcome::Skipped => (None, None),
    };
    run_post_hook(step, ctx, hook_executors, result, error).await;

    outcome
}

async fn run_post_hook(
    step: &Step,
    ctx: &ExecutionContext,
    hook_executors: &HookExecutorRegistry,
    result: Option<Value>,
    error: Option<&str>,
) {
    ctx.set_step_hook_vars(result, error.map(str::to_string));
    if let Some(post_hook) = &step.post_hook {
        if let Err(e) = hook_executors.run(post_hook, ctx).await {
            warn!(step_id = %step.id, error = %e, "post-hook failed");
        }
    }
}

/// Workflow-level analogue of [`execute_step_with_hooks`]: runs a workflow's
/// pre-hook before the caller proceeds with the run, and its post-hook after,
/// injecting `__workflow_error` instead of `__step_result`/`__step_error`.
pub async fn execute_workflow_pre_hook(
    hook: Option<&Hook>,
    ctx: &ExecutionContext,
    hook_executors: &HookExecutorRegistry,
) -> Result<()> {
    if let Some(hook) = hook {
        hook_executors.run(hook, ctx).await?;
    }
    Ok(())
}

pub async fn execute_workflow_post_hook(
    hook: Option<&Hook>,
    ctx: &ExecutionContext,
    hook_executors: &HookExecutorRegistry,
    workflow_error: Option<String>,
) {
    ctx.set_workflow_error(workflow_error);
    if let Some(hook) = hook {
        if let Err(e) = hook_executors.run(hook, ctx).await {
            warn!(error = %e, "workflow post-hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ErrorPolicy;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingHook {
        ran: Arc<AtomicBool>,
        fail: bool,
    }

    #[async_trait]
    impl HookExecutor for RecordingHook {
        async fn execute(&self, _hook: &Hook, _ctx: &ExecutionContext) -> Result<Value> {
            self.ran.store(true, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::other("hook failed"))
            } else {
                Ok(Value::Null)
            }
        }
    }

    fn step_with_hooks(pre_fails: bool, post_ran: Arc<AtomicBool>) -> (Step, HookExecutorRegistry) {
        let mut registry = HookExecutorRegistry::new();
        registry.register(
            "pre",
            Arc::new(RecordingHook {
                ran: Arc::new(AtomicBool::new(false)),
                fail: pre_fails,
            }),
        );
        registry.register(
            "post",
            Arc::new(RecordingHook {
                ran: post_ran,
                fail: false,
            }),
        );

        let mut config = StdHashMap::new();
        config.insert("duration".to_string(), Value::String("1ms".to_string()));

        let step = Step {
            id: "s1".to_string(),
            name: "wait".to_string(),
            step_type: "wait".to_string(),
            config,
            timeout_seconds: None,
            error_policy: ErrorPolicy::default(),
            pre_hook: Some(Hook {
                hook_type: "pre".to_string(),
                config: StdHashMap::new(),
            }),
            post_hook: Some(Hook {
                hook_type: "post".to_string(),
                config: StdHashMap::new(),
            }),
            branches: Vec::new(),
            loop_: None,
            children: Vec::new(),
        };
        (step, registry)
    }

    #[tokio::test]
    async fn test_post_hook_always_runs_on_success() {
        let post_ran = Arc::new(AtomicBool::new(false));
        let (step, hooks) = step_with_hooks(false, post_ran.clone());
        let steps = StepExecutorRegistry::new();
        let ctx = ExecutionContext::default();

        let outcome = execute_step_with_hooks(&step, &ctx, &steps, &hooks).await;
        assert!(matches!(outcome, StepOutcome::Success(_)));
        assert!(post_ran.load(Ordering::SeqCst));
        assert_eq!(ctx.get_metadata("__step_error"), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_pre_hook_failure_skips_step_but_runs_post_hook() {
        let post_ran = Arc::new(AtomicBool::new(false));
        let (step, hooks) = step_with_hooks(true, post_ran.clone());
        let steps = StepExecutorRegistry::new();
        let ctx = ExecutionContext::default();

        let outcome = execute_step_with_hooks(&step, &ctx, &steps, &hooks).await;
        assert!(matches!(outcome, StepOutcome::Skipped));
        assert!(post_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_workflow_hooks_inject_error_var() {
        let mut registry = HookExecutorRegistry::new();
        registry.register(
            "post",
            Arc::new(RecordingHook {
                ran: Arc::new(AtomicBool::new(false)),
                fail: false,
            }),
        );
        let ctx = ExecutionContext::default();
        let post_hook = Hook {
            hook_type: "post".to_string(),
            config: StdHashMap::new(),
        };
        execute_workflow_post_hook(Some(&post_hook), &ctx, &registry, Some("boom".to_string())).await;
        assert_eq!(ctx.get_metadata("__workflow_error"), Some(Value::String("boom".to_string())));
    }
}
