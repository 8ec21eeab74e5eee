// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Fleetbench Core - execution modes, metrics pipeline, and workflow
//! model/resolver for the distributed load-testing engine.
//!
//! This crate provides the core functionality for defining, validating, and
//! executing multi-step workflows with branches, loops, hooks, sub-workflow
//! references, and pluggable virtual-user execution modes.
//!
//! # Example
//!
//! ```rust
//! use fleetbench_core::{Workflow, ExecutionContext};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let yaml = r#"
//! name: "simple-workflow"
//! steps:
//!   - id: "step1"
//!     type: "wait"
//!     config:
//!       duration: "10ms"
//! "#;
//!
//! let workflow = Workflow::from_yaml(yaml)?;
//! workflow.validate(true)?;
//!
//! let mut inputs = std::collections::HashMap::new();
//! inputs.insert("name".to_string(), json!("World"));
//! let ctx = ExecutionContext::new(inputs);
//!
//! let greeting = ctx.render_template("Hello {{ name }}")?;
//! assert_eq!(greeting, "Hello World");
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod health;
pub mod hooks;
pub mod metrics;
pub mod modes;
pub mod resolver;
pub mod retry;
pub mod steps;
pub mod telemetry;
pub mod workflow;

// Re-export commonly used types.
pub use context::ExecutionContext;
pub use error::{EngineError, Result};
pub use hooks::{execute_step_with_hooks, HookExecutor, HookExecutorRegistry, StepOutcome};
pub use resolver::{ReferenceResolver, WorkflowLoader};
pub use retry::{RetryExecutor, RetryPolicy};
pub use steps::{StepExecutor, StepExecutorRegistry};
pub use workflow::{
    Branch, BranchKind, ErrorPolicy, ExecutionOptions, Hook, Loop, LoopMode, SlaveSelector,
    Stage, Step, ThresholdSpec, Workflow, STEP_TYPES,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
