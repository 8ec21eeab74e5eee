// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Fleetbench SDK: a single facade crate for embedding the workflow engine
//! and its master in another Rust program, without depending on
//! `fleetbench-core` and `fleetbench-master` separately.

pub use fleetbench_core::*;
pub use fleetbench_master::{
    AggregatedMetrics, AggregatedStepMetrics, DurationStats, ExecutionSnapshot, ExecutionState,
    ExecutionStatus, LocalDispatcher, MasterLifecycle, MasterOptions, SlaveDispatcher, SlaveEvent,
    SlaveFilter, SlaveInfo, SlaveMetrics, SlaveRegistry, SlaveState, SlaveStepMetrics,
    SlaveSubState, SummaryView, ThresholdResult, WatchHandle, WorkflowMaster,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
