// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Slave registry, scheduler, metrics aggregator, and workflow master
//! lifecycle (spec §4.G-J).
//!
//! ```no_run
//! # use fleetbench_master::{LocalDispatcher, MasterOptions, WorkflowMaster};
//! # use std::sync::Arc;
//! # async fn run() {
//! let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
//! master.start().await.unwrap();
//! # }
//! ```

pub mod aggregator;
pub mod error;
pub mod master;
pub mod scheduler;
pub mod slave_registry;

pub use aggregator::{
    AggregatedMetrics, AggregatedStepMetrics, DurationStats, SlaveMetrics, SlaveStepMetrics,
    SummaryView, ThresholdResult,
};
pub use error::{MasterError, Result};
pub use master::{
    ExecutionSnapshot, ExecutionState, ExecutionStatus, LocalDispatcher, MasterLifecycle,
    MasterOptions, SlaveDispatcher, SlaveSubState, WorkflowMaster,
};
pub use scheduler::{ExecutionSegment, SchedulePlan};
pub use slave_registry::{SlaveEvent, SlaveFilter, SlaveInfo, SlaveRegistry, SlaveState, WatchHandle};
