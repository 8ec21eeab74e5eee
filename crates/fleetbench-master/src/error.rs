// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Master-local error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MasterError>;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("scheduling error: {0}")]
    SchedulingError(String),

    #[error("unknown slave id: {0}")]
    UnknownSlave(String),

    #[error("slave id already registered: {0}")]
    DuplicateSlave(String),

    #[error("invalid slave: {0}")]
    InvalidSlave(String),

    #[error("no suitable slaves available")]
    NoSuitableSlaves,

    #[error("master is not started")]
    NotStarted,

    #[error("master is already started")]
    AlreadyStarted,

    #[error("maximum concurrent executions reached ({0})")]
    MaxConcurrentExecutions(usize),

    #[error("unknown execution id: {0}")]
    UnknownExecution(String),

    #[error("invalid execution state transition: {0}")]
    InvalidTransition(String),

    #[error("invalid scale target: {0}")]
    InvalidScaleTarget(i64),

    #[error("execution {0} does not support dynamic scaling")]
    ScalingUnsupported(String),
}
