// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Maps an execution mode name to a factory producing a fresh
//! [`ExecutionMode`] instance (spec §4.F). An empty name defaults to
//! `constant-vus`.

use super::constant_arrival_rate::ConstantArrivalRate;
use super::constant_vus::ConstantVus;
use super::externally_controlled::ExternallyControlled;
use super::per_vu_iterations::PerVuIterations;
use super::ramping_arrival_rate::RampingArrivalRate;
use super::ramping_vus::RampingVus;
use super::shared_iterations::SharedIterations;
use super::ExecutionMode;
use crate::error::{EngineError, Result};
use std::collections::HashMap;

const DEFAULT_MODE: &str = "constant-vus";

type Factory = Box<dyn Fn() -> Box<dyn ExecutionMode> + Send + Sync>;

/// Name-keyed factory registry; `get_or_default("")` resolves to `constant-vus`.
pub struct ModeRegistry {
    factories: HashMap<String, Factory>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        let mut factories: HashMap<String, Factory> = HashMap::new();
        factories.insert("constant-vus".to_string(), Box::new(|| Box::new(ConstantVus::new()) as Box<dyn ExecutionMode>));
        factories.insert("ramping-vus".to_string(), Box::new(|| Box::new(RampingVus::new()) as Box<dyn ExecutionMode>));
        factories.insert(
            "constant-arrival-rate".to_string(),
            Box::new(|| Box::new(ConstantArrivalRate::new()) as Box<dyn ExecutionMode>),
        );
        factories.insert(
            "ramping-arrival-rate".to_string(),
            Box::new(|| Box::new(RampingArrivalRate::new()) as Box<dyn ExecutionMode>),
        );
        factories.insert(
            "per-vu-iterations".to_string(),
            Box::new(|| Box::new(PerVuIterations::new()) as Box<dyn ExecutionMode>),
        );
        factories.insert(
            "shared-iterations".to_string(),
            Box::new(|| Box::new(SharedIterations::new()) as Box<dyn ExecutionMode>),
        );
        factories.insert(
            "externally-controlled".to_string(),
            Box::new(|| Box::new(ExternallyControlled::new()) as Box<dyn ExecutionMode>),
        );
        Self { factories }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Factory) {
        self.factories.insert(name.into(), factory);
    }

    /// Resolves `name`, substituting [`DEFAULT_MODE`] when `name` is empty.
    pub fn get_or_default(&self, name: &str) -> Result<Box<dyn ExecutionMode>> {
        let resolved = if name.is_empty() { DEFAULT_MODE } else { name };
        self.factories
            .get(resolved)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::validation(format!("unknown execution mode '{resolved}'")))
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
