// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Prometheus instrumentation for the execution engine.
//!
//! This is ambient operational telemetry, distinct from the business metrics
//! pipeline in [`crate::metrics`] that feeds the run report.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, Registry, TextEncoder,
};

lazy_static! {
    /// Total workflow executions by status and workflow name.
    pub static ref WORKFLOW_EXECUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "fleetbench_workflow_executions_total",
        "Total number of workflow executions",
        &["status", "workflow_name"]
    )
    .expect("failed to create workflow_executions_total metric");

    /// Workflow execution duration in seconds.
    pub static ref WORKFLOW_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "fleetbench_workflow_duration_seconds",
        "Workflow execution duration in seconds",
        &["workflow_name"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("failed to create workflow_duration_seconds metric");

    /// Number of currently running executions.
    pub static ref ACTIVE_EXECUTIONS: Gauge = register_gauge!(
        "fleetbench_active_executions",
        "Number of currently running workflow executions"
    )
    .expect("failed to create active_executions metric");

    /// Number of currently active virtual users across all executions.
    pub static ref ACTIVE_VUS: Gauge = register_gauge!(
        "fleetbench_active_vus",
        "Number of currently active virtual users"
    )
    .expect("failed to create active_vus metric");

    /// Total step executions by step type and status.
    pub static ref STEP_EXECUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "fleetbench_step_executions_total",
        "Total step executions by type and status",
        &["step_type", "status"]
    )
    .expect("failed to create step_executions_total metric");

    /// Step execution duration in seconds.
    pub static ref STEP_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "fleetbench_step_duration_seconds",
        "Step execution duration in seconds",
        &["step_type"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("failed to create step_duration_seconds metric");

    /// Total errors by error type and component.
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "fleetbench_errors_total",
        "Total errors by type and component",
        &["error_type", "component"]
    )
    .expect("failed to create errors_total metric");
}

/// Records the start of a workflow execution.
#[inline]
pub fn record_workflow_start() {
    ACTIVE_EXECUTIONS.inc();
}

/// Records the completion of a workflow execution.
#[inline]
pub fn record_workflow_complete(workflow_name: &str, duration_seconds: f64, success: bool) {
    ACTIVE_EXECUTIONS.dec();

    let status = if success { "success" } else { "failure" };

    WORKFLOW_EXECUTIONS_TOTAL
        .with_label_values(&[status, workflow_name])
        .inc();

    WORKFLOW_DURATION_SECONDS
        .with_label_values(&[workflow_name])
        .observe(duration_seconds);
}

/// Records a step execution.
#[inline]
pub fn record_step_execution(step_type: &str, duration_seconds: f64, status: &str) {
    STEP_EXECUTIONS_TOTAL
        .with_label_values(&[step_type, status])
        .inc();

    STEP_DURATION_SECONDS
        .with_label_values(&[step_type])
        .observe(duration_seconds);
}

/// Records an error occurrence.
#[inline]
pub fn record_error(error_type: &str, component: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, component])
        .inc();
}

/// Gathers and encodes all metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("failed to encode metrics");

    String::from_utf8(buffer).expect("metrics encoding produced invalid UTF-8")
}

/// Creates a custom Prometheus registry with all engine metrics.
pub fn create_registry() -> Registry {
    let registry = Registry::new();

    registry
        .register(Box::new(WORKFLOW_EXECUTIONS_TOTAL.clone()))
        .expect("failed to register workflow_executions_total");
    registry
        .register(Box::new(WORKFLOW_DURATION_SECONDS.clone()))
        .expect("failed to register workflow_duration_seconds");
    registry
        .register(Box::new(ACTIVE_EXECUTIONS.clone()))
        .expect("failed to register active_executions");
    registry
        .register(Box::new(ACTIVE_VUS.clone()))
        .expect("failed to register active_vus");
    registry
        .register(Box::new(STEP_EXECUTIONS_TOTAL.clone()))
        .expect("failed to register step_executions_total");
    registry
        .register(Box::new(STEP_DURATION_SECONDS.clone()))
        .expect("failed to register step_duration_seconds");
    registry
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("failed to register errors_total");

    registry
}
