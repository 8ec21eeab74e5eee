// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Metrics aggregator (spec §4.I): merges per-slave metrics into a single
//! execution-wide view and evaluates thresholds against it.

use fleetbench_core::metrics::evaluate_expression;
use fleetbench_core::ThresholdSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// A single step's metrics as reported by one slave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveStepMetrics {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub custom: HashMap<String, f64>,
    pub duration: DurationStats,
}

/// One slave's full report for an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveMetrics {
    pub slave_id: String,
    pub total_iterations: u64,
    pub vus: u32,
    pub steps: HashMap<String, SlaveStepMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedStepMetrics {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub custom: HashMap<String, f64>,
    pub duration: DurationStats,
}

impl AggregatedStepMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failure as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub execution_id: String,
    pub total_iterations: u64,
    pub total_vus: u32,
    pub duration_ms: u64,
    pub steps: HashMap<String, AggregatedStepMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub value: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryView {
    pub weighted_avg_duration_ms: f64,
    pub max_p95_ms: f64,
    pub max_p99_ms: f64,
    pub total_count: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub thresholds_passed: usize,
    pub thresholds_failed: usize,
}

/// `Aggregate(executionID, []metrics)`: per-step sums of counts/successes/
/// failures and custom metrics; durations aggregated by global min/max,
/// count-weighted avg, and percentiles estimated by nearest-rank indexing
/// the slaves' own reported percentiles (an acknowledged approximation).
pub fn aggregate(
    execution_id: impl Into<String>,
    duration_ms: u64,
    metrics: &[SlaveMetrics],
) -> AggregatedMetrics {
    let mut steps: HashMap<String, AggregatedStepMetrics> = HashMap::new();
    let mut total_iterations = 0u64;
    let mut total_vus = 0u32;

    // Collects each slave's reported percentile for nearest-rank re-estimation.
    let mut percentile_samples: HashMap<String, PercentileSamples> = HashMap::new();

    for slave in metrics {
        total_iterations += slave.total_iterations;
        total_vus += slave.vus;

        for (step_id, step) in &slave.steps {
            let is_first = !steps.contains_key(step_id);
            let agg = steps.entry(step_id.clone()).or_default();
            let prior_count = agg.count;
            agg.count += step.count;
            agg.success += step.success;
            agg.failure += step.failure;
            for (key, value) in &step.custom {
                *agg.custom.entry(key.clone()).or_insert(0.0) += value;
            }

            let samples = percentile_samples.entry(step_id.clone()).or_default();
            samples.p50.push(step.duration.p50);
            samples.p90.push(step.duration.p90);
            samples.p95.push(step.duration.p95);
            samples.p99.push(step.duration.p99);

            agg.duration.avg = if agg.count > 0 {
                (agg.duration.avg * prior_count as f64 + step.duration.avg * step.count as f64)
                    / agg.count as f64
            } else {
                0.0
            };
            agg.duration.min = if is_first {
                step.duration.min
            } else {
                agg.duration.min.min(step.duration.min)
            };
            agg.duration.max = agg.duration.max.max(step.duration.max);
        }
    }

    for (step_id, agg) in steps.iter_mut() {
        if let Some(samples) = percentile_samples.get(step_id) {
            agg.duration.p50 = nearest_rank(&samples.p50, 50.0);
            agg.duration.p90 = nearest_rank(&samples.p90, 90.0);
            agg.duration.p95 = nearest_rank(&samples.p95, 95.0);
            agg.duration.p99 = nearest_rank(&samples.p99, 99.0);
        }
    }

    AggregatedMetrics {
        execution_id: execution_id.into(),
        total_iterations,
        total_vus,
        duration_ms,
        steps,
    }
}

#[derive(Default)]
struct PercentileSamples {
    p50: Vec<f64>,
    p90: Vec<f64>,
    p95: Vec<f64>,
    p99: Vec<f64>,
}

fn nearest_rank(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

/// Flattens `aggregated` into the dot-notation stats map the threshold
/// expression grammar resolves against: `stepID.metric`,
/// `stepID.duration.<pct>`, globals `total_iterations`/`total_vus`/
/// `duration`, and aggregate convenience keys `avg_duration`/`failure_rate`
/// spanning every step.
fn flatten(aggregated: &AggregatedMetrics) -> HashMap<String, f64> {
    let mut stats = HashMap::new();
    stats.insert("total_iterations".to_string(), aggregated.total_iterations as f64);
    stats.insert("total_vus".to_string(), aggregated.total_vus as f64);
    stats.insert("duration".to_string(), aggregated.duration_ms as f64);

    let mut weighted_duration_sum = 0.0;
    let mut total_count = 0u64;
    let mut total_failure = 0u64;

    for (step_id, step) in &aggregated.steps {
        stats.insert(format!("{step_id}.count"), step.count as f64);
        stats.insert(format!("{step_id}.success"), step.success as f64);
        stats.insert(format!("{step_id}.failure"), step.failure as f64);
        stats.insert(format!("{step_id}.failure_rate"), step.failure_rate());
        stats.insert(format!("{step_id}.duration.avg"), step.duration.avg);
        stats.insert(format!("{step_id}.duration.min"), step.duration.min);
        stats.insert(format!("{step_id}.duration.max"), step.duration.max);
        stats.insert(format!("{step_id}.duration.p50"), step.duration.p50);
        stats.insert(format!("{step_id}.duration.p90"), step.duration.p90);
        stats.insert(format!("{step_id}.duration.p95"), step.duration.p95);
        stats.insert(format!("{step_id}.duration.p99"), step.duration.p99);
        for (key, value) in &step.custom {
            stats.insert(format!("{step_id}.{key}"), *value);
        }

        weighted_duration_sum += step.duration.avg * step.count as f64;
        total_count += step.count;
        total_failure += step.failure;
    }

    stats.insert(
        "avg_duration".to_string(),
        if total_count > 0 { weighted_duration_sum / total_count as f64 } else { 0.0 },
    );
    stats.insert(
        "failure_rate".to_string(),
        if total_count > 0 { total_failure as f64 / total_count as f64 } else { 0.0 },
    );

    stats
}

/// `EvaluateThresholds(aggregated, thresholds)`: resolves each threshold's
/// stat against the flattened metric map and evaluates its condition.
/// An unknown metric is reported as not passed rather than erroring.
pub fn evaluate_thresholds(
    aggregated: &AggregatedMetrics,
    thresholds: &HashMap<String, Vec<ThresholdSpec>>,
) -> Vec<ThresholdResult> {
    let stats = flatten(aggregated);
    let mut results = Vec::new();

    for (metric, specs) in thresholds {
        for spec in specs {
            let passed = evaluate_expression(&stats, &spec.expression).unwrap_or(false);
            let value = stat_name(&spec.expression)
                .and_then(|name| stats.get(&name).copied())
                .unwrap_or(0.0);
            results.push(ThresholdResult {
                metric: metric.clone(),
                expression: spec.expression.clone(),
                value,
                passed,
            });
        }
    }
    results
}

fn stat_name(expression: &str) -> Option<String> {
    let ops: &[&str] = &["<=", ">=", "==", "!=", "<", ">"];
    let op = ops.iter().find(|op| expression.contains(**op))?;
    Some(expression.splitn(2, op).next()?.trim().to_string())
}

/// `GenerateSummary(aggregated)`: weighted avg response time, max p95/p99
/// across steps, success/error rate, and threshold pass/fail tallies.
pub fn generate_summary(
    aggregated: &AggregatedMetrics,
    threshold_results: &[ThresholdResult],
) -> SummaryView {
    let mut total_count = 0u64;
    let mut total_success = 0u64;
    let mut total_failure = 0u64;
    let mut weighted_sum = 0.0;
    let mut max_p95 = 0.0f64;
    let mut max_p99 = 0.0f64;

    for step in aggregated.steps.values() {
        total_count += step.count;
        total_success += step.success;
        total_failure += step.failure;
        weighted_sum += step.duration.avg * step.count as f64;
        max_p95 = max_p95.max(step.duration.p95);
        max_p99 = max_p99.max(step.duration.p99);
    }

    let thresholds_passed = threshold_results.iter().filter(|r| r.passed).count();
    let thresholds_failed = threshold_results.len() - thresholds_passed;

    SummaryView {
        weighted_avg_duration_ms: if total_count > 0 { weighted_sum / total_count as f64 } else { 0.0 },
        max_p95_ms: max_p95,
        max_p99_ms: max_p99,
        total_count,
        success_rate: if total_count > 0 { total_success as f64 / total_count as f64 } else { 0.0 },
        error_rate: if total_count > 0 { total_failure as f64 / total_count as f64 } else { 0.0 },
        thresholds_passed,
        thresholds_failed,
    }
}
