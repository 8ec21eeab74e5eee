// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Summary builder: per-step and overall report assembly from sinks (spec
//! §4.D).

use super::engine::{Output, TimeSeriesPoint};
use super::sink::{CounterSink, RateSink, Sample, Sink, TrendSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct VuEvent {
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub vus: u32,
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub step_id: String,
    pub message: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub error_rate_percent: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct ErrorAnalysis {
    pub total_errors: u64,
    /// `(error_message, count, percentage)`.
    pub type_distribution: Vec<(String, u64, f64)>,
    pub top_errors: Vec<ErrorEntry>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub execution_id: String,
    pub workflow_id: i64,
    pub name: String,
    pub status: String,
    pub total_iterations: u64,
    pub max_vus: u32,
    pub summary: Stats,
    pub avg_qps: f64,
    pub peak_qps: f64,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    pub throughput_bytes_per_second: f64,
    pub total_duration_ms: u64,
    pub per_step: HashMap<String, Stats>,
    pub vu_timeline: Vec<VuEvent>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub error_analysis: ErrorAnalysis,
    pub threshold_results: Vec<String>,
}

struct StepSinks {
    duration: TrendSink,
    reqs: CounterSink,
    failed: RateSink,
}

impl Default for StepSinks {
    fn default() -> Self {
        Self {
            duration: TrendSink::default(),
            reqs: CounterSink::default(),
            failed: RateSink::default(),
        }
    }
}

/// A second `Output` that buffers samples for the full run, building the
/// final report on demand.
pub struct SummaryBuilder {
    per_step: Mutex<HashMap<String, StepSinks>>,
    vu_timeline: Mutex<Vec<VuEvent>>,
    errors: Mutex<HashMap<(String, String), ErrorEntry>>,
    data_sent: Mutex<u64>,
    data_received: Mutex<u64>,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self {
            per_step: Mutex::new(HashMap::new()),
            vu_timeline: Mutex::new(Vec::new()),
            errors: Mutex::new(HashMap::new()),
            data_sent: Mutex::new(0),
            data_received: Mutex::new(0),
        }
    }

    fn ingest(&self, batch: Vec<Sample>) {
        for sample in batch {
            if sample.metric == "vu_change" {
                self.record_vu_change(&sample);
                continue;
            }
            if sample.metric == "data_sent" {
                *self.data_sent.lock() += sample.value as u64;
                continue;
            }
            if sample.metric == "data_received" {
                *self.data_received.lock() += sample.value as u64;
                continue;
            }
            if let Some(error) = sample.tags.get("error") {
                self.record_error(&sample, error);
                continue;
            }
            self.route_by_prefix(&sample);
        }
    }

    fn record_vu_change(&self, sample: &Sample) {
        let event = VuEvent {
            timestamp: sample.time,
            elapsed_ms: sample
                .tags
                .get("elapsed_ms")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            vus: sample.value as u32,
            source: sample.tags.get("source").cloned().unwrap_or_default(),
            reason: sample.tags.get("reason").cloned().unwrap_or_default(),
        };
        self.vu_timeline.lock().push(event);
    }

    fn record_error(&self, sample: &Sample, message: &str) {
        let step_id = sample.step_id().unwrap_or("").to_string();
        let mut errors = self.errors.lock();
        let entry = errors
            .entry((step_id.clone(), message.to_string()))
            .or_insert_with(|| ErrorEntry {
                step_id,
                message: message.to_string(),
                count: 0,
                first_seen: sample.time,
                last_seen: sample.time,
            });
        entry.count += 1;
        entry.last_seen = sample.time;
    }

    fn route_by_prefix(&self, sample: &Sample) {
        let Some(step_id) = step_id_from_prefixed_metric(&sample.metric) else {
            return;
        };
        let mut per_step = self.per_step.lock();
        let sinks = per_step.entry(step_id).or_default();

        if sample.metric.starts_with("step_duration_") {
            sinks.duration.add(sample);
        } else if sample.metric.starts_with("step_reqs_") {
            sinks.reqs.add(sample);
        } else if sample.metric.starts_with("step_failed_") {
            sinks.failed.add(sample);
        }
    }

    fn stats_for(duration: &TrendSink, reqs: &CounterSink, failed: &RateSink) -> Stats {
        let duration_fmt = duration.format(0.0);
        let reqs_fmt = reqs.format(0.0);
        let failed_fmt = failed.format(0.0);

        let total = reqs_fmt.get("count").copied().unwrap_or(0.0) as u64;
        let failed_count = failed_fmt.get("fails").copied().unwrap_or(0.0) as u64;
        let successful = total.saturating_sub(failed_count);
        let error_rate_percent = failed_fmt.get("rate").copied().unwrap_or(0.0) * 100.0;

        Stats {
            total,
            successful,
            failed: failed_count,
            error_rate_percent,
            avg: duration_fmt.get("avg").copied().unwrap_or(0.0),
            p50: duration_fmt.get("med").copied().unwrap_or(0.0),
            p90: duration_fmt.get("p(90)").copied().unwrap_or(0.0),
            p95: duration_fmt.get("p(95)").copied().unwrap_or(0.0),
            p99: duration_fmt.get("p(99)").copied().unwrap_or(0.0),
            min: duration_fmt.get("min").copied().unwrap_or(0.0),
            max: duration_fmt.get("max").copied().unwrap_or(0.0),
        }
    }

    /// `GenerateReport`: assembles the final report from everything buffered
    /// so far plus caller-supplied run metadata and time series/thresholds
    /// from the metrics engine.
    pub fn generate_report(
        &self,
        execution_id: impl Into<String>,
        workflow_id: i64,
        name: impl Into<String>,
        status: impl Into<String>,
        total_iterations: u64,
        max_vus: u32,
        time_series: Vec<TimeSeriesPoint>,
        threshold_results: Vec<String>,
        total_duration_ms: u64,
    ) -> Report {
        let per_step_sinks = self.per_step.lock();

        let mut per_step = HashMap::new();

        for (step_id, sinks) in per_step_sinks.iter() {
            per_step.insert(
                step_id.clone(),
                Self::stats_for(&sinks.duration, &sinks.reqs, &sinks.failed),
            );
        }

        // Recompute an overall view by replaying each step sink's raw
        // samples is not possible without storing samples twice, so the
        // overall summary is derived by merging per-step formatted stats
        // count-weighted, matching the aggregator's own approximation.
        let (mut total, mut failed_total) = (0u64, 0u64);
        let (mut weighted_sum, mut min, mut max) = (0.0f64, f64::MAX, f64::MIN);
        let (mut weighted_p50, mut weighted_p90, mut weighted_p95, mut weighted_p99) =
            (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for stats in per_step.values() {
            total += stats.total;
            failed_total += stats.failed;
            weighted_sum += stats.avg * stats.total as f64;
            weighted_p50 += stats.p50 * stats.total as f64;
            weighted_p90 += stats.p90 * stats.total as f64;
            weighted_p95 += stats.p95 * stats.total as f64;
            weighted_p99 += stats.p99 * stats.total as f64;
            if stats.total > 0 {
                min = min.min(stats.min);
                max = max.max(stats.max);
            }
        }
        if total == 0 {
            min = 0.0;
            max = 0.0;
        }
        let avg = if total > 0 { weighted_sum / total as f64 } else { 0.0 };
        let error_rate_percent = if total > 0 {
            failed_total as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        // Percentiles are weighted by each step's sample count, matching the
        // aggregator's own approximation, rather than a plain max/mean across
        // steps: a single low-volume step with an outlier should not dominate
        // the whole-run summary.
        let (p50, p90, p95, p99) = if total > 0 {
            (
                weighted_p50 / total as f64,
                weighted_p90 / total as f64,
                weighted_p95 / total as f64,
                weighted_p99 / total as f64,
            )
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };

        let duration_sec = (total_duration_ms as f64 / 1000.0).max(f64::EPSILON);
        let avg_qps = total as f64 / duration_sec;
        let peak_qps = time_series
            .iter()
            .map(|p| p.iterations_per_second)
            .fold(0.0, f64::max);

        let errors = self.errors.lock();
        let total_errors: u64 = errors.values().map(|e| e.count).sum();
        let mut type_distribution: HashMap<String, u64> = HashMap::new();
        for entry in errors.values() {
            *type_distribution.entry(entry.message.clone()).or_insert(0) += entry.count;
        }
        let mut type_distribution: Vec<(String, u64, f64)> = type_distribution
            .into_iter()
            .map(|(msg, count)| {
                let pct = if total_errors > 0 {
                    count as f64 / total_errors as f64 * 100.0
                } else {
                    0.0
                };
                (msg, count, pct)
            })
            .collect();
        type_distribution.sort_by(|a, b| b.1.cmp(&a.1));

        let mut top_errors: Vec<ErrorEntry> = errors.values().cloned().collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count));
        top_errors.truncate(20);

        let data_sent = *self.data_sent.lock();
        let data_received = *self.data_received.lock();
        let throughput_bytes_per_second = (data_sent + data_received) as f64 / duration_sec;

        Report {
            execution_id: execution_id.into(),
            workflow_id,
            name: name.into(),
            status: status.into(),
            total_iterations,
            max_vus,
            summary: Stats {
                total,
                successful: total.saturating_sub(failed_total),
                failed: failed_total,
                error_rate_percent,
                avg,
                p50,
                p90,
                p95,
                p99,
                min,
                max,
            },
            avg_qps,
            peak_qps,
            total_data_sent: data_sent,
            total_data_received: data_received,
            throughput_bytes_per_second,
            total_duration_ms,
            per_step,
            vu_timeline: self.vu_timeline.lock().clone(),
            time_series,
            error_analysis: ErrorAnalysis {
                total_errors,
                type_distribution,
                top_errors,
            },
            threshold_results,
        }
    }
}

impl Default for SummaryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn step_id_from_prefixed_metric(metric: &str) -> Option<String> {
    for prefix in ["step_duration_", "step_reqs_", "step_failed_"] {
        if let Some(rest) = metric.strip_prefix(prefix) {
            return Some(rest.to_string());
        }
    }
    None
}

/// Adapter so the summary builder can sit behind the engine's `Output`
/// contract alongside the ingester, fed via a 100 ms flusher.
pub struct SummaryOutput {
    builder: std::sync::Arc<SummaryBuilder>,
    buffer: super::buffer::SampleBuffer,
    flusher: Mutex<Option<super::buffer::Flusher>>,
}

impl SummaryOutput {
    pub fn new(builder: std::sync::Arc<SummaryBuilder>) -> Self {
        Self {
            builder,
            buffer: super::buffer::SampleBuffer::new(),
            flusher: Mutex::new(None),
        }
    }

    pub async fn stop_async(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            flusher.stop().await;
        }
    }
}

impl Output for SummaryOutput {
    fn start(&self) {
        let builder = self.builder.clone();
        let flusher = super::buffer::Flusher::start(
            self.buffer.clone(),
            std::time::Duration::from_millis(100),
            move |batch| builder.ingest(batch),
        );
        *self.flusher.lock() = Some(flusher);
    }

    fn stop(&self) {
        // see `EngineIngester::stop` — prefer `stop_async`.
    }

    fn set_run_status(&self, _status: &str) {}

    fn add_metric_samples(&self, samples: Vec<Sample>) {
        self.buffer.push_all(samples);
    }

    fn description(&self) -> String {
        "summary builder".to_string()
    }
}
