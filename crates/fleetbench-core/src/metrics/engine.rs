// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Metrics engine: observed metrics, threshold loop, time-series snapshots
//! (spec §4.C).

use super::buffer::{Flusher, SampleBuffer};
use super::sink::{new_sink, MetricType, Sample, Sink};
use crate::workflow::ThresholdSpec;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// The `{Start, Stop, SetRunStatus, AddMetricSamples, Description}` contract
/// used by step executors to emit samples.
pub trait Output: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn set_run_status(&self, status: &str);
    fn add_metric_samples(&self, samples: Vec<Sample>);
    fn description(&self) -> String;
}

/// One entry in the rolling time-series list collected every second.
#[derive(Debug, Clone)]
pub struct TimeSeriesPoint {
    pub elapsed_ms: u64,
    pub iterations: u64,
    pub active_vus: u32,
    pub iterations_per_second: f64,
    pub error_rate: f64,
    pub duration_p90: f64,
    pub duration_p95: f64,
    pub duration_p99: f64,
    pub data_sent_per_second: f64,
    pub data_received_per_second: f64,
}

fn infer_metric_type(name: &str) -> MetricType {
    if name.ends_with("_duration") || name.contains("_duration_") {
        MetricType::Trend
    } else if name.ends_with("_failed") {
        MetricType::Rate
    } else if name == "vus" || name.ends_with("_gauge") {
        MetricType::Gauge
    } else {
        MetricType::Counter
    }
}

/// Owns `ObservedMetrics`, a step-id → step-name directory, and the rolling
/// time-series list.
pub struct MetricsEngine {
    observed: Mutex<HashMap<String, Box<dyn Sink>>>,
    step_names: Mutex<HashMap<String, String>>,
    time_series: Mutex<Vec<TimeSeriesPoint>>,
    thresholds: Mutex<HashMap<String, Vec<ThresholdSpec>>>,
    start_time: std::time::Instant,
}

impl MetricsEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observed: Mutex::new(HashMap::new()),
            step_names: Mutex::new(HashMap::new()),
            time_series: Mutex::new(Vec::new()),
            thresholds: Mutex::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn register_step_name(&self, step_id: impl Into<String>, step_name: impl Into<String>) {
        self.step_names.lock().insert(step_id.into(), step_name.into());
    }

    fn ingest(&self, batch: Vec<Sample>) {
        let mut observed = self.observed.lock();
        for sample in &batch {
            let sink = observed
                .entry(sample.metric.clone())
                .or_insert_with(|| new_sink(infer_metric_type(&sample.metric)));
            sink.add(sample);
        }
    }

    fn format(&self, metric: &str) -> Option<HashMap<String, f64>> {
        let observed = self.observed.lock();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        observed.get(metric).map(|s| s.format(elapsed))
    }

    /// `InitThresholds`: unknown metric names log a warning and are ignored
    /// at evaluation time, not at registration.
    pub fn init_thresholds(&self, thresholds: HashMap<String, Vec<ThresholdSpec>>) {
        *self.thresholds.lock() = thresholds;
    }

    /// Returns an ingester `Output` that drains its buffer into this engine
    /// every 50 ms.
    pub fn create_ingester(self: &Arc<Self>) -> EngineIngester {
        EngineIngester::new(self.clone())
    }

    /// `StartThresholdCalculations`: launches a task that every 2s evaluates
    /// each threshold and invokes `abort_run` on a breach with `abort_on_fail`
    /// set. Returns a finalizer that stops the ingester, stops the evaluator,
    /// performs one final evaluation, and returns breached metric names.
    pub fn start_threshold_calculations(
        self: &Arc<Self>,
        ingester: EngineIngester,
        abort_run: impl Fn() + Send + Sync + 'static,
    ) -> ThresholdFinalizer {
        let engine = self.clone();
        let stop = Arc::new(Notify::new());
        let stop_task = stop.clone();
        let abort_run = Arc::new(abort_run);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let breached = engine.evaluate_thresholds();
                        if breached.iter().any(|(_, abort)| *abort) {
                            abort_run();
                        }
                    }
                    _ = stop_task.notified() => break,
                }
            }
        });

        ThresholdFinalizer {
            engine: self.clone(),
            ingester,
            stop,
            handle: Some(handle),
        }
    }

    /// Returns `(breached_metric_name, abort_on_fail)` pairs for every
    /// threshold whose expression currently fails.
    fn evaluate_thresholds(&self) -> Vec<(String, bool)> {
        let thresholds = self.thresholds.lock();
        let mut breached = Vec::new();
        for (metric, specs) in thresholds.iter() {
            let formatted = self.format(metric);
            for spec in specs {
                let passed = match &formatted {
                    Some(stats) => evaluate_expression(stats, &spec.expression).unwrap_or(true),
                    None => true,
                };
                if !passed {
                    breached.push((metric.clone(), spec.abort_on_fail));
                }
            }
        }
        breached
    }

    /// `StartTimeSeriesCollection`: every second, captures a snapshot.
    pub fn start_time_series_collection(
        self: &Arc<Self>,
        get_vus: impl Fn() -> u32 + Send + Sync + 'static,
        get_iterations: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> TimeSeriesHandle {
        let engine = self.clone();
        let stop = Arc::new(Notify::new());
        let stop_task = stop.clone();
        let last_iterations = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let iterations = get_iterations();
                        let prev = last_iterations.swap(iterations, Ordering::SeqCst);
                        let delta = iterations.saturating_sub(prev);

                        let error_rate = engine
                            .format("step_failed")
                            .map(|s| s.get("rate").copied().unwrap_or(0.0))
                            .unwrap_or(0.0);

                        let duration_stats = engine.format("step_duration").unwrap_or_default();

                        let point = TimeSeriesPoint {
                            elapsed_ms: engine.start_time.elapsed().as_millis() as u64,
                            iterations,
                            active_vus: get_vus(),
                            iterations_per_second: delta as f64,
                            error_rate,
                            duration_p90: duration_stats.get("p(90)").copied().unwrap_or(0.0),
                            duration_p95: duration_stats.get("p(95)").copied().unwrap_or(0.0),
                            duration_p99: duration_stats.get("p(99)").copied().unwrap_or(0.0),
                            data_sent_per_second: 0.0,
                            data_received_per_second: 0.0,
                        };
                        engine.time_series.lock().push(point);
                    }
                    _ = stop_task.notified() => break,
                }
            }
        });

        TimeSeriesHandle {
            stop,
            handle: Some(handle),
        }
    }

    pub fn time_series(&self) -> Vec<TimeSeriesPoint> {
        self.time_series.lock().clone()
    }

    pub fn format_metric(&self, metric: &str) -> Option<HashMap<String, f64>> {
        self.format(metric)
    }

    pub fn all_metric_names(&self) -> Vec<String> {
        self.observed.lock().keys().cloned().collect()
    }
}

/// Threshold expression grammar: `<stat> <op> <number>`.
pub fn evaluate_expression(stats: &HashMap<String, f64>, expression: &str) -> Option<bool> {
    let ops: &[&str] = &["<=", ">=", "==", "!=", "<", ">"];
    let op = ops.iter().find(|op| expression.contains(**op))?;
    let mut parts = expression.splitn(2, op);
    let stat = parts.next()?.trim();
    let threshold: f64 = parts.next()?.trim().parse().ok()?;
    let value = *stats.get(stat)?;

    Some(match *op {
        "<" => value < threshold,
        "<=" => value <= threshold,
        ">" => value > threshold,
        ">=" => value >= threshold,
        "==" => (value - threshold).abs() < f64::EPSILON,
        "!=" => (value - threshold).abs() >= f64::EPSILON,
        _ => unreachable!(),
    })
}

/// Output implementation backed directly by a `SampleBuffer` flushed into the
/// owning engine every 50 ms.
pub struct EngineIngester {
    engine: Arc<MetricsEngine>,
    buffer: SampleBuffer,
    flusher: Mutex<Option<Flusher>>,
    running: Arc<AtomicBool>,
}

impl EngineIngester {
    fn new(engine: Arc<MetricsEngine>) -> Self {
        Self {
            engine,
            buffer: SampleBuffer::new(),
            flusher: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops the underlying flusher, guaranteeing a final drain.
    pub async fn stop_async(&self) {
        self.running.store(false, Ordering::SeqCst);
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            flusher.stop().await;
        }
    }
}

impl Output for EngineIngester {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.engine.clone();
        let flusher = Flusher::start(self.buffer.clone(), Duration::from_millis(50), move |batch| {
            engine.ingest(batch);
        });
        *self.flusher.lock() = Some(flusher);
    }

    fn stop(&self) {
        // Synchronous callers cannot await the final drain; prefer
        // `stop_async` where possible. Marks the ingester stopped so a
        // subsequent `start` is a no-op until recreated.
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_run_status(&self, status: &str) {
        if status == "aborted" || status == "failed" || status == "completed" {
            warn!(status, "ingester observed terminal run status");
        }
    }

    fn add_metric_samples(&self, samples: Vec<Sample>) {
        self.buffer.push_all(samples);
    }

    fn description(&self) -> String {
        "metrics engine ingester".to_string()
    }
}

/// Returned by [`MetricsEngine::start_threshold_calculations`].
pub struct ThresholdFinalizer {
    engine: Arc<MetricsEngine>,
    ingester: EngineIngester,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ThresholdFinalizer {
    /// Stops the ingester, stops the evaluator, performs one final
    /// evaluation, and returns the breached metric names (sorted).
    pub async fn finalize(mut self) -> Vec<String> {
        self.ingester.stop_async().await;
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        let mut breached: Vec<String> = self
            .engine
            .evaluate_thresholds()
            .into_iter()
            .map(|(metric, _)| metric)
            .collect();
        breached.sort();
        breached.dedup();
        breached
    }
}

/// Returned by [`MetricsEngine::start_time_series_collection`].
pub struct TimeSeriesHandle {
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl TimeSeriesHandle {
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[tokio::test]
    async fn test_ingester_aggregates_samples() {
        let engine = MetricsEngine::new();
        let ingester = engine.create_ingester();
        ingester.start();

        ingester.add_metric_samples(vec![Sample::new("reqs_total", 1.0), Sample::new("reqs_total", 1.0)]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        ingester.stop_async().await;

        let formatted = engine.format_metric("reqs_total").unwrap();
        assert_eq!(formatted["count"], 2.0);
    }

    #[test]
    fn test_evaluate_expression() {
        let stats = HashMap::from([("avg".to_string(), 120.0)]);
        assert_eq!(evaluate_expression(&stats, "avg < 200"), Some(true));
        assert_eq!(evaluate_expression(&stats, "avg > 200"), Some(false));
        assert_eq!(evaluate_expression(&stats, "p(95) < 200"), None);
    }

    #[tokio::test]
    async fn test_threshold_abort_invoked_on_breach() {
        let engine = MetricsEngine::new();
        let ingester = engine.create_ingester();
        ingester.start();
        ingester.add_metric_samples(vec![Sample::new("errors_rate", 1.0)]);
        tokio::time::sleep(Duration::from_millis(80)).await;

        engine.init_thresholds(HashMap::from([(
            "errors_rate".to_string(),
            vec![ThresholdSpec {
                expression: "rate < 0.5".to_string(),
                abort_on_fail: true,
            }],
        )]));

        let aborted = Arc::new(StdAtomicBool::new(false));
        let aborted_cb = aborted.clone();
        let finalizer = engine.start_threshold_calculations(ingester, move || {
            aborted_cb.store(true, Ordering::SeqCst);
        });

        let breached = finalizer.finalize().await;
        assert_eq!(breached, vec!["errors_rate".to_string()]);
    }

    #[test]
    fn test_unknown_metric_threshold_passes_by_default() {
        let engine_arc = MetricsEngine::new();
        engine_arc.init_thresholds(HashMap::from([(
            "nonexistent".to_string(),
            vec![ThresholdSpec {
                expression: "avg < 100".to_string(),
                abort_on_fail: true,
            }],
        )]));
        let breached = engine_arc.evaluate_thresholds();
        assert!(breached.is_empty());
    }
}
