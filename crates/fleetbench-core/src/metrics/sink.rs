// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Metric sinks: Trend/Counter/Rate/Gauge accumulators with percentile
//! estimation (spec §4.A).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A single metric observation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub time: DateTime<Utc>,
    pub tags: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            time: Utc::now(),
            tags: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn step_id(&self) -> Option<&str> {
        self.tags.get("step_id").map(String::as_str)
    }
}

/// Kind of metric a sink accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Trend,
    Rate,
}

/// Nearest-rank percentile: `index = ceil(pct * n) - 1`, clamped to `[0, n)`.
fn nearest_rank(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let idx = ((pct * n as f64).ceil() as i64 - 1).clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

/// Common sink behavior. Sinks are not internally synchronized; the caller
/// (the metrics engine) holds the write lock.
pub trait Sink: Send + Sync {
    fn add(&mut self, sample: &Sample);
    fn is_empty(&self) -> bool;
    fn format(&self, duration_sec: f64) -> HashMap<String, f64>;
    fn metric_type(&self) -> MetricType;
}

#[derive(Debug, Clone, Default)]
pub struct CounterSink {
    count: f64,
    first_observed: Option<DateTime<Utc>>,
}

impl Sink for CounterSink {
    fn add(&mut self, sample: &Sample) {
        self.count += sample.value;
        if self.first_observed.is_none() {
            self.first_observed = Some(sample.time);
        }
    }

    fn is_empty(&self) -> bool {
        self.first_observed.is_none()
    }

    fn format(&self, duration_sec: f64) -> HashMap<String, f64> {
        let rate = if duration_sec > 0.0 {
            self.count / duration_sec
        } else {
            0.0
        };
        HashMap::from([("count".to_string(), self.count), ("rate".to_string(), rate)])
    }

    fn metric_type(&self) -> MetricType {
        MetricType::Counter
    }
}

#[derive(Debug, Clone)]
pub struct GaugeSink {
    value: f64,
    min: f64,
    max: f64,
    has_value: bool,
}

impl Default for GaugeSink {
    fn default() -> Self {
        Self {
            value: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            has_value: false,
        }
    }
}

impl Sink for GaugeSink {
    fn add(&mut self, sample: &Sample) {
        self.value = sample.value;
        self.min = self.min.min(sample.value);
        self.max = self.max.max(sample.value);
        self.has_value = true;
    }

    fn is_empty(&self) -> bool {
        !self.has_value
    }

    fn format(&self, _duration_sec: f64) -> HashMap<String, f64> {
        if !self.has_value {
            return HashMap::from([
                ("value".to_string(), 0.0),
                ("min".to_string(), 0.0),
                ("max".to_string(), 0.0),
            ]);
        }
        HashMap::from([
            ("value".to_string(), self.value),
            ("min".to_string(), self.min),
            ("max".to_string(), self.max),
        ])
    }

    fn metric_type(&self) -> MetricType {
        MetricType::Gauge
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrendSink {
    samples: Vec<f64>,
    min: f64,
    max: f64,
    sum: f64,
}

impl Sink for TrendSink {
    fn add(&mut self, sample: &Sample) {
        if self.samples.is_empty() {
            self.min = sample.value;
            self.max = sample.value;
        } else {
            self.min = self.min.min(sample.value);
            self.max = self.max.max(sample.value);
        }
        self.sum += sample.value;
        self.samples.push(sample.value);
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn format(&self, _duration_sec: f64) -> HashMap<String, f64> {
        let count = self.samples.len();
        if count == 0 {
            return HashMap::from([
                ("avg".to_string(), 0.0),
                ("min".to_string(), 0.0),
                ("max".to_string(), 0.0),
                ("med".to_string(), 0.0),
                ("p(90)".to_string(), 0.0),
                ("p(95)".to_string(), 0.0),
                ("p(99)".to_string(), 0.0),
                ("count".to_string(), 0.0),
            ]);
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        HashMap::from([
            ("avg".to_string(), self.sum / count as f64),
            ("min".to_string(), self.min),
            ("max".to_string(), self.max),
            ("med".to_string(), nearest_rank(&sorted, 0.5)),
            ("p(90)".to_string(), nearest_rank(&sorted, 0.90)),
            ("p(95)".to_string(), nearest_rank(&sorted, 0.95)),
            ("p(99)".to_string(), nearest_rank(&sorted, 0.99)),
            ("count".to_string(), count as f64),
        ])
    }

    fn metric_type(&self) -> MetricType {
        MetricType::Trend
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateSink {
    passes: u64,
    fails: u64,
}

impl Sink for RateSink {
    fn add(&mut self, sample: &Sample) {
        if sample.value != 0.0 {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.passes == 0 && self.fails == 0
    }

    fn format(&self, _duration_sec: f64) -> HashMap<String, f64> {
        let total = self.passes + self.fails;
        let rate = if total > 0 {
            self.passes as f64 / total as f64
        } else {
            0.0
        };
        HashMap::from([
            ("rate".to_string(), rate),
            ("passes".to_string(), self.passes as f64),
            ("fails".to_string(), self.fails as f64),
        ])
    }

    fn metric_type(&self) -> MetricType {
        MetricType::Rate
    }
}

/// Constructs a fresh sink for a metric type.
pub fn new_sink(metric_type: MetricType) -> Box<dyn Sink> {
    match metric_type {
        MetricType::Counter => Box::new(CounterSink::default()),
        MetricType::Gauge => Box::new(GaugeSink::default()),
        MetricType::Trend => Box::new(TrendSink::default()),
        MetricType::Rate => Box::new(RateSink::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sink() {
        let mut sink = CounterSink::default();
        assert!(sink.is_empty());
        sink.add(&Sample::new("reqs", 1.0));
        sink.add(&Sample::new("reqs", 1.0));
        let formatted = sink.format(2.0);
        assert_eq!(formatted["count"], 2.0);
        assert_eq!(formatted["rate"], 1.0);
    }

    #[test]
    fn test_gauge_sink_tracks_min_max() {
        let mut sink = GaugeSink::default();
        sink.add(&Sample::new("vus", 5.0));
        sink.add(&Sample::new("vus", 10.0));
        sink.add(&Sample::new("vus", 3.0));
        let formatted = sink.format(0.0);
        assert_eq!(formatted["value"], 3.0);
        assert_eq!(formatted["min"], 3.0);
        assert_eq!(formatted["max"], 10.0);
    }

    #[test]
    fn test_trend_sink_percentiles() {
        let mut sink = TrendSink::default();
        for v in 1..=100 {
            sink.add(&Sample::new("duration", v as f64));
        }
        let formatted = sink.format(0.0);
        assert_eq!(formatted["count"], 100.0);
        assert_eq!(formatted["min"], 1.0);
        assert_eq!(formatted["max"], 100.0);
        assert_eq!(formatted["p(90)"], 90.0);
        assert_eq!(formatted["p(95)"], 95.0);
        assert_eq!(formatted["p(99)"], 99.0);
    }

    #[test]
    fn test_rate_sink() {
        let mut sink = RateSink::default();
        sink.add(&Sample::new("failed", 0.0));
        sink.add(&Sample::new("failed", 0.0));
        sink.add(&Sample::new("failed", 1.0));
        let formatted = sink.format(0.0);
        assert_eq!(formatted["passes"], 1.0);
        assert_eq!(formatted["fails"], 2.0);
        assert!((formatted["rate"] - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_rank_clamped_on_single_sample() {
        let mut sink = TrendSink::default();
        sink.add(&Sample::new("x", 42.0));
        let formatted = sink.format(0.0);
        assert_eq!(formatted["p(99)"], 42.0);
    }
}
