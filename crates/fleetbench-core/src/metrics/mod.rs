// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Business metrics pipeline: sample ingestion, per-step aggregation,
//! threshold evaluation, time-series snapshotting, and report assembly
//! (spec §4.A-D). Distinct from the ambient Prometheus instrumentation in
//! [`crate::telemetry`].

pub mod buffer;
pub mod engine;
pub mod sink;
pub mod summary;

pub use buffer::{Flusher, SampleBuffer};
pub use engine::{
    evaluate_expression, EngineIngester, MetricsEngine, Output, ThresholdFinalizer, TimeSeriesHandle,
    TimeSeriesPoint,
};
pub use sink::{CounterSink, GaugeSink, MetricType, RateSink, Sample, Sink, TrendSink};
pub use summary::{ErrorAnalysis, ErrorEntry, Report, Stats, SummaryBuilder, SummaryOutput, VuEvent};
