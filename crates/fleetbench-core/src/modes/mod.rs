// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Execution modes: seven load-profile state machines over an iteration
//! function (spec §4.E), plus the mode registry (spec §4.F).

pub mod constant_arrival_rate;
pub mod constant_vus;
pub mod externally_controlled;
pub mod per_vu_iterations;
pub mod ramping_arrival_rate;
pub mod ramping_vus;
pub mod registry;
pub mod shared_iterations;

pub use registry::ModeRegistry;

use crate::error::Result;
use crate::workflow::Stage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Cooperative cancellation signal shared by a mode and every VU it spawns.
/// Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Cancels at most once; subsequent calls are no-ops.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The user-supplied iteration function `f(ctx, vuID, iteration) -> error`.
#[async_trait]
pub trait IterationFn: Send + Sync {
    async fn call(&self, vu_id: u32, iteration: u64, cancel: Cancellation) -> Result<()>;
}

#[async_trait]
impl<F, Fut> IterationFn for F
where
    F: Fn(u32, u64, Cancellation) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn call(&self, vu_id: u32, iteration: u64, cancel: Cancellation) -> Result<()> {
        (self)(vu_id, iteration, cancel).await
    }
}

pub type VuLifecycleFn = Arc<dyn Fn(u32) + Send + Sync>;
pub type IterationCompleteFn = Arc<dyn Fn(u32, u64, &Result<()>) + Send + Sync>;

/// Parameters common to every mode.
pub struct ModeConfig {
    pub vus: u32,
    pub iterations: Option<u64>,
    pub duration: Option<Duration>,
    pub stages: Vec<Stage>,
    pub rate: Option<u64>,
    pub time_unit: Duration,
    pub pre_allocated_vus: Option<u32>,
    pub max_vus: Option<u32>,
    pub iteration_fn: Arc<dyn IterationFn>,
    pub on_vu_start: Option<VuLifecycleFn>,
    pub on_vu_stop: Option<VuLifecycleFn>,
    pub on_iteration_complete: Option<IterationCompleteFn>,
}

impl ModeConfig {
    pub fn new(iteration_fn: Arc<dyn IterationFn>) -> Self {
        Self {
            vus: 1,
            iterations: None,
            duration: None,
            stages: Vec::new(),
            rate: None,
            time_unit: Duration::from_secs(1),
            pre_allocated_vus: None,
            max_vus: None,
            iteration_fn,
            on_vu_start: None,
            on_vu_stop: None,
            on_iteration_complete: None,
        }
    }
}

/// A snapshot of a mode's `{activeVUs, targetVUs, completedIterations,
/// running, paused, startTime, elapsed, currentRate}` state.
#[derive(Debug, Clone)]
pub struct ModeState {
    pub active_vus: u32,
    pub target_vus: u32,
    pub completed_iterations: u64,
    pub running: bool,
    pub paused: bool,
    pub elapsed: Duration,
    pub current_rate: f64,
    pub current_stage: Option<usize>,
}

/// Error returned when a control operation (scale/pause/resume) is invoked
/// outside `[Run start, Run return)`.
#[derive(Debug, thiserror::Error)]
#[error("mode is not running")]
pub struct ModeNotRunning;

/// `{Run(ctx, cfg), Stop(ctx), GetState()}`.
#[async_trait]
pub trait ExecutionMode: Send + Sync {
    async fn run(&self, cfg: ModeConfig) -> Result<()>;
    async fn stop(&self);
    fn get_state(&self) -> ModeState;

    /// Resizes the active VU pool while running. Only `externally-controlled`
    /// supports this; every other mode's worker count is fixed or entirely
    /// profile-driven, so the default rejects the request.
    async fn scale(&self, _target: u32) -> Result<()> {
        Err(crate::error::EngineError::other(
            "this execution mode does not support dynamic scaling",
        ))
    }
}

/// Shared bookkeeping every mode embeds: active/target VU counts, completed
/// iteration counter, running/paused flags, start time, current rate and
/// stage index, plus a stop signal and a done signal for `WaitDone`.
pub(crate) struct BaseMode {
    pub active_vus: AtomicU32,
    pub target_vus: AtomicU32,
    pub completed_iterations: AtomicU64,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub start_time: std::sync::Mutex<Option<Instant>>,
    pub current_rate: std::sync::Mutex<f64>,
    pub current_stage: AtomicUsize,
    pub stop_signal: Cancellation,
    done_flag: Arc<AtomicBool>,
    done_notify: Arc<Notify>,
}

const NO_STAGE: usize = usize::MAX;

impl BaseMode {
    pub fn new() -> Self {
        Self {
            active_vus: AtomicU32::new(0),
            target_vus: AtomicU32::new(0),
            completed_iterations: AtomicU64::new(0),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            start_time: std::sync::Mutex::new(None),
            current_rate: std::sync::Mutex::new(0.0),
            current_stage: AtomicUsize::new(NO_STAGE),
            stop_signal: Cancellation::new(),
            done_flag: Arc::new(AtomicBool::new(false)),
            done_notify: Arc::new(Notify::new()),
        }
    }

    pub fn mark_started(&self) {
        *self.start_time.lock().unwrap() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn mark_done(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.done_flag.store(true, Ordering::SeqCst);
        self.done_notify.notify_waiters();
    }

    pub async fn wait_done(&self) {
        if self.done_flag.load(Ordering::SeqCst) {
            return;
        }
        self.done_notify.notified().await;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn set_stage(&self, stage: Option<usize>) {
        self.current_stage
            .store(stage.unwrap_or(NO_STAGE), Ordering::SeqCst);
    }

    pub fn state(&self) -> ModeState {
        let stage = self.current_stage.load(Ordering::SeqCst);
        ModeState {
            active_vus: self.active_vus.load(Ordering::SeqCst),
            target_vus: self.target_vus.load(Ordering::SeqCst),
            completed_iterations: self.completed_iterations.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            elapsed: self.elapsed(),
            current_rate: *self.current_rate.lock().unwrap(),
            current_stage: if stage == NO_STAGE { None } else { Some(stage) },
        }
    }
}

/// Interpolates linearly from `from` to `to` over `[0, total]` at `elapsed`.
pub(crate) fn lerp(from: u32, to: u32, elapsed: Duration, total: Duration) -> u32 {
    if total.is_zero() {
        return to;
    }
    let frac = (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0);
    (from as f64 + (to as f64 - from as f64) * frac).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_resolves_immediately_once_cancelled() {
        let c = Cancellation::new();
        c.cancel();
        assert!(c.is_cancelled());
        c.cancelled().await; // must not hang
    }

    #[test]
    fn test_lerp_midpoint() {
        assert_eq!(lerp(0, 10, Duration::from_secs(5), Duration::from_secs(10)), 5);
        assert_eq!(lerp(0, 10, Duration::from_secs(10), Duration::from_secs(10)), 10);
        assert_eq!(lerp(0, 10, Duration::ZERO, Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_base_mode_state_snapshot() {
        let base = BaseMode::new();
        base.mark_started();
        base.active_vus.store(3, Ordering::SeqCst);
        base.target_vus.store(5, Ordering::SeqCst);
        let state = base.state();
        assert_eq!(state.active_vus, 3);
        assert_eq!(state.target_vus, 5);
        assert!(state.running);
    }
}
