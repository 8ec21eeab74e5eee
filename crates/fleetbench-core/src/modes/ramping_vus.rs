// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `ramping-vus`: linearly interpolates a target VU count across stages,
//! adjusting the active worker set on a 50 ms tick (spec §4.E).

use super::{lerp, BaseMode, Cancellation, ExecutionMode, ModeConfig, ModeState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct RampingVus {
    base: Arc<BaseMode>,
}

impl RampingVus {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BaseMode::new()),
        }
    }
}

impl Default for RampingVus {
    fn default() -> Self {
        Self::new()
    }
}

struct VuWorker {
    handle: JoinHandle<()>,
    cancel: Cancellation,
}

fn spawn_vu(vu_id: u32, base: Arc<BaseMode>, cfg: &ModeConfig) -> VuWorker {
    let global_cancel = base.stop_signal.clone();
    let own_cancel = Cancellation::new();
    let iteration_fn = cfg.iteration_fn.clone();
    let on_start = cfg.on_vu_start.clone();
    let on_stop = cfg.on_vu_stop.clone();
    let on_complete = cfg.on_iteration_complete.clone();
    let worker_cancel = own_cancel.clone();

    let handle = tokio::spawn(async move {
        if let Some(cb) = &on_start {
            cb(vu_id);
        }

        let mut iteration = 0u64;
        loop {
            if global_cancel.is_cancelled() || worker_cancel.is_cancelled() {
                break;
            }
            let result = iteration_fn.call(vu_id, iteration, global_cancel.clone()).await;
            base.completed_iterations.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = &on_complete {
                cb(vu_id, iteration, &result);
            }
            iteration += 1;
        }

        if let Some(cb) = &on_stop {
            cb(vu_id);
        }
    });

    VuWorker {
        handle,
        cancel: own_cancel,
    }
}

#[async_trait]
impl ExecutionMode for RampingVus {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        if cfg.stages.is_empty() {
            return Err(EngineError::validation("ramping-vus requires at least one stage"));
        }

        self.base.mark_started();
        let workers: Arc<Mutex<HashMap<u32, VuWorker>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_vu_id = Arc::new(AtomicU32::new(0));

        let mut previous_target: u32 = 0;

        for (stage_idx, stage) in cfg.stages.iter().enumerate() {
            self.base.set_stage(Some(stage_idx));
            let stage_duration = Duration::from_millis(stage.duration_ms);
            let stage_start = std::time::Instant::now();
            let mut interval = tokio::time::interval(Duration::from_millis(50));

            loop {
                if self.base.stop_signal.is_cancelled() {
                    break;
                }
                let elapsed = stage_start.elapsed();
                let at_end = elapsed >= stage_duration;
                let target = if at_end {
                    stage.target
                } else {
                    lerp(previous_target, stage.target, elapsed, stage_duration)
                };
                self.base.target_vus.store(target, Ordering::SeqCst);
                reconcile(&workers, target, &self.base, &cfg, &next_vu_id).await;

                if at_end {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.base.stop_signal.cancelled() => break,
                }
            }

            previous_target = stage.target;
            if self.base.stop_signal.is_cancelled() {
                break;
            }
        }

        // After the last stage (or on cancellation), cancel and join every VU.
        let mut workers = workers.lock().await;
        for worker in workers.values() {
            worker.cancel.cancel();
        }
        for (_, worker) in workers.drain() {
            let _ = worker.handle.await;
        }

        self.base.active_vus.store(0, Ordering::SeqCst);
        self.base.mark_done();
        Ok(())
    }

    async fn stop(&self) {
        self.base.stop_signal.cancel();
        self.base.wait_done().await;
    }

    fn get_state(&self) -> ModeState {
        self.base.state()
    }
}

async fn reconcile(
    workers: &Arc<Mutex<HashMap<u32, VuWorker>>>,
    target: u32,
    base: &Arc<BaseMode>,
    cfg: &ModeConfig,
    next_vu_id: &Arc<AtomicU32>,
) {
    let mut workers = workers.lock().await;
    let current = workers.len() as u32;

    if current < target {
        for _ in current..target {
            let vu_id = next_vu_id.fetch_add(1, Ordering::SeqCst);
            workers.insert(vu_id, spawn_vu(vu_id, base.clone(), cfg));
        }
    } else if current > target {
        let mut ids: Vec<u32> = workers.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a)); // cancel highest ids first
        for id in ids.into_iter().take((current - target) as usize) {
            if let Some(worker) = workers.remove(&id) {
                worker.cancel.cancel();
                let _ = worker.handle.await;
            }
        }
    }

    base.active_vus.store(workers.len() as u32, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Stage;
    use std::sync::atomic::AtomicU64;

    fn counting_iteration_fn(counter: Arc<AtomicU64>) -> Arc<dyn super::super::IterationFn> {
        Arc::new(move |_vu: u32, _iter: u64, _cancel: Cancellation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_requires_at_least_one_stage() {
        let counter = Arc::new(AtomicU64::new(0));
        let mode = RampingVus::new();
        let cfg = ModeConfig::new(counting_iteration_fn(counter));
        let err = mode.run(cfg).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_ramps_to_target_and_completes() {
        let counter = Arc::new(AtomicU64::new(0));
        let mode = RampingVus::new();
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter.clone()));
        cfg.stages = vec![
            Stage { duration_ms: 60, target: 3 },
            Stage { duration_ms: 60, target: 0 },
        ];

        mode.run(cfg).await.unwrap();

        assert_eq!(mode.get_state().active_vus, 0);
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}
