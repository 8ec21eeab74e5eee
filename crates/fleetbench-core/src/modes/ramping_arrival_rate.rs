// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `ramping-arrival-rate`: same mechanics as `constant-arrival-rate` with
//! per-stage linear rate interpolation; tracks `CurrentRate` in state (spec
//! §4.E). Stage `target` is interpreted as a ticket rate per `TimeUnit`.

use super::{lerp, BaseMode, ExecutionMode, ModeConfig, ModeState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct RampingArrivalRate {
    base: Arc<BaseMode>,
    dropped_tickets: Arc<AtomicU64>,
}

impl RampingArrivalRate {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BaseMode::new()),
            dropped_tickets: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dropped_tickets(&self) -> u64 {
        self.dropped_tickets.load(Ordering::SeqCst)
    }
}

impl Default for RampingArrivalRate {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker(
    vu_id: u32,
    base: Arc<BaseMode>,
    rx: Arc<Mutex<mpsc::Receiver<u64>>>,
    cfg: &ModeConfig,
) -> JoinHandle<()> {
    let cancel = base.stop_signal.clone();
    let iteration_fn = cfg.iteration_fn.clone();
    let on_start = cfg.on_vu_start.clone();
    let on_stop = cfg.on_vu_stop.clone();
    let on_complete = cfg.on_iteration_complete.clone();

    tokio::spawn(async move {
        if let Some(cb) = &on_start {
            cb(vu_id);
        }
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let next = rx.lock().await.recv().await;
            let Some(index) = next else { break };

            let result = iteration_fn.call(vu_id, index, cancel.clone()).await;
            base.completed_iterations.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = &on_complete {
                cb(vu_id, index, &result);
            }
        }
        if let Some(cb) = &on_stop {
            cb(vu_id);
        }
    })
}

#[async_trait]
impl ExecutionMode for RampingArrivalRate {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        if cfg.stages.is_empty() {
            return Err(EngineError::validation(
                "ramping-arrival-rate requires at least one stage",
            ));
        }

        let pre_allocated = cfg.pre_allocated_vus.unwrap_or(1).max(1);
        let max_vus = cfg.max_vus.unwrap_or(pre_allocated).max(pre_allocated);

        self.base.target_vus.store(pre_allocated, Ordering::SeqCst);
        self.base.mark_started();

        let (tx, rx) = mpsc::channel::<u64>(pre_allocated as usize * 4);
        let rx = Arc::new(Mutex::new(rx));
        let active_vus = Arc::new(AtomicU32::new(pre_allocated));
        let next_index = Arc::new(AtomicU64::new(0));
        let next_vu_id = Arc::new(AtomicU32::new(pre_allocated));

        let mut handles = Vec::new();
        for vu_id in 0..pre_allocated {
            handles.push(spawn_worker(vu_id, self.base.clone(), rx.clone(), &cfg));
        }
        self.base.active_vus.store(pre_allocated, Ordering::SeqCst);

        let mut previous_rate: u64 = 0;

        'stages: for (stage_idx, stage) in cfg.stages.iter().enumerate() {
            self.base.set_stage(Some(stage_idx));
            let stage_duration = Duration::from_millis(stage.duration_ms);
            let stage_start = std::time::Instant::now();
            let target_rate = stage.target as u64;

            loop {
                if self.base.stop_signal.is_cancelled() {
                    break 'stages;
                }
                let elapsed = stage_start.elapsed();
                if elapsed >= stage_duration {
                    break;
                }
                let current_rate = lerp(
                    previous_rate as u32,
                    target_rate as u32,
                    elapsed,
                    stage_duration,
                )
                .max(1) as u64;
                *self.base.current_rate.lock().unwrap() = current_rate as f64;

                let tick = (cfg.time_unit / current_rate as u32).max(Duration::from_millis(1));
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = self.base.stop_signal.cancelled() => break 'stages,
                }

                let index = next_index.fetch_add(1, Ordering::SeqCst);
                match tx.try_send(index) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Full(idx)) => {
                        let grown = active_vus
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                if n < max_vus { Some(n + 1) } else { None }
                            })
                            .is_ok();
                        if grown {
                            let new_vu_id = next_vu_id.fetch_add(1, Ordering::SeqCst);
                            self.base
                                .active_vus
                                .store(active_vus.load(Ordering::SeqCst), Ordering::SeqCst);
                            handles.push(spawn_worker(new_vu_id, self.base.clone(), rx.clone(), &cfg));
                            if tx.try_send(idx).is_err() {
                                self.dropped_tickets.fetch_add(1, Ordering::SeqCst);
                            }
                        } else {
                            self.dropped_tickets.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break 'stages,
                }
            }
            previous_rate = target_rate;
        }

        drop(tx);
        for handle in handles {
            let _ = handle.await;
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
