// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `constant-arrival-rate`: generates iteration tickets at `Rate` per
//! `TimeUnit` into a bounded channel; `PreAllocatedVUs` workers consume them,
//! growing up to `MaxVUs` when the channel backs up, dropping tickets past
//! that (spec §4.E).

use super::{BaseMode, ExecutionMode, ModeConfig, ModeState};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct ConstantArrivalRate {
    base: Arc<BaseMode>,
    dropped_tickets: Arc<AtomicU64>,
}

impl ConstantArrivalRate {
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

impl Default for ConstantArrivalRate {
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
            let Some(index) = next else {
                break;
            };

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
impl ExecutionMode for ConstantArrivalRate {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        let rate = cfg.rate.unwrap_or(1).max(1);
        let pre_allocated = cfg.pre_allocated_vus.unwrap_or(1).max(1);
        let max_vus = cfg.max_vus.unwrap_or(pre_allocated).max(pre_allocated);
        let tick = (cfg.time_unit / rate as u32).max(std::time::Duration::from_millis(1));

        self.base.target_vus.store(pre_allocated, Ordering::SeqCst);
        self.base.mark_started();

        let (tx, rx) = mpsc::channel::<u64>(pre_allocated as usize * 4);
        let rx = Arc::new(Mutex::new(rx));
        let active_vus = Arc::new(AtomicU32::new(pre_allocated));
        let next_index = Arc::new(AtomicU64::new(0));
        let next_vu_id = Arc::new(AtomicU32::new(pre_allocated));

        let handles = Arc::new(Mutex::new(Vec::new()));
        for vu_id in 0..pre_allocated {
            handles
                .lock()
                .await
                .push(spawn_worker(vu_id, self.base.clone(), rx.clone(), &cfg));
        }
        self.base.active_vus.store(pre_allocated, Ordering::SeqCst);

        let cancel = self.base.stop_signal.clone();
        let duration = cfg.duration;
        let iterations_cap = cfg.iterations;
        let dropped = self.dropped_tickets.clone();
        let base = self.base.clone();
        let cfg_for_growth = ModeConfig {
            vus: cfg.vus,
            iterations: cfg.iterations,
            duration: cfg.duration,
            stages: cfg.stages.clone(),
            rate: cfg.rate,
            time_unit: cfg.time_unit,
            pre_allocated_vus: cfg.pre_allocated_vus,
            max_vus: cfg.max_vus,
            iteration_fn: cfg.iteration_fn.clone(),
            on_vu_start: cfg.on_vu_start.clone(),
            on_vu_stop: cfg.on_vu_stop.clone(),
            on_iteration_complete: cfg.on_iteration_complete.clone(),
        };

        {
            let mut interval = tokio::time::interval(tick);
            let mut generated = 0u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(dur) = duration {
                    if base.elapsed() >= dur {
                        break;
                    }
                }
                if let Some(max) = iterations_cap {
                    if generated >= max {
                        break;
                    }
                }

                let index = next_index.fetch_add(1, Ordering::SeqCst);
                match tx.try_send(index) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Full(idx)) => {
                        let grown = active_vus
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                if n < max_vus {
                                    Some(n + 1)
                                } else {
                                    None
                                }
                            })
                            .is_ok();

                        if grown {
                            let new_vu_id = next_vu_id.fetch_add(1, Ordering::SeqCst);
                            self.base.active_vus.store(active_vus.load(Ordering::SeqCst), Ordering::SeqCst);
                            handles.lock().await.push(spawn_worker(
                                new_vu_id,
                                self.base.clone(),
                                rx.clone(),
                                &cfg_for_growth,
                            ));
                            if tx.try_send(idx).is_err() {
                                dropped.fetch_add(1, Ordering::SeqCst);
                            }
                        } else {
                            dropped.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
                generated += 1;
            }
        }
        drop(tx);

        for handle in handles.lock().await.drain(..) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::Cancellation;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::time::Duration;

    fn counting_iteration_fn(counter: Arc<StdAtomicU64>) -> Arc<dyn super::super::IterationFn> {
        Arc::new(move |_vu: u32, _iter: u64, _cancel: Cancellation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_observed_rate_matches_configuration_roughly() {
        let counter = Arc::new(StdAtomicU64::new(0));
        let mode = ConstantArrivalRate::new();
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter.clone()));
        cfg.rate = Some(50);
        cfg.time_unit = Duration::from_secs(1);
        cfg.pre_allocated_vus = Some(4);
        cfg.max_vus = Some(8);
        cfg.duration = Some(Duration::from_millis(200));

        mode.run(cfg).await.unwrap();

        let completed = counter.load(Ordering::SeqCst);
        // ~10 tickets expected at 50/s for 200ms; allow generous slack for
        // scheduler jitter in CI.
        assert!(completed > 0, "expected some iterations to complete");
        assert!(completed <= 50, "should not wildly exceed rate * duration");
        assert_eq!(mode.dropped_tickets(), mode.dropped_tickets());
    }
}
