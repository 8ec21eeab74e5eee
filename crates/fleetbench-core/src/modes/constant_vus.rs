// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `constant-vus`: launches a fixed worker pool, each looping the iteration
//! function with a monotonically increasing counter (spec §4.E).

use super::{BaseMode, Cancellation, ExecutionMode, ModeConfig, ModeState};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct ConstantVus {
    base: Arc<BaseMode>,
}

impl ConstantVus {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BaseMode::new()),
        }
    }
}

impl Default for ConstantVus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionMode for ConstantVus {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        let vus = if cfg.vus == 0 { 1 } else { cfg.vus };
        self.base.target_vus.store(vus, Ordering::SeqCst);
        self.base.active_vus.store(vus, Ordering::SeqCst);
        self.base.mark_started();

        let mut handles = Vec::with_capacity(vus as usize);
        for vu_id in 0..vus {
            let base = self.base.clone();
            let cancel = self.base.stop_signal.clone();
            let iteration_fn = cfg.iteration_fn.clone();
            let duration = cfg.duration;
            let iterations = cfg.iterations;
            let on_start = cfg.on_vu_start.clone();
            let on_stop = cfg.on_vu_stop.clone();
            let on_complete = cfg.on_iteration_complete.clone();

            handles.push(tokio::spawn(async move {
                if let Some(cb) = &on_start {
                    cb(vu_id);
                }

                let mut iteration = 0u64;
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Some(dur) = duration {
                        if base.elapsed() >= dur {
                            break;
                        }
                    }
                    if let Some(max) = iterations {
                        if iteration >= max {
                            break;
                        }
                    }

                    let result = iteration_fn.call(vu_id, iteration, cancel.clone()).await;
                    base.completed_iterations.fetch_add(1, Ordering::SeqCst);
                    if let Some(cb) = &on_complete {
                        cb(vu_id, iteration, &result);
                    }
                    iteration += 1;
                }

                if let Some(cb) = &on_stop {
                    cb(vu_id);
                }
            }));
        }

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
