// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `shared-iterations`: a pre-populated, immediately-closed channel of
//! iteration indices consumed by a fixed worker pool (spec §4.E). Total
//! completed iterations = `Iterations`.

use super::{BaseMode, ExecutionMode, ModeConfig, ModeState};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct SharedIterations {
    base: Arc<BaseMode>,
}

impl SharedIterations {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BaseMode::new()),
        }
    }
}

impl Default for SharedIterations {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionMode for SharedIterations {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        let vus = if cfg.vus == 0 { 1 } else { cfg.vus };
        let total = cfg.iterations.unwrap_or(1);
        self.base.target_vus.store(vus, Ordering::SeqCst);
        self.base.active_vus.store(vus, Ordering::SeqCst);
        self.base.mark_started();

        let (tx, rx) = mpsc::unbounded_channel::<u64>();
        for index in 0..total {
            let _ = tx.send(index);
        }
        drop(tx); // closed immediately: no producer will add more work.

        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(vus as usize);
        for vu_id in 0..vus {
            let base = self.base.clone();
            let cancel = self.base.stop_signal.clone();
            let iteration_fn = cfg.iteration_fn.clone();
            let on_start = cfg.on_vu_start.clone();
            let on_stop = cfg.on_vu_stop.clone();
            let on_complete = cfg.on_iteration_complete.clone();
            let rx = rx.clone();

            handles.push(tokio::spawn(async move {
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

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::Cancellation;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    fn counting_iteration_fn(
        counter: Arc<AtomicU64>,
        per_vu: Arc<StdMutex<std::collections::HashMap<u32, u64>>>,
    ) -> Arc<dyn super::super::IterationFn> {
        Arc::new(move |vu: u32, _iter: u64, _cancel: Cancellation| {
            let counter = counter.clone();
            let per_vu = per_vu.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                *per_vu.lock().unwrap().entry(vu).or_insert(0) += 1;
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_total_completed_equals_iterations() {
        let counter = Arc::new(AtomicU64::new(0));
        let per_vu = Arc::new(StdMutex::new(std::collections::HashMap::new()));
        let mode = SharedIterations::new();
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter.clone(), per_vu.clone()));
        cfg.vus = 4;
        cfg.iterations = Some(25);

        mode.run(cfg).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 25);
        assert_eq!(mode.get_state().completed_iterations, 25);
    }
}
