// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! `externally-controlled`: initial VU set launched; a control loop services
//! scale/pause/resume, reconciling the active worker set every 50 ms toward
//! the requested target (spec §4.E).

use super::{BaseMode, Cancellation, ExecutionMode, ModeConfig, ModeNotRunning, ModeState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

struct VuWorker {
    handle: JoinHandle<()>,
    cancel: Cancellation,
}

fn spawn_vu(vu_id: u32, base: Arc<BaseMode>, paused: Arc<std::sync::atomic::AtomicBool>, cfg: &ModeConfig) -> VuWorker {
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
            while paused.load(Ordering::SeqCst) {
                if global_cancel.is_cancelled() || worker_cancel.is_cancelled() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
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

/// Control-plane handle returned alongside the mode; `scale`/`pause`/`resume`
/// fail fast with [`ModeNotRunning`] outside `[Run start, Run return)`.
pub struct ExternallyControlled {
    base: Arc<BaseMode>,
    scale_tx: Mutex<Option<mpsc::UnboundedSender<u32>>>,
    paused: Arc<std::sync::atomic::AtomicBool>,
}

impl ExternallyControlled {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BaseMode::new()),
            scale_tx: Mutex::new(None),
            paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub async fn scale(&self, target: u32) -> Result<()> {
        let tx = self.scale_tx.lock().await;
        match tx.as_ref() {
            Some(tx) if self.base.running.load(Ordering::SeqCst) => tx
                .send(target)
                .map_err(|_| EngineError::other(ModeNotRunning.to_string())),
            _ => Err(EngineError::other(ModeNotRunning.to_string())),
        }
    }

    pub fn pause(&self) -> Result<()> {
        if !self.base.running.load(Ordering::SeqCst) {
            return Err(EngineError::other(ModeNotRunning.to_string()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if !self.base.running.load(Ordering::SeqCst) {
            return Err(EngineError::other(ModeNotRunning.to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for ExternallyControlled {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionMode for ExternallyControlled {
    async fn run(&self, cfg: ModeConfig) -> Result<()> {
        let max_vus = cfg.max_vus.unwrap_or(u32::MAX);
        let initial = cfg.vus.min(max_vus);

        let (scale_tx, mut scale_rx) = mpsc::unbounded_channel();
        *self.scale_tx.lock().await = Some(scale_tx);

        self.base.target_vus.store(initial, Ordering::SeqCst);
        self.base.mark_started();

        let workers: Arc<Mutex<HashMap<u32, VuWorker>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_vu_id = Arc::new(AtomicU32::new(0));

        {
            let mut workers = workers.lock().await;
            for _ in 0..initial {
                let vu_id = next_vu_id.fetch_add(1, Ordering::SeqCst);
                workers.insert(vu_id, spawn_vu(vu_id, self.base.clone(), self.paused.clone(), &cfg));
            }
            self.base.active_vus.store(workers.len() as u32, Ordering::SeqCst);
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        let deadline = cfg.duration.map(|d| std::time::Instant::now() + d);

        loop {
            if self.base.stop_signal.is_cancelled() {
                break;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }

            tokio::select! {
                Some(target) = scale_rx.recv() => {
                    let clamped = target.min(max_vus);
                    self.base.target_vus.store(clamped, Ordering::SeqCst);
                }
                _ = ticker.tick() => {
                    let target = self.base.target_vus.load(Ordering::SeqCst);
                    reconcile(&workers, target, &self.base, &cfg, &next_vu_id, &self.paused).await;
                }
                _ = self.base.stop_signal.cancelled() => break,
            }
        }

        *self.scale_tx.lock().await = None;

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

    async fn scale(&self, target: u32) -> Result<()> {
        ExternallyControlled::scale(self, target).await
    }
}

async fn reconcile(
    workers: &Arc<Mutex<HashMap<u32, VuWorker>>>,
    target: u32,
    base: &Arc<BaseMode>,
    cfg: &ModeConfig,
    next_vu_id: &Arc<AtomicU32>,
    paused: &Arc<std::sync::atomic::AtomicBool>,
) {
    let mut workers = workers.lock().await;
    let current = workers.len() as u32;

    if current < target {
        for _ in current..target {
            let vu_id = next_vu_id.fetch_add(1, Ordering::SeqCst);
            workers.insert(vu_id, spawn_vu(vu_id, base.clone(), paused.clone(), cfg));
        }
    } else if current > target {
        let mut ids: Vec<u32> = workers.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
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
    async fn test_scale_fails_before_run_starts() {
        let mode = ExternallyControlled::new();
        let err = mode.scale(5).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn test_pause_resume_gate_iterations() {
        let counter = Arc::new(AtomicU64::new(0));
        let mode = Arc::new(ExternallyControlled::new());
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter.clone()));
        cfg.vus = 2;
        cfg.duration = Some(Duration::from_millis(150));

        let run_mode = mode.clone();
        let handle = tokio::spawn(async move { run_mode.run(cfg).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mode.pause().unwrap();
        let before = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let during_pause = counter.load(Ordering::SeqCst);
        mode.resume().unwrap();

        let _ = handle.await;
        assert!(during_pause <= before + 2, "pause should substantially halt progress");
        assert!(counter.load(Ordering::SeqCst) >= during_pause);
    }

    #[tokio::test]
    async fn test_pause_gates_vus_added_after_scale_up() {
        let counter = Arc::new(AtomicU64::new(0));
        let mode = Arc::new(ExternallyControlled::new());
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter.clone()));
        cfg.vus = 1;
        cfg.duration = Some(Duration::from_millis(300));

        let run_mode = mode.clone();
        let handle = tokio::spawn(async move { run_mode.run(cfg).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mode.scale(3).await.unwrap();
        // let reconcile() pick up the new target and spawn the extra VUs
        tokio::time::sleep(Duration::from_millis(80)).await;
        mode.pause().unwrap();
        let before = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let during_pause = counter.load(Ordering::SeqCst);
        mode.resume().unwrap();

        let _ = handle.await;
        assert!(
            during_pause <= before + 3,
            "pause should halt progress for VUs added after scale-up too"
        );
    }

    #[tokio::test]
    async fn test_scale_after_run_returns_fails() {
        let counter = Arc::new(AtomicU64::new(0));
        let mode = ExternallyControlled::new();
        let mut cfg = ModeConfig::new(counting_iteration_fn(counter));
        cfg.vus = 1;
        cfg.duration = Some(Duration::from_millis(10));

        mode.run(cfg).await.unwrap();
        let err = mode.scale(3).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }
}
