// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Sample buffer & flusher (spec §4.B).

use super::sink::Sample;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Producers append samples here via a single push operation that never
/// blocks for longer than the mutex's uncontended path; a periodic flusher
/// drains the buffer on a fixed cadence.
#[derive(Clone, Default)]
pub struct SampleBuffer {
    inner: Arc<Mutex<Vec<Sample>>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: Sample) {
        self.inner.lock().push(sample);
    }

    pub fn push_all(&self, samples: impl IntoIterator<Item = Sample>) {
        self.inner.lock().extend(samples);
    }

    /// Drains and returns every sample currently buffered.
    pub fn drain(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// Drives a [`SampleBuffer`] drain on a fixed cadence, invoking `callback`
/// with each drained batch. On `stop`, guarantees one final drain before
/// returning.
pub struct Flusher {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn start<F>(buffer: SampleBuffer, cadence: Duration, mut callback: F) -> Self
    where
        F: FnMut(Vec<Sample>) + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let stopped_task = stopped.clone();
        let notify_task = notify.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let batch = buffer.drain();
                        if !batch.is_empty() {
                            callback(batch);
                        }
                    }
                    _ = notify_task.notified() => {
                        let batch = buffer.drain();
                        if !batch.is_empty() {
                            callback(batch);
                        }
                        break;
                    }
                }
                if stopped_task.load(Ordering::SeqCst) {
                    let batch = buffer.drain();
                    if !batch.is_empty() {
                        callback(batch);
                    }
                    break;
                }
            }
        });

        Self {
            stopped,
            notify,
            handle: Some(handle),
        }
    }

    /// Signals the flusher to perform one final drain and stop.
    pub async fn stop(mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_push_and_drain() {
        let buffer = SampleBuffer::new();
        buffer.push(Sample::new("a", 1.0));
        buffer.push(Sample::new("b", 2.0));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(buffer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_flusher_drains_on_interval_and_stop() {
        let buffer = SampleBuffer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();

        let flusher = Flusher::start(buffer.clone(), Duration::from_millis(10), move |batch| {
            seen_cb.fetch_add(batch.len(), Ordering::SeqCst);
        });

        buffer.push(Sample::new("x", 1.0));
        tokio::time::sleep(Duration::from_millis(30)).await;

        buffer.push(Sample::new("y", 1.0));
        flusher.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
