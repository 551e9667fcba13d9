//! Call results and the bounded pipeline carrying them to the reporter.

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use tokio::sync::{mpsc, oneshot};

use crate::transport::{CallError, Code};

/// Maximum capacity of the result pipeline.
pub const MAX_RESULTS: usize = 1_000_000;

/// Returns the result pipeline capacity for the given concurrency.
#[inline]
pub fn capacity(concurrency: usize) -> usize {
    concurrency.saturating_mul(1000).min(MAX_RESULTS)
}

/// Outcome of one completed call.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub error: Option<CallError>,
    pub status: Code,
    pub duration: Duration,
    pub timestamp: SystemTime,
}

/// Creates a new result pipeline with the given capacity.
pub fn pipeline(capacity: usize) -> (Pipeline, Results) {
    // Zero concurrency still needs a valid channel, nothing is ever sent.
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = oneshot::channel();

    let pipeline = Pipeline {
        tx,
        close: Mutex::new(Some(close_tx)),
    };
    let results = Results {
        rx,
        close: close_rx,
        closing: false,
    };

    (pipeline, results)
}

/// Producer side of the result pipeline.
#[derive(Debug)]
pub struct Pipeline {
    tx: mpsc::Sender<CallResult>,
    close: Mutex<Option<oneshot::Sender<()>>>,
}

impl Pipeline {
    /// Creates a new tap feeding this pipeline.
    #[inline]
    pub fn tap(&self, id: usize) -> StatsTap {
        StatsTap::new(id, self.tx.clone())
    }

    /// Closes this pipeline.
    ///
    /// Results already buffered are still delivered, everything sent
    /// afterwards is dropped. Idempotent.
    pub fn close(&self) {
        let close = self.close.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(close) = close {
            let _ = close.send(());
        }
    }
}

/// Consumer side of the result pipeline.
#[derive(Debug)]
pub struct Results {
    rx: mpsc::Receiver<CallResult>,
    close: oneshot::Receiver<()>,
    /// Whether the close signal has been observed.
    closing: bool,
}

impl Results {
    /// Receives the next result.
    ///
    /// Returns `None` once the pipeline has been closed and drained.
    pub async fn recv(&mut self) -> Option<CallResult> {
        if !self.closing {
            tokio::select! {
                biased;

                v = self.rx.recv() => return v,
                _ = &mut self.close => {
                    self.closing = true;
                    self.rx.close();
                }
            }
        }

        self.rx.recv().await
    }
}

/// Per-connection instrumentation hook.
///
/// Converts call completions into [`CallResult`]s and pushes them into the
/// pipeline, blocking the calling task while the pipeline is full.
#[derive(Debug)]
pub struct StatsTap {
    id: usize,
    results: mpsc::Sender<CallResult>,
    /// Whether results should be dropped instead of recorded.
    ignore: AtomicBool,
}

impl StatsTap {
    pub fn new(id: usize, results: mpsc::Sender<CallResult>) -> Self {
        Self {
            id,
            results,
            ignore: AtomicBool::new(false),
        }
    }

    /// Toggles dropping of results.
    ///
    /// Calls still run to completion, their outcomes are just not recorded.
    #[inline]
    pub fn ignore(&self, v: bool) {
        self.ignore.store(v, Ordering::Release);
    }

    #[inline]
    pub fn is_ignoring(&self) -> bool {
        self.ignore.load(Ordering::Acquire)
    }

    /// Records a completed call.
    pub async fn on_complete(&self, error: Option<CallError>, duration: Duration) {
        if self.is_ignoring() {
            return;
        }

        let status = error.as_ref().map(CallError::code).unwrap_or(Code::Ok);
        let result = CallResult {
            error,
            status,
            duration,
            timestamp: SystemTime::now(),
        };

        if self.results.send(result).await.is_err() {
            log::trace!("tap {}: result pipeline is closed, dropping result", self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capacity() {
        assert_eq!(0, capacity(0));
        assert_eq!(1000, capacity(1));
        assert_eq!(50_000, capacity(50));
        assert_eq!(1_000_000, capacity(1000));
        assert_eq!(1_000_000, capacity(5000));
        assert_eq!(1_000_000, capacity(usize::MAX));
    }

    #[tokio::test]
    async fn test_tap_records_results() {
        let (pipeline, mut results) = pipeline(4);
        let tap = pipeline.tap(0);

        tap.on_complete(None, Duration::from_millis(3)).await;
        tap.on_complete(Some(CallError::status(Code::NotFound, "nope")), Duration::from_millis(5))
            .await;

        let r = results.recv().await.unwrap();
        assert!(r.error.is_none());
        assert_eq!(Code::Ok, r.status);
        assert_eq!(Duration::from_millis(3), r.duration);

        let r = results.recv().await.unwrap();
        assert!(r.error.is_some());
        assert_eq!(Code::NotFound, r.status);
    }

    #[tokio::test]
    async fn test_tap_ignore() {
        let (pipeline, mut results) = pipeline(4);
        let tap = pipeline.tap(0);

        tap.ignore(true);
        tap.on_complete(None, Duration::from_millis(1)).await;
        tap.ignore(false);
        tap.on_complete(None, Duration::from_millis(2)).await;

        pipeline.close();
        let r = results.recv().await.unwrap();
        assert_eq!(Duration::from_millis(2), r.duration);
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_drains_buffered_results() {
        let (pipeline, mut results) = pipeline(8);
        let tap = pipeline.tap(3);

        for _ in 0..3 {
            tap.on_complete(None, Duration::ZERO).await;
        }
        pipeline.close();
        pipeline.close();

        let mut n = 0;
        while results.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(3, n);

        // Results sent after close are dropped without blocking.
        tap.on_complete(None, Duration::ZERO).await;
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_backpressure() {
        let (pipeline, mut results) = pipeline(1);
        let tap = std::sync::Arc::new(pipeline.tap(0));

        tap.on_complete(None, Duration::ZERO).await;

        let blocked = {
            let tap = tap.clone();
            tokio::spawn(async move { tap.on_complete(None, Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        results.recv().await.unwrap();
        blocked.await.unwrap();
        results.recv().await.unwrap();
    }
}
