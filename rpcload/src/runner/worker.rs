use core::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use http::HeaderMap;
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::WorkerError;
use crate::{
    descriptor::MethodDescriptor,
    payload::Payload,
    transport::{Call, CallError, Caller},
};

/// State shared by all workers of a run.
#[derive(Debug, Clone)]
pub struct Shared {
    pub method: MethodDescriptor,
    pub payload: Arc<Payload>,
    pub metadata: Arc<HeaderMap>,
    /// Per-call deadline.
    pub timeout: Option<Duration>,
    /// Global request counter.
    pub counter: Arc<AtomicU64>,
}

/// Activity flag and single-shot stop signal of a worker.
#[derive(Debug)]
pub struct WorkerState {
    active: AtomicBool,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerState {
    /// Creates a new active state, returning the stop receiver for the
    /// worker.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let m = Self {
            active: AtomicBool::new(true),
            stop: Mutex::new(Some(tx)),
        };

        (Arc::new(m), rx)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_active(&self, v: bool) {
        self.active.store(v, Ordering::Release);
    }

    /// Marks the worker inactive and signals it to stop.
    ///
    /// Inactive workers are skipped. Returns whether the signal was sent.
    pub fn finish(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }

        match self.sender().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Closes the stop channel without signaling.
    pub fn close(&self) {
        self.sender().take();
    }

    #[inline]
    fn sender(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Issues calls over one connection until told otherwise.
#[derive(Debug)]
pub struct Worker<C> {
    id: String,
    caller: C,
    shared: Shared,
    state: Arc<WorkerState>,
    stop: oneshot::Receiver<()>,
}

impl<C> Worker<C>
where
    C: Caller,
{
    pub fn new(id: String, caller: C, shared: Shared, state: Arc<WorkerState>, stop: oneshot::Receiver<()>) -> Self {
        Self {
            id,
            caller,
            shared,
            state,
            stop,
        }
    }

    /// Runs the call loop.
    ///
    /// Before every call the predicate is asked whether to continue, given
    /// the worker id, the last call error, the number of calls done and the
    /// time elapsed. The loop also ends on a stop signal or once the
    /// connection is closed. Calls in flight are never aborted.
    ///
    /// The global counter is either incremented per call or only read, its
    /// value selects the payload element.
    pub async fn run<F>(mut self, keep_going: F, increment: bool) -> Result<(), WorkerError>
    where
        F: Fn(&str, Option<&CallError>, u64, Duration) -> bool,
    {
        let now = Instant::now();
        let mut done = 0;
        let mut last_err = None;

        let rc = loop {
            if !keep_going(&self.id, last_err.as_ref(), done, now.elapsed()) {
                break Ok(());
            }
            match self.stop.try_recv() {
                Ok(()) => {
                    log::debug!("worker {}: stop requested after {} calls", self.id, done);
                    break Ok(());
                }
                // Closed without a signal means the pool is done with it.
                Err(TryRecvError::Empty | TryRecvError::Closed) => {}
            }

            let k = if increment {
                self.shared.counter.fetch_add(1, Ordering::Relaxed)
            } else {
                self.shared.counter.load(Ordering::Relaxed)
            };

            let method = &self.shared.method;
            let messages = self.shared.payload.messages(k);
            if messages.is_empty() && !method.is_client_streaming() {
                break Err(WorkerError::EmptyPayload { id: self.id.clone() });
            }
            let call = Call {
                path: method.path().clone(),
                messages,
                metadata: self.shared.metadata.clone(),
                timeout: self.shared.timeout,
                client_streaming: method.is_client_streaming(),
                server_streaming: method.is_server_streaming(),
            };

            match self.caller.invoke(&call).await {
                Ok(..) => last_err = None,
                Err(CallError::Closed) => {
                    log::debug!("worker {}: connection closed after {} calls", self.id, done);
                    break Ok(());
                }
                Err(err) => {
                    log::trace!("worker {}: {}", self.id, err);
                    last_err = Some(err);
                }
            }
            done += 1;
        };

        self.state.set_active(false);

        if let Err(err) = &rc {
            log::error!("{err}");
        }

        rc
    }
}
