//! In-memory transport recording everything issued over it.

use core::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    fmt::{self, Debug, Formatter},
    io,
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::Bytes;
use tonic::transport::{Channel, Endpoint};

use super::{Call, CallError, Caller, Connection, Dial, Error};
use crate::stat::StatsTap;

type Handler = dyn Fn(&Call) -> Result<Vec<Bytes>, CallError> + Send + Sync;

/// Counters shared by a [`MockDial`] and everything it creates.
#[derive(Debug, Default)]
pub struct MockStats {
    /// Number of dial attempts.
    pub dials: AtomicUsize,
    /// Number of calls issued over open connections.
    pub issued: AtomicUsize,
    /// Number of calls that ran to completion.
    pub completed: AtomicUsize,
    /// Number of connections closed.
    pub closed: AtomicUsize,
    /// Calls issued per connection, indexed by dial order.
    per_conn: Mutex<Vec<usize>>,
    /// Messages of every issued call.
    payloads: Mutex<Vec<Vec<Bytes>>>,
}

impl MockStats {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn per_conn(&self) -> Vec<usize> {
        self.per_conn.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<Bytes>> {
        self.payloads.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct MockDial {
    stats: Arc<MockStats>,
    latency: Duration,
    /// Dials beyond this number fail.
    fail_after: Option<usize>,
    handler: Option<Arc<Handler>>,
    /// Channel handed out for generated clients.
    channel: Option<Channel>,
}

impl Debug for MockDial {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        fmt.debug_struct("MockDial")
            .field("latency", &self.latency)
            .field("fail_after", &self.fail_after)
            .finish()
    }
}

impl Default for MockDial {
    fn default() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            latency: Duration::ZERO,
            fail_after: None,
            handler: None,
            channel: None,
        }
    }
}

impl MockDial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failing_dial(mut self, after: usize) -> Self {
        self.fail_after = Some(after);
        self
    }

    /// Replaces the default empty successful response.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Call) -> Result<Vec<Bytes>, CallError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    /// Routes generated clients, such as reflection, through the channel.
    ///
    /// Without one they get a lazy channel to a port nobody listens on.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

impl Dial for MockDial {
    type Conn = MockConn;

    async fn dial(&self, tap: Option<Arc<StatsTap>>) -> Result<Self::Conn, Error> {
        let idx = self.stats.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| idx >= n) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        let idx = {
            let mut per_conn = self.stats.per_conn.lock().unwrap();
            per_conn.push(0);
            per_conn.len() - 1
        };

        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => Endpoint::from_static("http://127.0.0.1:9").connect_lazy(),
        };

        let m = MockConn {
            channel,
            caller: MockCaller {
                idx,
                closed: Arc::new(AtomicBool::new(false)),
                stats: self.stats.clone(),
                latency: self.latency,
                handler: self.handler.clone(),
                tap,
            },
        };

        Ok(m)
    }
}

#[derive(Debug)]
pub struct MockConn {
    channel: Channel,
    caller: MockCaller,
}

impl Connection for MockConn {
    type Caller = MockCaller;

    fn caller(&self) -> Self::Caller {
        self.caller.clone()
    }

    fn channel(&self) -> Channel {
        self.channel.clone()
    }

    fn close(&self) {
        if !self.caller.closed.swap(true, Ordering::SeqCst) {
            self.caller.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
pub struct MockCaller {
    idx: usize,
    closed: Arc<AtomicBool>,
    stats: Arc<MockStats>,
    latency: Duration,
    handler: Option<Arc<Handler>>,
    tap: Option<Arc<StatsTap>>,
}

impl Debug for MockCaller {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        fmt.debug_struct("MockCaller").field("idx", &self.idx).finish()
    }
}

impl Caller for MockCaller {
    async fn invoke(&self, call: &Call) -> Result<Vec<Bytes>, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }

        self.stats.issued.fetch_add(1, Ordering::SeqCst);
        self.stats.per_conn.lock().unwrap()[self.idx] += 1;
        self.stats.payloads.lock().unwrap().push(call.messages.clone());

        let now = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let rc = match &self.handler {
            Some(handler) => handler(call),
            None => Ok(vec![Bytes::new()]),
        };

        if let Some(tap) = &self.tap {
            tap.on_complete(rc.as_ref().err().cloned(), now.elapsed()).await;
        }
        self.stats.completed.fetch_add(1, Ordering::SeqCst);

        rc
    }
}
