use core::{future, mem, sync::atomic::AtomicU64, time::Duration};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tokio::{sync::mpsc, task::JoinHandle};

use super::{pool, worker::Shared, Error, MultiError};
use crate::{
    cfg::{LoadSchedule, LoadStrategy, RunConfig, StopPolicy},
    descriptor::{self, MethodDescriptor},
    payload::Payload,
    reporter::{Report, Reporter, StopReason},
    stat::{self, Pipeline, Results, StatsTap},
    transport::{self, Connection, Dial},
};

/// Result of a finished run.
#[derive(Debug)]
pub struct Outcome {
    pub report: Report,
    /// Merged structural worker failures, if any.
    pub errors: Option<MultiError>,
}

/// Connections used for load generation, with their callers and taps.
struct PoolState<T: Connection> {
    conns: Vec<Arc<T>>,
    callers: Vec<T::Caller>,
    taps: Vec<Arc<StatsTap>>,
}

impl<T: Connection> Default for PoolState<T> {
    fn default() -> Self {
        Self {
            conns: Vec::new(),
            callers: Vec::new(),
            taps: Vec::new(),
        }
    }
}

/// Run orchestrator.
pub struct Requester<D: Dial> {
    cfg: Arc<RunConfig>,
    dial: D,
    shared: Shared,
    pool: Mutex<PoolState<D::Conn>>,
    pipeline: Pipeline,
    /// Consumer side of the pipeline, handed to the reporter on run.
    results: Mutex<Option<Results>>,
}

impl<D> Requester<D>
where
    D: Dial,
{
    /// Constructs a new requester, resolving the method descriptor.
    ///
    /// No connection for load generation is opened here.
    pub async fn new(cfg: Arc<RunConfig>, dial: D) -> Result<Self, Error> {
        let method = descriptor::resolve(&cfg, &dial).await?;

        log::debug!(
            "resolved method {} (client streaming: {}, server streaming: {})",
            method.full_name(),
            method.is_client_streaming(),
            method.is_server_streaming()
        );

        Self::with_method(cfg, dial, method)
    }

    /// Constructs a new requester for an already resolved method.
    pub fn with_method(cfg: Arc<RunConfig>, dial: D, method: MethodDescriptor) -> Result<Self, Error> {
        let payload = Payload::new(&cfg.data, cfg.binary, &method)?;
        let (pipeline, results) = stat::pipeline(stat::capacity(cfg.concurrency));

        let shared = Shared {
            method,
            payload: Arc::new(payload),
            metadata: cfg.metadata.clone(),
            timeout: cfg.timeout,
            counter: Arc::new(AtomicU64::new(0)),
        };

        let m = Self {
            cfg,
            dial,
            shared,
            pool: Mutex::new(PoolState::default()),
            pipeline,
            results: Mutex::new(Some(results)),
        };

        Ok(m)
    }

    #[inline]
    fn lock_pool(&self) -> MutexGuard<'_, PoolState<D::Conn>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the connection pool, one instrumented connection per slot.
    ///
    /// Returns the existing pool if it is already open. Either all
    /// connections are dialed or none is kept.
    pub async fn open_client_conns(&self) -> Result<Vec<Arc<D::Conn>>, transport::Error> {
        let n = self.cfg.connections.get();
        {
            let pool = self.lock_pool();
            if pool.conns.len() == n {
                return Ok(pool.conns.clone());
            }
        }

        let mut conns = Vec::with_capacity(n);
        let mut taps = Vec::with_capacity(n);
        for idx in 0..n {
            let tap = Arc::new(self.pipeline.tap(idx));
            match self.dial.dial(Some(tap.clone())).await {
                Ok(conn) => {
                    conns.push(Arc::new(conn));
                    taps.push(tap);
                }
                Err(err) => {
                    log::error!("failed to dial connection {idx} to {}: {err}", self.cfg.host);
                    for conn in &conns {
                        conn.close();
                    }
                    return Err(err);
                }
            }
        }

        let mut pool = self.lock_pool();
        if pool.conns.len() == n {
            // Opened concurrently, keep the pool already in use.
            for conn in &conns {
                conn.close();
            }
            return Ok(pool.conns.clone());
        }

        log::debug!("opened {n} connection(s) to {}", self.cfg.host);

        let callers = conns.iter().map(|conn| conn.caller()).collect();
        *pool = PoolState { conns, callers, taps };

        Ok(pool.conns.clone())
    }

    /// Closes and clears the connection pool.
    ///
    /// A later [`Requester::open_client_conns`] dials a fresh pool.
    pub fn close_client_conns(&self) {
        let pool = mem::take(&mut *self.lock_pool());
        if pool.conns.is_empty() {
            return;
        }

        log::debug!("closing {} connection(s)", pool.conns.len());
        for conn in &pool.conns {
            conn.close();
        }
    }

    fn apply_stop_policy(&self) {
        match self.cfg.stop_policy {
            StopPolicy::Close => self.close_client_conns(),
            StopPolicy::Ignore => {
                for tap in &self.lock_pool().taps {
                    tap.ignore(true);
                }
                self.close_client_conns();
            }
            StopPolicy::Wait => {}
        }
    }

    async fn run_workers(
        &self,
        callers: Vec<<D::Conn as Connection>::Caller>,
        stop: mpsc::Receiver<()>,
    ) -> Result<(), MultiError> {
        match (self.cfg.load_strategy, self.cfg.load_schedule) {
            (LoadStrategy::Concurrency, LoadSchedule::Const) => {
                pool::run_const_concurrency(
                    self.cfg.total,
                    self.cfg.concurrency,
                    self.cfg.name.as_deref(),
                    &callers,
                    &self.shared,
                    Some(stop),
                )
                .await
            }
            (strategy, schedule) => {
                log::warn!("load strategy {strategy:?} with schedule {schedule:?} is not supported, issuing no requests");
                Ok(())
            }
        }
    }

    /// Runs the load and returns the final report.
    ///
    /// Stop requests received from `stop` end the run early, with connections
    /// treated according to the configured stop policy. A requester can be
    /// run only once.
    pub async fn run(&self, stop: mpsc::Receiver<StopReason>) -> Result<Outcome, Error> {
        let results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyRun)?;

        let now = Instant::now();
        self.open_client_conns().await?;
        let callers = self.lock_pool().callers.clone();

        let reporter = tokio::spawn(Reporter::new(results, &self.cfg).run());

        let (pool_stop_tx, pool_stop_rx) = mpsc::channel(1);
        let workers = self.run_workers(callers, pool_stop_rx);
        tokio::pin!(workers);

        let mut reason = StopReason::NormalEnd;
        let mut stop = Some(stop);
        let rc = loop {
            tokio::select! {
                v = recv(&mut stop) => match v {
                    Some(v) => {
                        log::info!("stop requested ({v}), applying '{}' stop policy", self.cfg.stop_policy);
                        reason = v;
                        let _ = pool_stop_tx.try_send(());
                        self.apply_stop_policy();
                    }
                    None => stop = None,
                },
                rc = &mut workers => break rc,
            }
        };

        let elapsed = now.elapsed();
        self.pipeline.close();
        drop(pool_stop_tx);

        let report = self.finish(reporter, reason, elapsed).await?;

        let m = Outcome {
            report,
            errors: rc.err(),
        };

        Ok(m)
    }

    /// Waits for the reporter, finalizes its report and closes the pool.
    ///
    /// The pool is closed even if the reporter task failed.
    async fn finish(
        &self,
        reporter: JoinHandle<Reporter>,
        reason: StopReason,
        elapsed: Duration,
    ) -> Result<Report, Error> {
        log::debug!("waiting for report ...");
        let rc = reporter.await.map(|reporter| {
            log::debug!("finalizing report ...");
            reporter.finalize(reason, elapsed)
        });
        self.close_client_conns();

        Ok(rc?)
    }
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
