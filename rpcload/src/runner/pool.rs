use core::future;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{
    worker::{Shared, Worker, WorkerState},
    MultiError, WorkerError,
};
use crate::transport::Caller;

/// Runs `concurrency` workers, each issuing `total / concurrency` calls.
///
/// The remainder of the division is never issued. Worker `i` is bound to
/// caller `i % callers.len()`.
///
/// Every stop request received marks all active workers inactive and signals
/// each of them exactly once. Returns once all workers have exited, with the
/// merged structural errors of all of them.
pub async fn run_const_concurrency<C>(
    total: u64,
    concurrency: usize,
    name: Option<&str>,
    callers: &[C],
    shared: &Shared,
    mut stop: Option<mpsc::Receiver<()>>,
) -> Result<(), MultiError>
where
    C: Caller,
{
    if concurrency == 0 || callers.is_empty() {
        return Ok(());
    }

    let quota = total / concurrency as u64;
    let remainder = total % concurrency as u64;
    if remainder > 0 && total != u64::MAX {
        log::debug!("{remainder} request(s) do not divide among {concurrency} workers and are not issued");
    }
    let mut states = Vec::with_capacity(concurrency);
    let mut handles = Vec::with_capacity(concurrency);

    for idx in 0..concurrency {
        let conn = idx % callers.len();
        let id = match name {
            Some(name) => format!("{name}:g{idx}c{conn}"),
            None => format!("g{idx}c{conn}"),
        };

        log::debug!("creating worker {id} with {quota} requests");

        let (state, rx) = WorkerState::new();
        let worker = Worker::new(id, callers[conn].clone(), shared.clone(), state.clone(), rx);

        states.push(state);
        handles.push(tokio::spawn(worker.run(move |_, _, done, _| done < quota, true)));
    }

    let mut done = tokio::spawn(async move {
        let mut errors = None;
        for handle in handles {
            let err = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => WorkerError::Panicked(err.to_string()),
            };
            errors = MultiError::append(errors, Some(err.into()));
        }

        errors
    });

    let errors = loop {
        tokio::select! {
            v = recv(&mut stop) => match v {
                Some(()) => finish_workers(&states),
                None => stop = None,
            },
            rc = &mut done => {
                break rc.unwrap_or_else(|err| Some(WorkerError::Panicked(err.to_string()).into()));
            }
        }
    };

    // All signals have been sent by now.
    for state in &states {
        state.close();
    }

    match errors {
        Some(errors) => Err(errors),
        None => Ok(()),
    }
}

fn finish_workers(states: &[Arc<WorkerState>]) {
    let n = states.iter().filter(|state| state.finish()).count();

    log::debug!("signaled {n} active worker(s) to stop");
}

async fn recv(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
