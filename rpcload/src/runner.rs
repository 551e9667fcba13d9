//! Run orchestration.
//!
//! The [`Requester`] resolves the method, opens the connection pool, runs the
//! workers and the reporter concurrently, and arbitrates between external
//! stop requests and natural completion.

use core::fmt::{self, Display, Formatter};

use thiserror::Error;
use tokio::task::JoinError;

pub use self::{
    requester::{Outcome, Requester},
    worker::{Shared, Worker, WorkerState},
};
use crate::{descriptor, payload, transport};

mod pool;
mod requester;
mod worker;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to resolve method descriptor: {0}")]
    Descriptor(#[from] descriptor::Error),
    #[error("failed to prepare payload: {0}")]
    Payload(#[from] payload::Error),
    #[error("failed to open connections: {0}")]
    Dial(#[from] transport::Error),
    #[error("reporter task failed: {0}")]
    Reporter(#[from] JoinError),
    #[error("requester has already been run")]
    AlreadyRun,
    #[error("{0}")]
    Workers(#[from] MultiError),
}

/// Structural failure of a worker's call loop.
///
/// Individual call failures are never reported this way.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {id}: payload has no messages to send")]
    EmptyPayload { id: String },
    #[error("worker task failed: {0}")]
    Panicked(String),
}

/// Aggregation of worker failures.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<WorkerError>,
}

impl MultiError {
    /// Merges two optional aggregates into one.
    ///
    /// Never overwrites, the result holds the errors of both in order.
    pub fn append(lhs: Option<Self>, rhs: Option<Self>) -> Option<Self> {
        match (lhs, rhs) {
            (Some(mut lhs), Some(rhs)) => {
                lhs.errors.extend(rhs.errors);
                Some(lhs)
            }
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        }
    }

    #[inline]
    pub fn errors(&self) -> &[WorkerError] {
        &self.errors
    }
}

impl From<WorkerError> for MultiError {
    fn from(err: WorkerError) -> Self {
        Self { errors: vec![err] }
    }
}

impl Display for MultiError {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        for (idx, err) in self.errors.iter().enumerate() {
            if idx > 0 {
                fmt.write_str("; ")?;
            }
            write!(fmt, "{err}")?;
        }

        Ok(())
    }
}

impl core::error::Error for MultiError {}
