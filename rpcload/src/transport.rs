//! RPC transport seam.
//!
//! The runner only needs three capabilities from a transport: dialing a
//! connection, invoking a method with already-encoded messages and reporting
//! call completion to the connection's [`StatsTap`].

use core::{future::Future, time::Duration};
use std::{io, sync::Arc};

use bytes::Bytes;
use http::{uri::PathAndQuery, HeaderMap};
use thiserror::Error;
use tonic::transport::Channel;

pub use self::grpc::{GrpcConn, GrpcDial};
pub use tonic::{Code, Status};
use crate::stat::StatsTap;

pub mod codec;
mod grpc;
#[cfg(test)]
pub mod mock;
#[cfg(test)]
mod rt;
#[cfg(test)]
pub mod server;

/// Errors that may occur while dialing a connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    #[error("timed out connecting to {0} after {1:?}")]
    DialTimeout(String, Duration),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),
}

/// Per-call failure.
///
/// These are never fatal for a run, they end up as ordinary call results.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The connection has been closed, the call was never issued.
    #[error("connection is closed")]
    Closed,
    #[error("rpc error: code = {} desc = {}", label(.0.code()), .0.message())]
    Status(Status),
}

impl CallError {
    #[inline]
    pub fn status<M: Into<String>>(code: Code, message: M) -> Self {
        Self::Status(Status::new(code, message))
    }

    /// Returns the gRPC code this error is reported as.
    pub fn code(&self) -> Code {
        match self {
            Self::Closed => Code::Cancelled,
            Self::Status(status) => status.code(),
        }
    }
}

impl From<Status> for CallError {
    #[inline]
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

/// Returns the canonical label of a status code, as used in reports.
pub fn label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// A single invocation, ready to be sent.
#[derive(Debug, Clone)]
pub struct Call {
    /// Method path, e.g. `/helloworld.Greeter/SayHello`.
    pub path: PathAndQuery,
    /// Encoded request messages. More than one only for client streaming.
    pub messages: Vec<Bytes>,
    /// Outgoing metadata.
    pub metadata: Arc<HeaderMap>,
    /// Per-call deadline.
    pub timeout: Option<Duration>,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// Dials connections to the target.
pub trait Dial: Send + Sync + 'static {
    type Conn: Connection;

    /// Dials a new connection.
    ///
    /// When a tap is given, every call issued over the connection reports its
    /// completion to it. Dials for introspection pass `None`.
    fn dial(&self, tap: Option<Arc<StatsTap>>) -> impl Future<Output = Result<Self::Conn, Error>> + Send;
}

/// An established connection.
pub trait Connection: Send + Sync + 'static {
    type Caller: Caller;

    /// Returns a handle issuing calls over this connection.
    fn caller(&self) -> Self::Caller;

    /// Returns the underlying channel, for generated clients such as
    /// reflection.
    fn channel(&self) -> Channel;

    /// Closes this connection.
    ///
    /// Must be idempotent. Calls issued afterwards fail with
    /// [`CallError::Closed`] without being reported to the tap, while calls in
    /// flight are cancelled.
    fn close(&self);
}

/// Cheaply cloneable handle issuing calls over one connection.
pub trait Caller: Clone + Send + Sync + 'static {
    /// Invokes the method, returning the decoded response messages.
    fn invoke(&self, call: &Call) -> impl Future<Output = Result<Vec<Bytes>, CallError>> + Send;
}
