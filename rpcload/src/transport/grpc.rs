use core::time::Duration;
use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use http::{uri::Authority, Uri};
use tokio::sync::watch;
use tonic::{
    client::Grpc,
    codec::Streaming,
    metadata::MetadataMap,
    transport::{Channel, ClientTlsConfig, Endpoint},
    Request, Status,
};

use super::{codec::RawCodec, Call, CallError, Caller, Code, Connection, Dial, Error};
use crate::{
    cfg::{RunConfig, SecurityMode},
    stat::StatsTap,
};

/// gRPC over HTTP/2 dialer, cleartext or TLS.
#[derive(Debug, Clone)]
pub struct GrpcDial {
    /// Target endpoint in `host:port` form.
    host: String,
    /// Value for the `:authority` pseudo-header, also the TLS server name.
    authority: Authority,
    security: SecurityMode,
    dial_timeout: Duration,
    /// HTTP/2 ping interval, also used as the ping timeout.
    keepalive: Option<Duration>,
    max_send_msg_size: usize,
    max_recv_msg_size: usize,
}

impl GrpcDial {
    /// Constructs a new dialer for the given target.
    ///
    /// The authority defaults to the target itself unless overridden.
    pub fn new(host: String, authority: Option<&str>, security: SecurityMode) -> Result<Self, Error> {
        if host.parse::<Authority>().is_err() {
            return Err(Error::InvalidTarget(host));
        }
        let authority = authority
            .unwrap_or(&host)
            .parse::<Authority>()
            .map_err(|_| Error::InvalidTarget(host.clone()))?;

        let m = Self {
            host,
            authority,
            security,
            dial_timeout: Duration::from_secs(10),
            keepalive: None,
            max_send_msg_size: i32::MAX as usize,
            max_recv_msg_size: i32::MAX as usize,
        };

        Ok(m)
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    #[inline]
    fn scheme(&self) -> &'static str {
        match self.security {
            SecurityMode::Insecure => "http",
            SecurityMode::Tls => "https",
        }
    }

    /// Builds the endpoint every connection is dialed from.
    fn endpoint(&self) -> Result<Endpoint, Error> {
        let scheme = self.scheme();
        let origin = Uri::builder()
            .scheme(scheme)
            .authority(self.authority.clone())
            .path_and_query("/")
            .build()
            .map_err(|_| Error::InvalidTarget(self.host.clone()))?;

        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.host))
            .map_err(|_| Error::InvalidTarget(self.host.clone()))?
            .origin(origin)
            .connect_timeout(self.dial_timeout)
            .tcp_nodelay(true);

        if let Some(interval) = self.keepalive {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_timeout(interval)
                .keep_alive_while_idle(true);
        }

        if self.security == SecurityMode::Tls {
            let tls = ClientTlsConfig::new()
                .with_native_roots()
                .domain_name(self.authority.host());
            endpoint = endpoint.tls_config(tls)?;
        }

        Ok(endpoint)
    }
}

impl TryFrom<&RunConfig> for GrpcDial {
    type Error = Error;

    fn try_from(cfg: &RunConfig) -> Result<Self, Self::Error> {
        let m = Self::new(cfg.host.clone(), cfg.authority.as_deref(), cfg.security)?
            .with_dial_timeout(cfg.dial_timeout)
            .with_keepalive(cfg.keepalive);

        Ok(m)
    }
}

impl Dial for GrpcDial {
    type Conn = GrpcConn;

    async fn dial(&self, tap: Option<Arc<StatsTap>>) -> Result<Self::Conn, Error> {
        log::debug!(
            "creating client connection to {}://{} (authority: {}, keepalive: {:?}, instrumented: {})",
            self.scheme(),
            self.host,
            self.authority,
            self.keepalive,
            tap.is_some()
        );

        let endpoint = self.endpoint()?;
        let channel = tokio::time::timeout(self.dial_timeout, endpoint.connect())
            .await
            .map_err(|_| Error::DialTimeout(self.host.clone(), self.dial_timeout))??;

        let (closed, _) = watch::channel(false);
        let m = GrpcConn {
            channel,
            closed,
            tap,
            max_send_msg_size: self.max_send_msg_size,
            max_recv_msg_size: self.max_recv_msg_size,
        };

        Ok(m)
    }
}

/// Established HTTP/2 connection.
///
/// Dropping it closes the connection.
#[derive(Debug)]
pub struct GrpcConn {
    channel: Channel,
    closed: watch::Sender<bool>,
    tap: Option<Arc<StatsTap>>,
    max_send_msg_size: usize,
    max_recv_msg_size: usize,
}

impl Connection for GrpcConn {
    type Caller = GrpcCaller;

    fn caller(&self) -> Self::Caller {
        let grpc = Grpc::new(self.channel.clone())
            .max_encoding_message_size(self.max_send_msg_size)
            .max_decoding_message_size(self.max_recv_msg_size);

        GrpcCaller {
            grpc,
            closed: self.closed.subscribe(),
            tap: self.tap.clone(),
        }
    }

    #[inline]
    fn channel(&self) -> Channel {
        self.channel.clone()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            log::trace!("closing client connection");
        }
    }
}

impl Drop for GrpcConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct GrpcCaller {
    grpc: Grpc<Channel>,
    closed: watch::Receiver<bool>,
    tap: Option<Arc<StatsTap>>,
}

impl GrpcCaller {
    async fn perform(&self, call: &Call) -> Result<Vec<Bytes>, Status> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|err| Status::unavailable(format!("connection is not ready: {err}")))?;

        let path = call.path.clone();
        let messages = match (call.client_streaming, call.server_streaming) {
            (false, false) => {
                let message = call.messages.first().cloned().unwrap_or_default();
                let response = grpc.unary(request(call, message), path, RawCodec).await?;
                vec![response.into_inner()]
            }
            (true, false) => {
                let stream = tokio_stream::iter(call.messages.clone());
                let response = grpc.client_streaming(request(call, stream), path, RawCodec).await?;
                vec![response.into_inner()]
            }
            (false, true) => {
                let message = call.messages.first().cloned().unwrap_or_default();
                let response = grpc.server_streaming(request(call, message), path, RawCodec).await?;
                drain(response.into_inner()).await?
            }
            (true, true) => {
                let stream = tokio_stream::iter(call.messages.clone());
                let response = grpc.streaming(request(call, stream), path, RawCodec).await?;
                drain(response.into_inner()).await?
            }
        };

        Ok(messages)
    }

    async fn perform_with_deadline(&self, call: &Call) -> Result<Vec<Bytes>, Status> {
        match call.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.perform(call)).await {
                Ok(rc) => rc,
                Err(..) => Err(Status::deadline_exceeded("context deadline exceeded")),
            },
            None => self.perform(call).await,
        }
    }
}

impl Caller for GrpcCaller {
    async fn invoke(&self, call: &Call) -> Result<Vec<Bytes>, CallError> {
        let mut closed = self.closed.clone();
        let is_closed = *closed.borrow();
        if is_closed {
            return Err(CallError::Closed);
        }

        let now = Instant::now();
        let rc = tokio::select! {
            rc = self.perform_with_deadline(call) => rc.map_err(CallError::from),
            _ = closed.wait_for(|v| *v) => {
                Err(CallError::status(Code::Cancelled, "connection is closing"))
            }
        };

        if let Some(tap) = &self.tap {
            tap.on_complete(rc.as_ref().err().cloned(), now.elapsed()).await;
        }

        rc
    }
}

fn request<T>(call: &Call, message: T) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = MetadataMap::from_headers((*call.metadata).clone());
    request
}

async fn drain(mut stream: Streaming<Bytes>) -> Result<Vec<Bytes>, Status> {
    let mut messages = Vec::new();
    while let Some(message) = stream.message().await? {
        messages.push(message);
    }

    Ok(messages)
}
