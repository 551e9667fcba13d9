//! In-process HTTP/2 server speaking just enough gRPC to exercise the
//! client against well-formed and malformed responses.
//!
//! Methods are dispatched on the last path segment:
//!
//! - `Unary` echoes the request message.
//! - `ClientStream` concatenates all request messages.
//! - `ServerStream` repeats the request message three times.
//! - `Metadata` replies with the `x-user` request header.
//! - `Status` replies with one message, then a `NotFound` status.
//! - `TrailersOnly` fails with `InvalidArgument` in the response headers.
//! - `Unavailable` replies with HTTP 503 and no gRPC status at all.
//! - `Slow` echoes after two seconds.

use core::{convert::Infallible, time::Duration};
use std::{net::SocketAddr, vec};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    server::conn::http2,
    service::service_fn,
};
use tokio::net::TcpListener;

use super::{
    rt::{TokioExecutor, TokioIo},
    Code,
};

type Body = StreamBody<tokio_stream::Iter<vec::IntoIter<Result<Frame<Bytes>, Infallible>>>>;

/// Starts serving on an ephemeral local port.
pub async fn spawn() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http2::Builder::new(TokioExecutor)
                    .serve_connection(TokioIo::new(stream), service_fn(handle))
                    .await;
            });
        }
    });

    addr
}

async fn handle(req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
    let method = req.uri().path().rsplit('/').next().unwrap_or_default().to_owned();
    let user = req.headers().get("x-user").cloned();
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(..) => Bytes::new(),
    };
    let messages = decode(body);

    let response = match method.as_str() {
        "Unary" => respond(messages, Code::Ok, ""),
        "ClientStream" => respond(vec![Bytes::from(messages.concat())], Code::Ok, ""),
        "ServerStream" => {
            let message = messages.first().cloned().unwrap_or_default();
            respond(vec![message; 3], Code::Ok, "")
        }
        "Metadata" => {
            let user = user.map(|v| Bytes::copy_from_slice(v.as_bytes())).unwrap_or_default();
            respond(vec![user], Code::Ok, "")
        }
        "Status" => respond(vec![Bytes::from_static(b"partial")], Code::NotFound, "missing"),
        "TrailersOnly" => trailers_only(Code::InvalidArgument, "bad request"),
        "Unavailable" => {
            let mut response = Response::new(body_of(Vec::new()));
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            response
        }
        "Slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            respond(messages, Code::Ok, "")
        }
        _ => trailers_only(Code::Unimplemented, "unknown method"),
    };

    Ok(response)
}

fn body_of(frames: Vec<Result<Frame<Bytes>, Infallible>>) -> Body {
    StreamBody::new(tokio_stream::iter(frames))
}

fn status(code: Code, message: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("grpc-status", HeaderValue::from(code as i32));
    if !message.is_empty() {
        headers.insert("grpc-message", HeaderValue::from_str(message).unwrap());
    }
    headers
}

fn respond(messages: Vec<Bytes>, code: Code, message: &str) -> Response<Body> {
    let mut frames: Vec<_> = messages.iter().map(|m| Ok(Frame::data(encode(m)))).collect();
    frames.push(Ok(Frame::trailers(status(code, message))));

    let mut response = Response::new(body_of(frames));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
}

fn trailers_only(code: Code, message: &str) -> Response<Body> {
    let mut response = Response::new(body_of(Vec::new()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.extend(status(code, message));
    response
}

fn encode(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + message.len());
    buf.put_u8(0);
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    buf.freeze()
}

fn decode(mut body: Bytes) -> Vec<Bytes> {
    let mut messages = Vec::new();
    while body.remaining() >= 5 {
        body.advance(1);
        let len = body.get_u32() as usize;
        if body.len() < len {
            break;
        }
        messages.push(body.split_to(len));
    }
    messages
}
