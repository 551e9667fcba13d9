//! Method resolution via `grpc.reflection.v1alpha.ServerReflection`.

use core::time::Duration;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use http::HeaderMap;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorProto;
use tonic::{metadata::MetadataMap, transport::Channel, Request};
use tonic_reflection::pb::v1alpha::{
    server_reflection_client::ServerReflectionClient, server_reflection_request::MessageRequest,
    server_reflection_response::MessageResponse, ServerReflectionRequest,
};

use super::{find_method, parse_call, Error, MethodDescriptor};

/// Resolves the method by asking the server for the file defining its
/// service, then for every transitive dependency it does not know yet.
pub async fn resolve(
    channel: Channel,
    call: &str,
    timeout: Duration,
    metadata: Arc<HeaderMap>,
) -> Result<MethodDescriptor, Error> {
    let (service, ..) = parse_call(call)?;

    let files = tokio::time::timeout(timeout, fetch_files(channel, service, metadata))
        .await
        .map_err(|_| Error::Timeout(timeout))??;

    log::debug!("received {} file descriptor(s) via reflection", files.len());

    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_protos(files.into_values())?;

    find_method(&pool, call)
}

async fn fetch_files(
    channel: Channel,
    service: &str,
    metadata: Arc<HeaderMap>,
) -> Result<BTreeMap<String, FileDescriptorProto>, Error> {
    let mut client = ServerReflectionClient::new(channel);
    let mut files = BTreeMap::new();
    let mut requested = HashSet::new();
    let mut pending = vec![MessageRequest::FileContainingSymbol(service.into())];

    // Each round trip asks for everything missing so far in one stream.
    while !pending.is_empty() {
        let requests: Vec<_> = pending
            .drain(..)
            .map(|req| ServerReflectionRequest {
                host: String::new(),
                message_request: Some(req),
            })
            .collect();

        let mut request = Request::new(tokio_stream::iter(requests));
        *request.metadata_mut() = MetadataMap::from_headers((*metadata).clone());

        let mut stream = client.server_reflection_info(request).await?.into_inner();
        while let Some(resp) = stream.message().await? {
            match resp.message_response {
                Some(MessageResponse::FileDescriptorResponse(v)) => {
                    for raw in v.file_descriptor_proto {
                        let file = FileDescriptorProto::decode(raw.as_slice())?;
                        files.entry(file.name().to_string()).or_insert(file);
                    }
                }
                Some(MessageResponse::ErrorResponse(err)) => {
                    return Err(Error::Reflection(format!(
                        "{} (code {})",
                        err.error_message, err.error_code
                    )));
                }
                Some(..) => return Err(Error::Reflection("unexpected response".into())),
                None => return Err(Error::Reflection("empty response".into())),
            }
        }

        for file in files.values() {
            for dep in &file.dependency {
                if !files.contains_key(dep) && requested.insert(dep.clone()) {
                    pending.push(MessageRequest::FileByFilename(dep.clone()));
                }
            }
        }
    }

    Ok(files)
}
