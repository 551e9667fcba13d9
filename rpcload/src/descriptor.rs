//! Method descriptor resolution.
//!
//! A descriptor is resolved exactly once per run from one of three sources,
//! in priority order: a proto source file compiled in-process, a compiled
//! descriptor set file, or server reflection over a transient connection.

use core::time::Duration;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use http::uri::{InvalidUri, PathAndQuery};
use prost_reflect::{DescriptorPool, MessageDescriptor};
use thiserror::Error;

use crate::{
    cfg::{DescriptorSource, RunConfig},
    transport::{self, label, Connection, Dial},
};

mod reflection;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid call {0:?}, expected 'package.Service/Method' or 'package.Service.Method'")]
    InvalidCall(String),
    #[error("failed to compile proto: {0}")]
    Compile(#[from] Box<protox::Error>),
    #[error("failed to read descriptor set: {0}")]
    Io(#[from] io::Error),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),
    #[error("service {0:?} not found")]
    ServiceNotFound(String),
    #[error("method {method:?} not found in service {service:?}")]
    MethodNotFound { service: String, method: String },
    #[error("failed to dial for reflection: {0}")]
    Dial(#[from] transport::Error),
    #[error("reflection call failed: {} ({})", .0.message(), label(.0.code()))]
    Status(#[from] tonic::Status),
    #[error("malformed reflection response: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("reflection error: {0}")]
    Reflection(String),
    #[error("reflection timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid method path: {0}")]
    InvalidPath(#[from] InvalidUri),
}

impl From<protox::Error> for Error {
    fn from(err: protox::Error) -> Self {
        Self::Compile(Box::new(err))
    }
}

/// Resolved method contract, immutable for the whole run.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    inner: prost_reflect::MethodDescriptor,
    /// Request path, e.g. `/helloworld.Greeter/SayHello`.
    path: PathAndQuery,
}

impl MethodDescriptor {
    pub fn new(inner: prost_reflect::MethodDescriptor) -> Result<Self, Error> {
        let path = format!("/{}/{}", inner.parent_service().full_name(), inner.name()).parse()?;
        let m = Self { inner, path };

        Ok(m)
    }

    #[inline]
    pub fn path(&self) -> &PathAndQuery {
        &self.path
    }

    #[inline]
    pub fn full_name(&self) -> &str {
        self.inner.full_name()
    }

    /// Returns the descriptor of the request message.
    #[inline]
    pub fn input(&self) -> MessageDescriptor {
        self.inner.input()
    }

    #[inline]
    pub fn is_client_streaming(&self) -> bool {
        self.inner.is_client_streaming()
    }

    #[inline]
    pub fn is_server_streaming(&self) -> bool {
        self.inner.is_server_streaming()
    }
}

/// Splits a call identifier into service and method names.
///
/// Both `package.Service/Method` and `package.Service.Method` forms are
/// accepted.
pub fn parse_call(call: &str) -> Result<(&str, &str), Error> {
    let invalid = || Error::InvalidCall(call.into());

    let (service, method) = match call.rsplit_once('/') {
        Some(v) => v,
        None => call.rsplit_once('.').ok_or_else(invalid)?,
    };
    if service.is_empty() || method.is_empty() || service.contains('/') || method.contains('.') {
        return Err(invalid());
    }

    Ok((service, method))
}

/// Looks up the given method in the pool.
pub fn find_method(pool: &DescriptorPool, call: &str) -> Result<MethodDescriptor, Error> {
    let (service, method) = parse_call(call)?;

    let svc = pool
        .get_service_by_name(service)
        .ok_or_else(|| Error::ServiceNotFound(service.into()))?;
    let m = svc
        .methods()
        .find(|m| m.name() == method)
        .ok_or_else(|| Error::MethodNotFound {
            service: service.into(),
            method: method.into(),
        })?;

    MethodDescriptor::new(m)
}

/// Compiles the proto source file and resolves the method from it.
///
/// The file's own directory is searched for imports after the given import
/// paths.
pub fn from_proto(path: &Path, import_paths: &[PathBuf], call: &str) -> Result<MethodDescriptor, Error> {
    log::debug!("compiling '{}' with import paths {:?} ...", path.display(), import_paths);

    let mut includes = import_paths.to_vec();
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => includes.push(parent.to_path_buf()),
        _ => includes.push(PathBuf::from(".")),
    }

    let mut compiler = protox::Compiler::new(includes)?;
    compiler.include_imports(true);
    compiler.open_file(path)?;

    find_method(&compiler.descriptor_pool(), call)
}

/// Decodes the descriptor set file and resolves the method from it.
pub fn from_protoset(path: &Path, call: &str) -> Result<MethodDescriptor, Error> {
    log::debug!("loading descriptor set from '{}' ...", path.display());

    let data = fs::read(path)?;
    let pool = DescriptorPool::decode(data.as_slice())?;

    find_method(&pool, call)
}

/// Resolves the method descriptor as configured.
///
/// Reflection uses a dedicated connection that is never instrumented and is
/// closed right after resolution, regardless of the outcome.
pub async fn resolve<D>(cfg: &RunConfig, dial: &D) -> Result<MethodDescriptor, Error>
where
    D: Dial,
{
    match &cfg.descriptor {
        DescriptorSource::Proto { path, import_paths } => from_proto(path, import_paths, &cfg.call),
        DescriptorSource::Protoset(path) => from_protoset(path, &cfg.call),
        DescriptorSource::Reflection => {
            log::debug!("resolving '{}' via server reflection on {} ...", cfg.call, cfg.host);

            let conn = dial.dial(None).await?;
            let rc = reflection::resolve(conn.channel(), &cfg.call, cfg.dial_timeout, cfg.reflect_metadata.clone()).await;
            conn.close();

            rc
        }
    }
}
