use core::{
    convert::Infallible,
    fmt::{self, Display, Formatter},
    num::NonZero,
    str::FromStr,
    time::Duration,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use clap::ValueEnum;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::cmd::Cmd;

pub type Error = Box<dyn core::error::Error + Send + Sync>;

/// Transport security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Cleartext HTTP/2.
    Insecure,
    Tls,
}

/// What to do with open connections when a run is stopped externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Close all connections immediately.
    #[default]
    Close,
    /// Drop results of calls still in flight, then close all connections.
    Ignore,
    /// Leave connections open, letting in-flight calls drain.
    Wait,
}

impl FromStr for StopPolicy {
    type Err = Infallible;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let m = match v {
            "close" => Self::Close,
            "ignore" => Self::Ignore,
            _ => Self::Wait,
        };

        Ok(m)
    }
}

impl Display for StopPolicy {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        match self {
            Self::Close => fmt.write_str("close"),
            Self::Ignore => fmt.write_str("ignore"),
            Self::Wait => fmt.write_str("wait"),
        }
    }
}

impl<'de> Deserialize<'de> for StopPolicy {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v: String = Deserialize::deserialize(de)?;
        let Ok(m) = v.parse::<Self>();

        Ok(m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Keep a fixed number of workers busy.
    #[default]
    Concurrency,
    /// Keep a fixed request rate.
    Qps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadSchedule {
    #[default]
    Const,
    Step,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summary.
    #[default]
    Summary,
    /// Compact JSON.
    Json,
    /// Indented JSON.
    Pretty,
}

/// Where the method descriptor comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorSource {
    /// Protocol buffer source file, compiled on the fly.
    Proto { path: PathBuf, import_paths: Vec<PathBuf> },
    /// Compiled descriptor set file.
    Protoset(PathBuf),
    /// Server reflection against the target.
    Reflection,
}

/// Run configuration, immutable for the whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Target endpoint in `host:port` form.
    pub host: String,
    /// Fully-qualified method name.
    pub call: String,
    pub descriptor: DescriptorSource,
    /// Total number of requests to issue across all workers.
    pub total: u64,
    /// Number of workers.
    pub concurrency: usize,
    /// Number of connections workers are spread over.
    pub connections: NonZero<usize>,
    /// Stop the run after this duration.
    pub duration: Option<Duration>,
    /// Per-call deadline.
    pub timeout: Option<Duration>,
    pub dial_timeout: Duration,
    /// HTTP/2 keepalive ping interval.
    pub keepalive: Option<Duration>,
    pub security: SecurityMode,
    /// Overrides the `:authority` pseudo-header.
    pub authority: Option<String>,
    /// Metadata sent with every call.
    pub metadata: Arc<HeaderMap>,
    /// Metadata sent with reflection requests.
    pub reflect_metadata: Arc<HeaderMap>,
    pub stop_policy: StopPolicy,
    /// Optional run name, also used as the worker identity prefix.
    pub name: Option<String>,
    /// Raw request payload.
    pub data: Bytes,
    /// Whether the payload is a serialized protobuf message instead of JSON.
    pub binary: bool,
    pub load_strategy: LoadStrategy,
    pub load_schedule: LoadSchedule,
    /// Number of runtime worker threads.
    pub cpus: NonZero<usize>,
    pub format: OutputFormat,
    /// Report destination, stdout if none.
    pub output: Option<PathBuf>,
}

impl RunConfig {
    pub const DEFAULT_TOTAL: u64 = 200;
    pub const DEFAULT_CONCURRENCY: usize = 50;
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Constructs a config with default settings for the given target and
    /// method.
    pub fn new(host: impl Into<String>, call: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            call: call.into(),
            descriptor: DescriptorSource::Reflection,
            total: Self::DEFAULT_TOTAL,
            concurrency: Self::DEFAULT_CONCURRENCY,
            connections: NonZero::<usize>::MIN,
            duration: None,
            timeout: Some(Self::DEFAULT_TIMEOUT),
            dial_timeout: Self::DEFAULT_DIAL_TIMEOUT,
            keepalive: None,
            security: SecurityMode::Tls,
            authority: None,
            metadata: Arc::new(HeaderMap::new()),
            reflect_metadata: Arc::new(HeaderMap::new()),
            stop_policy: StopPolicy::default(),
            name: None,
            data: Bytes::new(),
            binary: false,
            load_strategy: LoadStrategy::default(),
            load_schedule: LoadSchedule::default(),
            cpus: std::thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN),
            format: OutputFormat::default(),
            output: None,
        }
    }
}

impl TryFrom<Cmd> for RunConfig {
    type Error = Error;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let file = match &cmd.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let host = cmd.host.or(file.host).ok_or("target host is required")?;
        let call = cmd.call.or(file.call).ok_or("method to call is required, see --call")?;
        let mut m = Self::new(host, call);

        let proto = cmd.proto.or(file.proto);
        let protoset = cmd.protoset.or(file.protoset);
        let import_paths = if cmd.import_paths.is_empty() {
            file.import_paths
        } else {
            cmd.import_paths
        };
        m.descriptor = match (proto, protoset) {
            (Some(path), protoset) => {
                if protoset.is_some() {
                    log::warn!("both proto and protoset are given, using proto");
                }
                DescriptorSource::Proto { path, import_paths }
            }
            (None, Some(path)) => DescriptorSource::Protoset(path),
            (None, None) => DescriptorSource::Reflection,
        };

        m.concurrency = cmd.concurrency.or(file.concurrency).unwrap_or(m.concurrency);
        m.connections = match cmd.connections {
            Some(v) => v,
            None => match file.connections {
                Some(v) => NonZero::new(v).ok_or("number of connections must be at least 1")?,
                None => m.connections,
            },
        };
        m.duration = cmd.duration.or(file.duration);
        m.total = match m.duration {
            // The run is bounded by time instead.
            Some(..) => u64::MAX,
            None => cmd.total.or(file.total).unwrap_or(m.total),
        };
        m.timeout = match cmd.timeout.or(file.timeout) {
            Some(Duration::ZERO) => None,
            Some(v) => Some(v),
            None => m.timeout,
        };
        m.dial_timeout = cmd.connect_timeout.or(file.connect_timeout).unwrap_or(m.dial_timeout);
        m.keepalive = cmd.keepalive.or(file.keepalive).filter(|v| !v.is_zero());
        if cmd.insecure || file.insecure.unwrap_or(false) {
            m.security = SecurityMode::Insecure;
        }
        m.authority = cmd.authority.or(file.authority);

        m.metadata = Arc::new(match cmd.metadata {
            Some(v) => parse_metadata(&v)?,
            None => to_header_map(file.metadata.unwrap_or_default())?,
        });
        m.reflect_metadata = Arc::new(match cmd.reflect_metadata {
            Some(v) => parse_metadata(&v)?,
            None => to_header_map(file.reflect_metadata.unwrap_or_default())?,
        });

        m.stop_policy = cmd.stop.or(file.stop).unwrap_or(m.stop_policy);
        m.name = cmd.name.or(file.name);

        let binary = cmd.binary || file.binary.unwrap_or(false);
        m.binary = binary || cmd.binary_file.is_some();
        m.data = match (cmd.data, cmd.data_file, cmd.binary_file) {
            (Some(data), ..) => {
                if binary {
                    return Err("binary data must be given with --binary-file".into());
                }
                Bytes::from(data)
            }
            (None, Some(path), ..) => Bytes::from(fs::read(path)?),
            (None, None, Some(path)) => Bytes::from(fs::read(path)?),
            (None, None, None) => match file.data {
                Some(v) => Bytes::from(serde_json::to_string(&v)?),
                None => Bytes::new(),
            },
        };

        m.load_strategy = cmd.load_strategy.or(file.load_strategy).unwrap_or_default();
        m.load_schedule = cmd.load_schedule.or(file.load_schedule).unwrap_or_default();
        m.cpus = match cmd.cpus {
            Some(v) => v,
            None => match file.cpus {
                Some(v) => NonZero::new(v).ok_or("number of cpus must be at least 1")?,
                None => m.cpus,
            },
        };
        m.format = cmd.format.or(file.format).unwrap_or_default();
        m.output = cmd.output.or(file.output);

        Ok(m)
    }
}

/// Settings loaded from a YAML or JSON file.
///
/// Every field is optional, command line arguments take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    call: Option<String>,
    proto: Option<PathBuf>,
    import_paths: Vec<PathBuf>,
    protoset: Option<PathBuf>,
    total: Option<u64>,
    concurrency: Option<usize>,
    connections: Option<usize>,
    #[serde(with = "humantime_serde")]
    duration: Option<Duration>,
    #[serde(with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    keepalive: Option<Duration>,
    insecure: Option<bool>,
    authority: Option<String>,
    metadata: Option<HashMap<String, String>>,
    reflect_metadata: Option<HashMap<String, String>>,
    stop: Option<StopPolicy>,
    name: Option<String>,
    data: Option<serde_json::Value>,
    binary: Option<bool>,
    load_strategy: Option<LoadStrategy>,
    load_schedule: Option<LoadSchedule>,
    cpus: Option<usize>,
    format: Option<OutputFormat>,
    output: Option<PathBuf>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, Error> {
        log::debug!("loading config from '{}' ...", path.display());

        let data = fs::read(path)?;
        let cfg = match path.extension().and_then(|v| v.to_str()) {
            Some("json") => serde_json::from_slice(&data)?,
            _ => serde_yaml::from_slice(&data)?,
        };

        Ok(cfg)
    }
}

/// Parses metadata given as a JSON object with string values.
pub fn parse_metadata(v: &str) -> Result<HeaderMap, Error> {
    let v: HashMap<String, String> =
        serde_json::from_str(v).map_err(|err| format!("metadata must be a JSON object of strings: {err}"))?;

    to_header_map(v)
}

fn to_header_map(v: HashMap<String, String>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::with_capacity(v.len());
    for (name, value) in v {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|err| format!("invalid metadata key {name:?}: {err}"))?;
        let value = HeaderValue::from_str(&value).map_err(|err| format!("invalid metadata value {value:?}: {err}"))?;

        headers.append(name, value);
    }

    Ok(headers)
}
