use core::{num::NonZero, time::Duration};
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::cfg::{LoadSchedule, LoadStrategy, OutputFormat, StopPolicy};

/// Load generator for gRPC services.
///
/// Request messages are built from JSON (or binary) payloads against method
/// descriptors loaded from proto files, protosets or server reflection.
#[derive(Debug, Clone, Default, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Target endpoint in host:port form.
    pub host: Option<String>,
    /// Fully-qualified method name in 'package.Service/Method' or
    /// 'package.Service.Method' format.
    #[clap(long)]
    pub call: Option<String>,
    /// The protocol buffer source file.
    #[clap(long, value_name = "PATH")]
    pub proto: Option<PathBuf>,
    /// Comma separated list of proto import paths.
    #[clap(short = 'i', long, value_name = "PATHS", value_delimiter = ',')]
    pub import_paths: Vec<PathBuf>,
    /// The compiled protoset file. Alternative to the proto option.
    #[clap(long, value_name = "PATH")]
    pub protoset: Option<PathBuf>,
    /// Number of requests to run.
    #[clap(short = 'n', long)]
    pub total: Option<u64>,
    /// Number of request workers to run concurrently.
    ///
    /// Zero is a valid setting that issues no requests.
    #[clap(short, long)]
    pub concurrency: Option<usize>,
    /// Number of connections to use.
    ///
    /// Workers are distributed over connections in a round-robin fashion.
    #[clap(long)]
    pub connections: Option<NonZero<usize>>,
    /// Duration of the run, for example 10s or 3m.
    ///
    /// When set, the total number of requests is ignored.
    #[clap(short = 'z', long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,
    /// Timeout for each request. Zero means infinite.
    #[clap(short = 't', long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
    /// Connection timeout.
    #[clap(long, value_parser = humantime::parse_duration)]
    pub connect_timeout: Option<Duration>,
    /// Keepalive ping interval.
    #[clap(long, value_parser = humantime::parse_duration)]
    pub keepalive: Option<Duration>,
    /// Use plaintext and insecure connection.
    #[clap(long)]
    pub insecure: bool,
    /// Value to be used as the :authority pseudo-header.
    #[clap(long)]
    pub authority: Option<String>,
    /// Request metadata as a JSON object of strings.
    #[clap(short = 'm', long, value_name = "JSON")]
    pub metadata: Option<String>,
    /// Reflection request metadata as a JSON object of strings.
    #[clap(long, value_name = "JSON")]
    pub reflect_metadata: Option<String>,
    /// The call data as a JSON string.
    ///
    /// An array of objects makes each request use the next element in turn.
    #[clap(short = 'd', long, value_name = "JSON", conflicts_with_all = ["data_file", "binary_file"])]
    pub data: Option<String>,
    /// File path for the call data JSON.
    #[clap(short = 'D', long, value_name = "PATH", conflicts_with = "binary_file")]
    pub data_file: Option<PathBuf>,
    /// The call data comes as a serialized binary message.
    #[clap(short = 'b', long)]
    pub binary: bool,
    /// File path for the call data as a serialized binary message.
    #[clap(short = 'B', long, value_name = "PATH")]
    pub binary_file: Option<PathBuf>,
    /// What to do with connections when the run is stopped before completion.
    ///
    /// One of "close", "ignore" or "wait". Anything else means "wait".
    #[clap(long, value_name = "POLICY")]
    pub stop: Option<StopPolicy>,
    /// User specified name for the run.
    #[clap(long)]
    pub name: Option<String>,
    /// Number of CPU cores to use.
    #[clap(long)]
    pub cpus: Option<NonZero<usize>>,
    /// Load strategy.
    #[clap(long, value_enum)]
    pub load_strategy: Option<LoadStrategy>,
    /// Load schedule.
    #[clap(long, value_enum)]
    pub load_schedule: Option<LoadSchedule>,
    /// Output format.
    #[clap(short = 'O', long, value_enum)]
    pub format: Option<OutputFormat>,
    /// Output path. Standard output is used if omitted.
    #[clap(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Path to a YAML or JSON file with settings.
    ///
    /// Command line arguments take precedence.
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}
