//! Result aggregation.

use core::{
    fmt::{self, Display, Formatter},
    time::Duration,
};
use std::{collections::BTreeMap, time::SystemTime};

use serde::{Serialize, Serializer};

use crate::{
    cfg::{LoadSchedule, LoadStrategy, RunConfig},
    histogram::LogHistogram,
    stat::{CallResult, Results},
    transport,
};

/// Percentiles reported in the latency distribution.
const PERCENTILES: [u32; 7] = [10, 25, 50, 75, 90, 95, 99];

/// Why the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    /// All workers exhausted their quota.
    #[default]
    NormalEnd,
    /// Interrupted by the user.
    Cancel,
    /// The configured run duration elapsed.
    Timeout,
    Other(String),
}

impl Display for StopReason {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        match self {
            Self::NormalEnd => fmt.write_str("normal"),
            Self::Cancel => fmt.write_str("cancel"),
            Self::Timeout => fmt.write_str("timeout"),
            Self::Other(v) => fmt.write_str(v),
        }
    }
}

impl Serialize for StopReason {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(self)
    }
}

/// Run settings echoed in the report.
#[derive(Debug, Clone, Serialize)]
pub struct Options {
    pub host: String,
    pub call: String,
    pub total: u64,
    pub concurrency: usize,
    pub connections: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    pub insecure: bool,
    pub stop: String,
    pub load_strategy: LoadStrategy,
    pub load_schedule: LoadSchedule,
    pub cpus: usize,
}

impl From<&RunConfig> for Options {
    fn from(cfg: &RunConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            call: cfg.call.clone(),
            total: cfg.total,
            concurrency: cfg.concurrency,
            connections: cfg.connections.get(),
            duration: cfg.duration,
            timeout: cfg.timeout,
            dial_timeout: cfg.dial_timeout,
            insecure: cfg.security == crate::cfg::SecurityMode::Insecure,
            stop: cfg.stop_policy.to_string(),
            load_strategy: cfg.load_strategy,
            load_schedule: cfg.load_schedule,
            cpus: cfg.cpus.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyDistribution {
    pub percentage: u32,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bucket {
    /// Upper bound of the bucket.
    #[serde(with = "humantime_serde")]
    pub mark: Duration,
    pub count: u64,
    /// Share of all results in this bucket.
    pub frequency: f64,
}

/// Final run report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub name: Option<String>,
    pub end_reason: StopReason,
    /// Report creation time, RFC 3339.
    pub date: String,
    pub options: Options,
    pub count: u64,
    /// Wall time of the run.
    #[serde(with = "humantime_serde")]
    pub total: Duration,
    #[serde(with = "humantime_serde")]
    pub average: Duration,
    #[serde(with = "humantime_serde")]
    pub fastest: Duration,
    #[serde(with = "humantime_serde")]
    pub slowest: Duration,
    pub rps: f64,
    pub error_distribution: BTreeMap<String, u64>,
    pub status_code_distribution: BTreeMap<String, u64>,
    pub latency_distribution: Vec<LatencyDistribution>,
    pub histogram: Vec<Bucket>,
}

/// Drains the result pipeline into running aggregates.
#[derive(Debug)]
pub struct Reporter {
    results: Results,
    name: Option<String>,
    options: Options,
    count: u64,
    /// Sum of all call durations.
    sum: Duration,
    fastest: Option<Duration>,
    slowest: Duration,
    errors: BTreeMap<String, u64>,
    statuses: BTreeMap<String, u64>,
    histogram: LogHistogram,
}

impl Reporter {
    pub fn new(results: Results, cfg: &RunConfig) -> Self {
        Self {
            results,
            name: cfg.name.clone(),
            options: cfg.into(),
            count: 0,
            sum: Duration::ZERO,
            fastest: None,
            slowest: Duration::ZERO,
            errors: BTreeMap::new(),
            statuses: BTreeMap::new(),
            histogram: LogHistogram::default(),
        }
    }

    /// Consumes results until the pipeline is closed and drained.
    ///
    /// Returns itself back, so that completion of this future is the signal
    /// that the report can be finalized.
    pub async fn run(mut self) -> Self {
        while let Some(result) = self.results.recv().await {
            self.record(result);
        }

        log::debug!("reporter drained {} results", self.count);

        self
    }

    fn record(&mut self, result: CallResult) {
        self.count += 1;
        self.sum += result.duration;
        self.fastest = Some(self.fastest.map_or(result.duration, |v| v.min(result.duration)));
        self.slowest = self.slowest.max(result.duration);
        self.histogram.record(result.duration);

        *self.statuses.entry(transport::label(result.status).to_string()).or_default() += 1;
        if let Some(err) = result.error {
            *self.errors.entry(err.to_string()).or_default() += 1;
        }
    }

    /// Builds the final report.
    pub fn finalize(self, reason: StopReason, elapsed: Duration) -> Report {
        let average = match self.count {
            0 => Duration::ZERO,
            n => Duration::from_nanos((self.sum.as_nanos() / n as u128) as u64),
        };
        let rps = match elapsed.as_secs_f64() {
            secs if secs > 0.0 => self.count as f64 / secs,
            _ => 0.0,
        };

        let latency_distribution = PERCENTILES
            .iter()
            .map(|&percentage| LatencyDistribution {
                percentage,
                latency: self.histogram.quantile(percentage as f64 / 100.0),
            })
            .collect();
        let histogram = self
            .histogram
            .buckets()
            .map(|(mark, count)| Bucket {
                mark,
                count,
                frequency: count as f64 / self.count as f64,
            })
            .collect();

        Report {
            name: self.name,
            end_reason: reason,
            date: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            options: self.options,
            count: self.count,
            total: elapsed,
            average,
            fastest: self.fastest.unwrap_or_default(),
            slowest: self.slowest,
            rps,
            error_distribution: self.errors,
            status_code_distribution: self.statuses,
            latency_distribution,
            histogram,
        }
    }
}
