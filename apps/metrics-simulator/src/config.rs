use crate::aggregator::BacklogPolicy;
use crate::stats::DEFAULT_LATENCY_SAMPLE_SIZE;
use crate::storage::MemoryStorageConfig;
use crate::time_slice::{IntervalType, TimeSlices};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "SIMULATOR_";

/// Resolved run parameters. Read once at startup and never mutated after
/// validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationPlan {
    pub nodes: Vec<String>,
    pub cql_port: u16,
    pub num_measurement_collectors: usize,
    pub thread_pool_size: Option<usize>,
    pub batch_size: usize,
    pub collection_interval_ms: u64,
    pub aggregation_interval_ms: u64,
    pub simulation_time_ms: u64,
    pub metrics_report_interval_ms: u64,
    pub interval_type: String,
    pub aggregation_backlog: String,
    pub collector_shutdown_timeout_ms: u64,
    pub aggregator_shutdown_timeout_ms: u64,
    pub latency_sample_size: usize,
    pub seed: Option<u64>,
    pub write_latency_ms: u64,
    pub write_failure_rate: f64,
    #[serde(skip)]
    pub otlp_endpoint: Option<String>,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1".to_string()],
            cql_port: 9142,
            num_measurement_collectors: 5,
            thread_pool_size: None,
            batch_size: 500,
            collection_interval_ms: 1_000,
            aggregation_interval_ms: 10_000,
            simulation_time_ms: 60_000,
            metrics_report_interval_ms: 5_000,
            interval_type: "seconds".to_string(),
            aggregation_backlog: "queue".to_string(),
            collector_shutdown_timeout_ms: 5_000,
            aggregator_shutdown_timeout_ms: 5_000,
            latency_sample_size: DEFAULT_LATENCY_SAMPLE_SIZE,
            seed: None,
            write_latency_ms: 2,
            write_failure_rate: 0.0,
            otlp_endpoint: None,
        }
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow::anyhow!("{err}"))
        .with_context(|| format!("invalid value `{raw}` for {key}"))
}

impl SimulationPlan {
    /// Plan file (when given) overlaid by `SIMULATOR_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv().ok();
        let mut plan = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        plan.apply_env_overrides()?;
        plan.otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read simulation plan {}", path.display()))?;
        Self::from_json(contents)
            .with_context(|| format!("failed to parse simulation plan {}", path.display()))
    }

    pub fn from_json(contents: String) -> Result<Self> {
        let mut bytes = contents.into_bytes();
        let plan: SimulationPlan = simd_json::serde::from_slice(&mut bytes)?;
        Ok(plan)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies every `SIMULATOR_<FIELD>` that `lookup` resolves to a
    /// non-empty value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (key, value))
        };

        if let Some((_, raw)) = value("NODES") {
            self.nodes = raw
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some((key, raw)) = value("CQL_PORT") {
            self.cql_port = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("NUM_MEASUREMENT_COLLECTORS") {
            self.num_measurement_collectors = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("THREAD_POOL_SIZE") {
            self.thread_pool_size = Some(parse_env(&key, &raw)?);
        }
        if let Some((key, raw)) = value("BATCH_SIZE") {
            self.batch_size = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("COLLECTION_INTERVAL_MS") {
            self.collection_interval_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("AGGREGATION_INTERVAL_MS") {
            self.aggregation_interval_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("SIMULATION_TIME_MS") {
            self.simulation_time_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("METRICS_REPORT_INTERVAL_MS") {
            self.metrics_report_interval_ms = parse_env(&key, &raw)?;
        }
        if let Some((_, raw)) = value("INTERVAL_TYPE") {
            self.interval_type = raw;
        }
        if let Some((_, raw)) = value("AGGREGATION_BACKLOG") {
            self.aggregation_backlog = raw;
        }
        if let Some((key, raw)) = value("COLLECTOR_SHUTDOWN_TIMEOUT_MS") {
            self.collector_shutdown_timeout_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("AGGREGATOR_SHUTDOWN_TIMEOUT_MS") {
            self.aggregator_shutdown_timeout_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("LATENCY_SAMPLE_SIZE") {
            self.latency_sample_size = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("SEED") {
            self.seed = Some(parse_env(&key, &raw)?);
        }
        if let Some((key, raw)) = value("WRITE_LATENCY_MS") {
            self.write_latency_ms = parse_env(&key, &raw)?;
        }
        if let Some((key, raw)) = value("WRITE_FAILURE_RATE") {
            self.write_failure_rate = parse_env(&key, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.iter().all(|node| node.trim().is_empty()) {
            bail!("simulation plan needs at least one storage node");
        }
        if self.cql_port == 0 {
            bail!("cql_port must be non-zero");
        }
        if self.num_measurement_collectors == 0 {
            bail!("num_measurement_collectors must be positive");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.thread_pool_size == Some(0) {
            bail!("thread_pool_size must be positive when set");
        }
        if self.latency_sample_size == 0 {
            bail!("latency_sample_size must be positive");
        }
        for (name, value) in [
            ("collection_interval_ms", self.collection_interval_ms),
            ("aggregation_interval_ms", self.aggregation_interval_ms),
            ("simulation_time_ms", self.simulation_time_ms),
            ("metrics_report_interval_ms", self.metrics_report_interval_ms),
        ] {
            if value == 0 {
                bail!("{name} must be positive");
            }
            if i64::try_from(value).is_err() {
                bail!("{name} must not exceed {} ms (got {value})", i64::MAX);
            }
        }
        if !(0.0..=1.0).contains(&self.write_failure_rate) {
            bail!(
                "write_failure_rate must be within [0, 1] (got {})",
                self.write_failure_rate
            );
        }
        self.interval_type()?;
        self.backlog_policy()?;
        self.num_measurement_collectors
            .checked_mul(self.batch_size)
            .filter(|total| i64::try_from(*total).is_ok())
            .context("num_measurement_collectors * batch_size overflows the schedule id space")?;
        Ok(())
    }

    pub fn interval_type(&self) -> Result<IntervalType> {
        Ok(self.interval_type.parse::<IntervalType>()?)
    }

    pub fn time_slices(&self) -> Result<TimeSlices> {
        Ok(TimeSlices::for_interval_type(self.interval_type()?))
    }

    pub fn backlog_policy(&self) -> Result<BacklogPolicy> {
        self.aggregation_backlog.parse()
    }

    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
            .unwrap_or(self.num_measurement_collectors + 1)
            .max(1)
    }

    /// Size of the id range every aggregation pass covers.
    pub fn schedule_id_count(&self) -> usize {
        self.num_measurement_collectors * self.batch_size
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_millis(self.aggregation_interval_ms)
    }

    pub fn simulation_time(&self) -> Duration {
        Duration::from_millis(self.simulation_time_ms)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_report_interval_ms)
    }

    pub fn collector_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_shutdown_timeout_ms)
    }

    pub fn aggregator_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregator_shutdown_timeout_ms)
    }

    pub fn node_addresses(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| node.trim())
            .filter(|node| !node.is_empty())
            .map(|node| format!("{node}:{}", self.cql_port))
            .collect()
    }

    pub fn storage_config(&self) -> Result<MemoryStorageConfig> {
        Ok(MemoryStorageConfig {
            nodes: self.node_addresses(),
            write_latency: Duration::from_millis(self.write_latency_ms),
            write_failure_rate: self.write_failure_rate,
            time_slices: self.time_slices()?,
            seed: self.seed,
        })
    }
}
