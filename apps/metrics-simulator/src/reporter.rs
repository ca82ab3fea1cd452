use crate::shutdown::ShutdownCause;
use crate::stats::{IntervalSample, StatsRegistry, StatsSummary};
use chrono::Utc;
use std::sync::Arc;

/// Closes one reporting interval per tick and logs what it saw.
pub struct StatsReporter {
    stats: Arc<StatsRegistry>,
}

impl StatsReporter {
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self { stats }
    }

    pub fn run(&self) {
        self.run_at(Utc::now().timestamp_millis());
    }

    pub fn run_at(&self, now_ms: i64) -> Option<IntervalSample> {
        self.stats.start_new_interval(now_ms)?;
        let sample = self.stats.pop_latest_interval()?;
        let latency = self.stats.snapshot_latency();
        tracing::info!(
            interval_start = sample.timestamp,
            inserts = sample.count,
            inserts_per_sec = format!("{:.1}", self.stats.inserts_per_second()),
            latency_mean_ms = format!("{:.2}", latency.mean),
            latency_max_ms = format!("{:.2}", latency.max),
            "interval stats"
        );
        Some(sample)
    }
}

/// Closes the running interval and logs the lifetime totals.
pub fn report_final(stats: &StatsRegistry, cause: &ShutdownCause) -> StatsSummary {
    let last_interval = stats
        .start_new_interval(Utc::now().timestamp_millis())
        .and_then(|_| stats.pop_latest_interval());
    let summary = stats.summary();
    let times = &summary.insertion_times;
    tracing::info!(
        cause = %cause,
        total_inserts = summary.total_inserts,
        write_successes = summary.write_successes,
        write_failures = summary.write_failures,
        aggregation_runs = summary.aggregation_runs,
        aggregation_failures = summary.aggregation_failures,
        aggregations_coalesced = summary.aggregations_coalesced,
        mean_aggregation_ms = format!("{:.2}", summary.mean_aggregation_ms),
        inserts_per_sec = format!("{:.1}", summary.inserts_per_second),
        latency_min_ms = format!("{:.2}", times.min),
        latency_max_ms = format!("{:.2}", times.max),
        latency_mean_ms = format!("{:.2}", times.mean),
        latency_stddev_ms = format!("{:.2}", times.stddev),
        last_interval_inserts = last_interval.map(|sample| sample.count),
        "final simulation stats"
    );
    summary
}
