//! Thread-safe counters and latency samples shared by every simulator task.
//!
//! Two independent locks exist: one for the per-interval insert count and
//! its completed samples, one for the latency window. Lifetime totals are
//! plain atomics. No lock here is ever held across I/O.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_LATENCY_SAMPLE_SIZE: usize = 1028;

/// Inserts observed during one reporting interval, ordered by
/// (timestamp, count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IntervalSample {
    pub timestamp: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InsertionTimes {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub total_inserts: u64,
    pub write_successes: u64,
    pub write_failures: u64,
    pub aggregation_runs: u64,
    pub aggregation_failures: u64,
    pub aggregations_coalesced: u64,
    pub mean_aggregation_ms: f64,
    pub inserts_per_second: f64,
    pub insertion_times: InsertionTimes,
}

#[derive(Debug, Default)]
struct IntervalState {
    started_at: Option<i64>,
    count: u64,
    completed: BTreeSet<IntervalSample>,
}

#[derive(Debug)]
struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn snapshot(&self) -> InsertionTimes {
        let len = self.samples.len();
        if len == 0 {
            return InsertionTimes::default();
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for value in &self.samples {
            min = min.min(*value);
            max = max.max(*value);
            sum += value;
        }
        let mean = sum / len as f64;
        let stddev = if len > 1 {
            let variance = self
                .samples
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / (len - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
        InsertionTimes {
            max,
            min,
            mean,
            stddev,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct StatsRegistry {
    started: Instant,
    total_inserts: AtomicU64,
    write_successes: AtomicU64,
    write_failures: AtomicU64,
    aggregation_runs: AtomicU64,
    aggregation_failures: AtomicU64,
    aggregation_micros: AtomicU64,
    aggregations_coalesced: AtomicU64,
    interval: Mutex<IntervalState>,
    latency: Mutex<LatencyWindow>,
}

impl StatsRegistry {
    pub fn new(latency_sample_size: usize) -> Self {
        Self {
            started: Instant::now(),
            total_inserts: AtomicU64::new(0),
            write_successes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            aggregation_runs: AtomicU64::new(0),
            aggregation_failures: AtomicU64::new(0),
            aggregation_micros: AtomicU64::new(0),
            aggregations_coalesced: AtomicU64::new(0),
            interval: Mutex::new(IntervalState::default()),
            latency: Mutex::new(LatencyWindow::new(latency_sample_size)),
        }
    }

    pub fn record_insert(&self, count: u64) {
        self.total_inserts.fetch_add(count, Ordering::Relaxed);
        lock(&self.interval).count += count;
    }

    /// Throughput meter for a successfully written batch.
    pub fn record_write_success(&self, points: u64) {
        self.write_successes.fetch_add(1, Ordering::Relaxed);
        self.record_insert(points);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_latency(&self, elapsed: Duration) {
        let millis = elapsed.as_secs_f64() * 1000.0;
        lock(&self.latency).push(millis);
    }

    pub fn record_aggregation(&self, elapsed: Duration) {
        self.aggregation_runs.fetch_add(1, Ordering::Relaxed);
        self.aggregation_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_aggregation_failure(&self) {
        self.aggregation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregation_coalesced(&self) {
        self.aggregations_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the running interval at `now_ms` and opens the next one.
    ///
    /// Returns `None` on the first call since there is no completed
    /// interval yet. Completed samples are also kept in an ordered set
    /// until the reporter pops them.
    pub fn start_new_interval(&self, now_ms: i64) -> Option<IntervalSample> {
        let mut state = lock(&self.interval);
        let previous = state.started_at.replace(now_ms);
        let count = std::mem::take(&mut state.count);
        let started_at = previous?;
        let sample = IntervalSample {
            timestamp: started_at,
            count,
        };
        state.completed.insert(sample);
        Some(sample)
    }

    /// Removes and returns the most recently completed interval.
    pub fn pop_latest_interval(&self) -> Option<IntervalSample> {
        lock(&self.interval).completed.pop_last()
    }

    pub fn pending_intervals(&self) -> usize {
        lock(&self.interval).completed.len()
    }

    pub fn snapshot_latency(&self) -> InsertionTimes {
        lock(&self.latency).snapshot()
    }

    pub fn total_inserts(&self) -> u64 {
        self.total_inserts.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn aggregation_runs(&self) -> u64 {
        self.aggregation_runs.load(Ordering::Relaxed)
    }

    pub fn aggregation_failures(&self) -> u64 {
        self.aggregation_failures.load(Ordering::Relaxed)
    }

    pub fn inserts_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_inserts() as f64 / elapsed
    }

    pub fn summary(&self) -> StatsSummary {
        let aggregation_runs = self.aggregation_runs();
        let mean_aggregation_ms = if aggregation_runs == 0 {
            0.0
        } else {
            self.aggregation_micros.load(Ordering::Relaxed) as f64
                / aggregation_runs as f64
                / 1000.0
        };
        StatsSummary {
            total_inserts: self.total_inserts(),
            write_successes: self.write_successes.load(Ordering::Relaxed),
            write_failures: self.write_failures(),
            aggregation_runs,
            aggregation_failures: self.aggregation_failures(),
            aggregations_coalesced: self.aggregations_coalesced.load(Ordering::Relaxed),
            mean_aggregation_ms,
            inserts_per_second: self.inserts_per_second(),
            insertion_times: self.snapshot_latency(),
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_SAMPLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_interval_start_reports_nothing() {
        let stats = StatsRegistry::default();
        stats.record_insert(5);
        assert_eq!(stats.start_new_interval(1_000), None);
        assert_eq!(stats.pending_intervals(), 0);
        assert_eq!(stats.total_inserts(), 5);
    }

    #[test]
    fn interval_counts_cover_inserts_between_starts() {
        let stats = StatsRegistry::default();
        assert_eq!(stats.start_new_interval(1_000), None);
        stats.record_insert(10);
        stats.record_insert(15);
        let first = stats.start_new_interval(2_000);
        stats.record_insert(7);
        let second = stats.start_new_interval(3_000);

        assert_eq!(
            first,
            Some(IntervalSample {
                timestamp: 1_000,
                count: 25
            })
        );
        assert_eq!(
            second,
            Some(IntervalSample {
                timestamp: 2_000,
                count: 7
            })
        );
        assert_eq!(stats.total_inserts(), 32);
        assert_eq!(stats.pending_intervals(), 2);
        assert_eq!(stats.pop_latest_interval(), second);
        assert_eq!(stats.pop_latest_interval(), first);
        assert_eq!(stats.pop_latest_interval(), None);
    }

    #[test]
    fn latency_window_keeps_most_recent_samples() {
        let stats = StatsRegistry::new(3);
        for ms in [100, 1, 2, 3] {
            stats.record_insert_latency(Duration::from_millis(ms));
        }
        let times = stats.snapshot_latency();
        assert!((times.max - 3.0).abs() < 1e-9);
        assert!((times.min - 1.0).abs() < 1e-9);
        assert!((times.mean - 2.0).abs() < 1e-9);
        assert!((times.stddev - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_latency_window_is_zeroed() {
        let stats = StatsRegistry::default();
        assert_eq!(stats.snapshot_latency(), InsertionTimes::default());
    }

    #[test]
    fn write_outcomes_feed_the_summary() {
        let stats = StatsRegistry::default();
        stats.record_write_success(100);
        stats.record_write_success(100);
        stats.record_write_failure();
        stats.record_aggregation(Duration::from_millis(4));
        stats.record_aggregation(Duration::from_millis(6));
        stats.record_aggregation_failure();
        stats.record_aggregation_coalesced();

        let summary = stats.summary();
        assert_eq!(summary.total_inserts, 200);
        assert_eq!(summary.write_successes, 2);
        assert_eq!(summary.write_failures, 1);
        assert_eq!(summary.aggregation_runs, 2);
        assert_eq!(summary.aggregation_failures, 1);
        assert_eq!(summary.aggregations_coalesced, 1);
        assert!((summary.mean_aggregation_ms - 5.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_inserts_are_not_lost() {
        let stats = Arc::new(StatsRegistry::default());
        stats.start_new_interval(0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_insert(1);
                        stats.record_insert_latency(Duration::from_micros(50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.total_inserts(), 8_000);
        assert_eq!(stats.start_new_interval(1).map(|s| s.count), Some(8_000));
    }
}
