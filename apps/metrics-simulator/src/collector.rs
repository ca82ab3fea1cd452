use crate::error::StorageError;
use crate::executor::ScheduledExecutor;
use crate::stats::StatsRegistry;
use crate::storage::{complete_write, MeasurementBatch, MetricsStorage, WriteCallback};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing state of one simulated measurement schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRef {
    pub id: i64,
    pub interval_ms: i64,
    pub last_collection: i64,
    pub next_collection: i64,
}

impl ScheduleRef {
    pub fn new(id: i64, interval_ms: i64, start_ms: i64) -> Self {
        Self {
            id,
            interval_ms,
            last_collection: start_ms,
            next_collection: start_ms,
        }
    }

    /// Records a collection at `collected_at`. The next due time saturates
    /// at `i64::MAX` rather than wrapping.
    pub fn update(&mut self, collected_at: i64) {
        self.last_collection = collected_at;
        self.next_collection = collected_at.saturating_add(self.interval_ms);
    }
}

impl Ord for ScheduleRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_collection
            .cmp(&other.next_collection)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for ScheduleRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Splits `[0, n * batch_size)` into one contiguous id range per collector
/// and checks the ranges are pairwise disjoint.
pub fn partition_schedule_ids(
    num_collectors: usize,
    batch_size: usize,
) -> Result<Vec<Range<i64>>> {
    if num_collectors == 0 || batch_size == 0 {
        bail!("collector count and batch size must be positive ({num_collectors} x {batch_size})");
    }
    let width = i64::try_from(batch_size).context("batch size does not fit a schedule id")?;
    let mut ranges = Vec::with_capacity(num_collectors);
    for index in 0..num_collectors {
        let index = i64::try_from(index).context("collector index does not fit a schedule id")?;
        let start = index
            .checked_mul(width)
            .context("schedule id range overflows")?;
        let end = start.checked_add(width).context("schedule id range overflows")?;
        ranges.push(start..end);
    }
    for pair in ranges.windows(2) {
        if pair[0].end > pair[1].start {
            bail!("schedule id ranges {:?} and {:?} overlap", pair[0], pair[1]);
        }
    }
    Ok(ranges)
}

/// Produces one batch per tick for its id range and hands it to storage
/// without waiting for the write. Owned by the single tick closure that
/// drives it, so its schedules and RNG need no lock.
pub struct MeasurementCollector {
    index: usize,
    ids: Range<i64>,
    storage: Arc<dyn MetricsStorage>,
    stats: Arc<StatsRegistry>,
    executor: Arc<ScheduledExecutor>,
    schedules: Vec<ScheduleRef>,
    rng: SmallRng,
}

impl MeasurementCollector {
    pub fn new(
        index: usize,
        ids: Range<i64>,
        interval: Duration,
        storage: Arc<dyn MetricsStorage>,
        stats: Arc<StatsRegistry>,
        executor: Arc<ScheduledExecutor>,
        seed: Option<u64>,
    ) -> Self {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        let start_ms = Utc::now().timestamp_millis();
        let schedules = ids
            .clone()
            .map(|id| ScheduleRef::new(id, interval_ms, start_ms))
            .collect();
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(index as u64)),
            None => SmallRng::from_entropy(),
        };
        Self {
            index,
            ids,
            storage,
            stats,
            executor,
            schedules,
            rng,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ids(&self) -> Range<i64> {
        self.ids.clone()
    }

    pub fn run(&mut self) {
        let _ = self.run_at(Utc::now().timestamp_millis());
    }

    /// Issues one write stamped `now_ms`. Returns `false` when the tick was
    /// skipped because the executor is shutting down.
    pub fn run_at(&mut self, now_ms: i64) -> bool {
        if self.executor.is_shutdown() {
            return false;
        }

        let rng = &mut self.rng;
        let values: Vec<f64> = self
            .schedules
            .iter_mut()
            .map(|schedule| {
                schedule.update(now_ms);
                rng.gen_range(0.0..100.0)
            })
            .collect();
        let batch = MeasurementBatch::from_values(now_ms, self.ids.start, values);

        let points = batch.len() as u64;
        let issued_at = Instant::now();
        let write = self.storage.write(batch);
        let callback = CollectorCallback {
            collector: self.index,
            points,
            stats: self.stats.clone(),
        };
        if !self.executor.spawn(complete_write(write, issued_at, callback)) {
            tracing::debug!(collector = self.index, "executor closed; write dropped");
            return false;
        }
        tracing::trace!(collector = self.index, points, ts = now_ms, "issued batch write");
        true
    }

    pub fn next_collection(&self) -> Option<i64> {
        self.schedules
            .iter()
            .min()
            .map(|schedule| schedule.next_collection)
    }
}

struct CollectorCallback {
    collector: usize,
    points: u64,
    stats: Arc<StatsRegistry>,
}

impl WriteCallback for CollectorCallback {
    fn on_success(&self) {
        self.stats.record_write_success(self.points);
    }

    fn on_failure(&self, err: &StorageError) {
        self.stats.record_write_failure();
        tracing::warn!(
            collector = self.collector,
            points = self.points,
            error = %err,
            "batch write failed; continuing"
        );
    }

    fn on_finish(&self, elapsed: Duration) {
        self.stats.record_insert_latency(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NodeStateListener, WriteFuture};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Default)]
    struct RecordingStorage {
        writes: Mutex<Vec<Range<i64>>>,
        fail_writes: AtomicBool,
    }

    impl MetricsStorage for RecordingStorage {
        fn write(&self, batch: MeasurementBatch) -> WriteFuture {
            lock(&self.writes).push(batch.id_range());
            let fail = self.fail_writes.load(AtomicOrdering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(StorageError::WriteRejected("overloaded".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn compute_aggregates(&self, _start_id: i64, _count: usize) -> Result<(), StorageError> {
            Ok(())
        }

        fn register_node_listener(&self, _listener: Arc<dyn NodeStateListener>) {}
    }

    fn collectors(
        storage: Arc<RecordingStorage>,
        stats: Arc<StatsRegistry>,
        executor: Arc<ScheduledExecutor>,
    ) -> Vec<MeasurementCollector> {
        partition_schedule_ids(4, 100)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(index, ids)| {
                MeasurementCollector::new(
                    index,
                    ids,
                    Duration::from_secs(30),
                    storage.clone(),
                    stats.clone(),
                    executor.clone(),
                    Some(7),
                )
            })
            .collect()
    }

    proptest! {
        #[test]
        fn partitions_are_disjoint_and_cover_every_id(n in 1usize..64, b in 1usize..10_000) {
            let ranges = partition_schedule_ids(n, b).unwrap();
            prop_assert_eq!(ranges.len(), n);
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges[n - 1].end, (n * b) as i64);
            for (i, left) in ranges.iter().enumerate() {
                prop_assert_eq!(left.end - left.start, b as i64);
                for right in &ranges[i + 1..] {
                    prop_assert!(left.end <= right.start);
                }
            }
        }
    }

    #[test]
    fn partition_edges() {
        let ranges = partition_schedule_ids(4, 100).unwrap();
        assert_eq!(ranges, vec![0..100, 100..200, 200..300, 300..400]);
        assert!(partition_schedule_ids(0, 10).is_err());
        assert!(partition_schedule_ids(3, 0).is_err());
        assert!(partition_schedule_ids(2, usize::MAX).is_err());
    }

    #[test]
    fn schedule_refs_order_by_next_collection() {
        let mut early = ScheduleRef::new(9, 1_000, 0);
        let mut late = ScheduleRef::new(1, 1_000, 0);
        early.update(5_000);
        late.update(8_000);
        assert_eq!(early.next_collection, 6_000);
        assert!(early < late);

        let tie = ScheduleRef::new(2, 1_000, 0);
        let other = ScheduleRef::new(3, 1_000, 0);
        assert!(tie < other);
    }

    #[test]
    fn huge_interval_saturates_next_collection() {
        let mut schedule = ScheduleRef::new(0, i64::MAX, 0);
        schedule.update(1_700_000_000_000);
        assert_eq!(schedule.last_collection, 1_700_000_000_000);
        assert_eq!(schedule.next_collection, i64::MAX);
    }

    #[tokio::test]
    async fn collector_with_huge_interval_keeps_ticking() {
        let storage = Arc::new(RecordingStorage::default());
        let stats = Arc::new(StatsRegistry::default());
        let executor = Arc::new(ScheduledExecutor::new("collectors"));
        let mut collector = MeasurementCollector::new(
            0,
            0..10,
            Duration::from_secs(u64::MAX),
            storage.clone(),
            stats.clone(),
            executor.clone(),
            Some(3),
        );

        assert!(collector.run_at(1_700_000_000_000));
        assert!(collector.run_at(1_700_000_000_001));
        assert!(executor.shutdown(Duration::from_secs(1)).await);

        assert_eq!(collector.next_collection(), Some(i64::MAX));
        assert_eq!(lock(&storage.writes).len(), 2);
        assert_eq!(stats.total_inserts(), 20);
    }

    #[tokio::test]
    async fn one_tick_per_collector_covers_every_id() {
        let storage = Arc::new(RecordingStorage::default());
        let stats = Arc::new(StatsRegistry::default());
        let executor = Arc::new(ScheduledExecutor::new("collectors"));
        let mut collectors = collectors(storage.clone(), stats.clone(), executor.clone());

        for collector in collectors.iter_mut() {
            assert!(collector.run_at(1_700_000_000_000));
        }
        assert!(executor.shutdown(Duration::from_secs(1)).await);

        let mut writes = lock(&storage.writes).clone();
        writes.sort_by_key(|range| range.start);
        assert_eq!(writes, vec![0..100, 100..200, 200..300, 300..400]);
        assert_eq!(stats.total_inserts(), 400);
        assert_eq!(collectors[0].next_collection(), Some(1_700_000_000_000 + 30_000));
    }

    #[tokio::test]
    async fn write_failures_are_contained() {
        let storage = Arc::new(RecordingStorage::default());
        storage.fail_writes.store(true, AtomicOrdering::SeqCst);
        let stats = Arc::new(StatsRegistry::default());
        let executor = Arc::new(ScheduledExecutor::new("collectors"));
        let mut collectors = collectors(storage, stats.clone(), executor.clone());

        for collector in collectors.iter_mut() {
            collector.run_at(1_700_000_000_000);
        }
        assert!(executor.shutdown(Duration::from_secs(1)).await);

        assert_eq!(stats.write_failures(), 4);
        assert_eq!(stats.total_inserts(), 0);
        assert!(stats.snapshot_latency().max >= stats.snapshot_latency().min);
    }

    #[tokio::test]
    async fn ticks_after_shutdown_are_skipped() {
        let storage = Arc::new(RecordingStorage::default());
        let stats = Arc::new(StatsRegistry::default());
        let executor = Arc::new(ScheduledExecutor::new("collectors"));
        let mut collectors = collectors(storage.clone(), stats, executor.clone());
        executor.shutdown_now().await;
        assert!(!collectors[0].run_at(1));
        assert!(lock(&storage.writes).is_empty());
    }
}
