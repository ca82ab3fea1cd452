use super::{MeasurementBatch, MetricsStorage, NodeStateListener, WriteFuture};
use crate::error::StorageError;
use crate::time_slice::{Granularity, TimeSlices};
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    pub nodes: Vec<String>,
    pub write_latency: Duration,
    pub write_failure_rate: f64,
    pub time_slices: TimeSlices,
    pub seed: Option<u64>,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1".to_string()],
            write_latency: Duration::ZERO,
            write_failure_rate: 0.0,
            time_slices: TimeSlices::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Aggregate {
    fn of(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    fn merge(&mut self, other: &Aggregate) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

#[derive(Debug, Default)]
struct StoreState {
    /// (timestamp, schedule id) -> value, for points not yet rolled up.
    raw: BTreeMap<(i64, i64), f64>,
    /// (tier, slice start, schedule id) -> aggregate.
    rollups: BTreeMap<(Granularity, i64, i64), Aggregate>,
    /// Mid slices updated since their coarse slice was last recomputed.
    dirty_mid: BTreeSet<(i64, i64)>,
}

struct Inner {
    config: MemoryStorageConfig,
    state: Mutex<StoreState>,
    down_nodes: Mutex<BTreeSet<String>>,
    listeners: Mutex<Vec<Arc<dyn NodeStateListener>>>,
    rng: Mutex<SmallRng>,
    fail_aggregations: AtomicBool,
    write_calls: AtomicU64,
    points_written: AtomicU64,
    aggregation_calls: AtomicU64,
}

impl Inner {
    fn first_down_node(&self) -> Option<String> {
        lock(&self.down_nodes).iter().next().cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process stand-in for the storage cluster. Raw points are rolled into
/// mid slices once their raw slice has closed, and coarse slices are
/// recomputed from their mid slices once those close.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(StoreState::default()),
                down_nodes: Mutex::new(BTreeSet::new()),
                listeners: Mutex::new(Vec::new()),
                rng: Mutex::new(rng),
                fail_aggregations: AtomicBool::new(false),
                write_calls: AtomicU64::new(0),
                points_written: AtomicU64::new(0),
                aggregation_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.inner.config.nodes
    }

    /// Makes every subsequent aggregation pass fail.
    pub fn fail_aggregations(&self, fail: bool) {
        self.inner.fail_aggregations.store(fail, Ordering::SeqCst);
    }

    /// Marks `node` down and notifies registered listeners on the calling
    /// thread. Writes and aggregation passes fail while any node is down.
    /// Listeners hear about the loss before any call can observe it.
    pub fn mark_node_down(&self, node: &str) {
        if lock(&self.inner.down_nodes).contains(node) {
            return;
        }
        tracing::warn!(node, "storage node marked down");
        let listeners = lock(&self.inner.listeners).clone();
        for listener in listeners {
            listener.on_down(node);
        }
        lock(&self.inner.down_nodes).insert(node.to_string());
    }

    pub fn mark_node_up(&self, node: &str) {
        if !lock(&self.inner.down_nodes).remove(node) {
            return;
        }
        tracing::info!(node, "storage node marked up");
        let listeners = lock(&self.inner.listeners).clone();
        for listener in listeners {
            listener.on_up(node);
        }
    }

    pub fn write_calls(&self) -> u64 {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    pub fn points_written(&self) -> u64 {
        self.inner.points_written.load(Ordering::SeqCst)
    }

    pub fn aggregation_calls(&self) -> u64 {
        self.inner.aggregation_calls.load(Ordering::SeqCst)
    }

    /// Points still waiting to be rolled into a mid slice.
    pub fn raw_point_count(&self) -> usize {
        lock(&self.inner.state).raw.len()
    }

    pub fn aggregate(
        &self,
        granularity: Granularity,
        slice: i64,
        schedule_id: i64,
    ) -> Option<Aggregate> {
        lock(&self.inner.state)
            .rollups
            .get(&(granularity, slice, schedule_id))
            .copied()
    }

    pub fn rollup_count(&self, granularity: Granularity) -> usize {
        lock(&self.inner.state)
            .rollups
            .keys()
            .filter(|(tier, _, _)| *tier == granularity)
            .count()
    }

    pub fn compute_aggregates_at(
        &self,
        start_id: i64,
        count: usize,
        now_ms: i64,
    ) -> Result<(), StorageError> {
        self.inner.aggregation_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_aggregations.load(Ordering::SeqCst) {
            return Err(StorageError::AggregationFailed(
                "injected aggregation failure".to_string(),
            ));
        }
        if let Some(node) = self.inner.first_down_node() {
            return Err(StorageError::NodeUnavailable(node));
        }

        let slices = self.inner.config.time_slices;
        let ids = start_id..start_id.saturating_add(count as i64);
        let raw_cutoff = slices.quantize(now_ms, Granularity::Raw);
        let mid_cutoff = slices.quantize(now_ms, Granularity::Mid);

        let mut state = lock(&self.inner.state);
        let StoreState {
            raw,
            rollups,
            dirty_mid,
        } = &mut *state;

        let closed: Vec<(i64, i64)> = raw
            .range(..(raw_cutoff, i64::MIN))
            .filter(|((_, id), _)| ids.contains(id))
            .map(|(key, _)| *key)
            .collect();
        for key in &closed {
            let Some(value) = raw.remove(key) else {
                continue;
            };
            let (timestamp, id) = *key;
            let mid_slice = slices.quantize(timestamp, Granularity::Mid);
            rollups
                .entry((Granularity::Mid, mid_slice, id))
                .and_modify(|agg| agg.merge(&Aggregate::of(value)))
                .or_insert_with(|| Aggregate::of(value));
            dirty_mid.insert((mid_slice, id));
        }

        let ready: Vec<(i64, i64)> = dirty_mid
            .range(..(mid_cutoff, i64::MIN))
            .copied()
            .collect();
        let coarse_width = slices.width(Granularity::Coarse);
        let mut recomputed = BTreeSet::new();
        for key in &ready {
            dirty_mid.remove(key);
            let (mid_slice, id) = *key;
            let coarse_slice = slices.quantize(mid_slice, Granularity::Coarse);
            if !recomputed.insert((coarse_slice, id)) {
                continue;
            }
            let mut total: Option<Aggregate> = None;
            for (_, agg) in rollups
                .range(
                    (Granularity::Mid, coarse_slice, i64::MIN)
                        ..(Granularity::Mid, coarse_slice + coarse_width, i64::MIN),
                )
                .filter(|((_, _, mid_id), _)| *mid_id == id)
            {
                match total.as_mut() {
                    Some(acc) => acc.merge(agg),
                    None => total = Some(*agg),
                }
            }
            if let Some(total) = total {
                rollups.insert((Granularity::Coarse, coarse_slice, id), total);
            }
        }

        tracing::debug!(
            rolled_raw = closed.len(),
            recomputed_coarse = recomputed.len(),
            "aggregation pass complete"
        );
        Ok(())
    }
}

impl MetricsStorage for MemoryStorage {
    fn write(&self, batch: MeasurementBatch) -> WriteFuture {
        self.inner.write_calls.fetch_add(1, Ordering::SeqCst);
        let failure_rate = self.inner.config.write_failure_rate;
        let rejected = failure_rate > 0.0 && lock(&self.inner.rng).gen::<f64>() < failure_rate;
        let latency = self.inner.config.write_latency;
        let inner = self.inner.clone();

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Some(node) = inner.first_down_node() {
                return Err(StorageError::NodeUnavailable(node));
            }
            if rejected {
                return Err(StorageError::WriteRejected(
                    "simulated write failure".to_string(),
                ));
            }
            let mut state = lock(&inner.state);
            for point in batch.points() {
                state
                    .raw
                    .insert((point.timestamp, point.schedule_id), point.value);
            }
            inner
                .points_written
                .fetch_add(batch.len() as u64, Ordering::SeqCst);
            Ok(())
        })
    }

    fn compute_aggregates(&self, start_id: i64, count: usize) -> Result<(), StorageError> {
        self.compute_aggregates_at(start_id, count, Utc::now().timestamp_millis())
    }

    fn register_node_listener(&self, listener: Arc<dyn NodeStateListener>) {
        lock(&self.inner.listeners).push(listener);
    }
}
