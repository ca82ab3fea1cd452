mod memory;

pub use memory::{Aggregate, MemoryStorage, MemoryStorageConfig};

use crate::error::StorageError;
use futures::future::BoxFuture;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: i64,
    pub schedule_id: i64,
    pub value: f64,
}

/// Points produced by one collector tick. All points share `timestamp` and
/// carry distinct schedule ids, so the batch is a set keyed by
/// (timestamp, schedule id).
#[derive(Debug, Clone)]
pub struct MeasurementBatch {
    timestamp: i64,
    points: Vec<DataPoint>,
}

impl MeasurementBatch {
    pub fn from_values<I>(timestamp: i64, start_id: i64, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let points = values
            .into_iter()
            .zip(start_id..)
            .map(|(value, schedule_id)| DataPoint {
                timestamp,
                schedule_id,
                value,
            })
            .collect();
        Self { timestamp, points }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn id_range(&self) -> Range<i64> {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => first.schedule_id..last.schedule_id + 1,
            _ => 0..0,
        }
    }
}

pub type WriteFuture = BoxFuture<'static, Result<(), StorageError>>;

/// Receives cluster membership changes. Events may arrive on any thread.
pub trait NodeStateListener: Send + Sync {
    fn on_down(&self, node: &str);
    fn on_up(&self, node: &str);
}

pub trait MetricsStorage: Send + Sync {
    /// Starts an asynchronous batch write. Must return without blocking;
    /// the returned future resolves when the write completes.
    fn write(&self, batch: MeasurementBatch) -> WriteFuture;

    /// Rolls up every schedule in `[start_id, start_id + count)`. Blocks the
    /// calling thread for the duration of the pass.
    fn compute_aggregates(&self, start_id: i64, count: usize) -> Result<(), StorageError>;

    fn register_node_listener(&self, listener: Arc<dyn NodeStateListener>);
}

pub trait WriteCallback: Send {
    fn on_success(&self);
    fn on_failure(&self, err: &StorageError);
    fn on_finish(&self, elapsed: Duration);
}

/// Drives a pending write to completion and dispatches its callbacks.
/// `issued_at` is when the write was handed to storage.
pub async fn complete_write<C: WriteCallback>(write: WriteFuture, issued_at: Instant, callback: C) {
    match write.await {
        Ok(()) => callback.on_success(),
        Err(err) => callback.on_failure(&err),
    }
    callback.on_finish(issued_at.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn batch_spans_contiguous_ids() {
        let batch = MeasurementBatch::from_values(42, 100, vec![1.0, 2.0, 3.0]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.id_range(), 100..103);
        assert!(batch.points().iter().all(|p| p.timestamp == 42));
        assert_eq!(MeasurementBatch::from_values(1, 5, Vec::new()).id_range(), 0..0);
    }

    #[derive(Default)]
    struct Counts {
        success: AtomicU64,
        failure: AtomicU64,
        finish: AtomicU64,
    }

    struct Recorder<'a>(&'a Counts);

    impl WriteCallback for Recorder<'_> {
        fn on_success(&self) {
            self.0.success.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _err: &StorageError) {
            self.0.failure.fetch_add(1, Ordering::SeqCst);
        }

        fn on_finish(&self, _elapsed: Duration) {
            self.0.finish.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn callbacks_fire_once_per_outcome() {
        let counts = Counts::default();
        complete_write(Box::pin(async { Ok(()) }), Instant::now(), Recorder(&counts)).await;
        complete_write(
            Box::pin(async { Err(StorageError::WriteRejected("full".into())) }),
            Instant::now(),
            Recorder(&counts),
        )
        .await;
        assert_eq!(counts.success.load(Ordering::SeqCst), 1);
        assert_eq!(counts.failure.load(Ordering::SeqCst), 1);
        assert_eq!(counts.finish.load(Ordering::SeqCst), 2);
    }
}
