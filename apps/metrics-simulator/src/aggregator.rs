//! Aggregation trigger and the single-worker queue that serializes passes.
//!
//! The trigger only enqueues; the storage call runs on the queue's
//! dedicated thread, so at most one pass executes at any moment and passes
//! complete in submission order.

use crate::shutdown::{ShutdownCause, ShutdownController};
use crate::stats::StatsRegistry;
use crate::storage::MetricsStorage;
use anyhow::{bail, Context, Result};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

pub type Job = Box<dyn FnOnce(u64) + Send + 'static>;

/// What happens when the trigger fires while a pass is already waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogPolicy {
    /// Unbounded FIFO; every trigger eventually runs.
    Queue,
    /// At most one waiting pass; extra triggers are logged no-ops.
    Coalesce,
}

impl FromStr for BacklogPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" | "fifo" => Ok(BacklogPolicy::Queue),
            "coalesce" => Ok(BacklogPolicy::Coalesce),
            other => {
                bail!("unknown aggregation backlog policy `{other}` (expected queue or coalesce)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued(u64),
    Coalesced,
    Rejected,
}

enum QueueCommand {
    Run { seq: u64, job: Job },
    Drain,
}

pub struct AggregationQueue {
    tx: mpsc::UnboundedSender<QueueCommand>,
    policy: BacklogPolicy,
    accepting: AtomicBool,
    drain_sent: AtomicBool,
    waiting: Arc<AtomicBool>,
    next_seq: AtomicU64,
    backlog: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    done: watch::Receiver<bool>,
}

impl AggregationQueue {
    pub fn start(policy: BacklogPolicy) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<QueueCommand>();
        let (done_tx, done) = watch::channel(false);
        let waiting = Arc::new(AtomicBool::new(false));
        let backlog = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            rx,
            waiting: waiting.clone(),
            backlog: backlog.clone(),
            completed: completed.clone(),
            done: done_tx,
        };
        std::thread::Builder::new()
            .name("aggregation-queue".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn aggregation queue thread")?;

        Ok(Self {
            tx,
            policy,
            accepting: AtomicBool::new(true),
            drain_sent: AtomicBool::new(false),
            waiting,
            next_seq: AtomicU64::new(0),
            backlog,
            completed,
            done,
        })
    }

    pub fn policy(&self) -> BacklogPolicy {
        self.policy
    }

    pub fn submit(&self, job: Job) -> Submission {
        if !self.accepting.load(Ordering::Acquire) {
            return Submission::Rejected;
        }
        if self.policy == BacklogPolicy::Coalesce && self.waiting.swap(true, Ordering::AcqRel) {
            return Submission::Coalesced;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(QueueCommand::Run { seq, job }).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            self.waiting.store(false, Ordering::Release);
            return Submission::Rejected;
        }
        Submission::Queued(seq)
    }

    /// Passes submitted but not yet started.
    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Stops accepting passes without waiting for the backlog.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Stops accepting passes and waits, without a bound, for every queued
    /// pass to finish.
    pub async fn shutdown(&self) {
        self.close();
        if !self.drain_sent.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(QueueCommand::Drain);
        }
        self.await_termination().await;
    }

    pub async fn await_termination(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    waiting: Arc<AtomicBool>,
    backlog: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    done: watch::Sender<bool>,
}

impl Worker {
    fn run(mut self) {
        while let Some(command) = self.rx.blocking_recv() {
            match command {
                QueueCommand::Run { seq, job } => {
                    self.waiting.store(false, Ordering::Release);
                    self.backlog.fetch_sub(1, Ordering::AcqRel);
                    job(seq);
                    self.completed.fetch_add(1, Ordering::AcqRel);
                }
                QueueCommand::Drain => break,
            }
        }
        tracing::debug!(
            completed = self.completed.load(Ordering::Acquire),
            "aggregation queue drained"
        );
        let _ = self.done.send(true);
    }
}

struct AggregationPass {
    storage: Arc<dyn MetricsStorage>,
    stats: Arc<StatsRegistry>,
    shutdown: Arc<ShutdownController>,
    start_id: i64,
    count: usize,
    failed: AtomicBool,
}

impl AggregationPass {
    fn execute(&self, seq: u64) {
        if self.failed.load(Ordering::Acquire) {
            tracing::warn!(seq, "skipping aggregation pass after an earlier failure");
            return;
        }

        let started = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.storage.compute_aggregates(self.start_id, self.count)
        }));
        let elapsed = started.elapsed();

        let reason = match result {
            Ok(Ok(())) => {
                self.stats.record_aggregation(elapsed);
                tracing::info!(
                    seq,
                    schedules = self.count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "aggregation pass finished"
                );
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        self.failed.store(true, Ordering::Release);
        self.stats.record_aggregation_failure();
        tracing::error!(seq, error = %reason, "aggregation pass failed");
        self.shutdown
            .fatal(ShutdownCause::AggregationFailed(reason));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "aggregation panicked".to_string()
}

/// Fixed-rate trigger that hands one pass over `[start_id, start_id + count)`
/// to the queue per tick.
pub struct MeasurementAggregator {
    queue: Arc<AggregationQueue>,
    pass: Arc<AggregationPass>,
}

impl MeasurementAggregator {
    pub fn new(
        queue: Arc<AggregationQueue>,
        storage: Arc<dyn MetricsStorage>,
        stats: Arc<StatsRegistry>,
        shutdown: Arc<ShutdownController>,
        start_id: i64,
        count: usize,
    ) -> Self {
        Self {
            queue,
            pass: Arc::new(AggregationPass {
                storage,
                stats,
                shutdown,
                start_id,
                count,
                failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn run(&self) -> Submission {
        let pass = self.pass.clone();
        let submission = self.queue.submit(Box::new(move |seq| pass.execute(seq)));
        match submission {
            Submission::Queued(seq) => {
                tracing::trace!(seq, backlog = self.queue.backlog(), "queued aggregation pass");
            }
            Submission::Coalesced => {
                self.pass.stats.record_aggregation_coalesced();
                tracing::debug!("aggregation pass already waiting; trigger coalesced");
            }
            Submission::Rejected => {
                tracing::debug!("aggregation queue closed; trigger ignored");
            }
        }
        submission
    }
}
