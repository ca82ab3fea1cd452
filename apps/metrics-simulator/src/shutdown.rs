//! Single point that turns any stop condition into an ordered termination.
//!
//! `RUNNING -> SHUTTING_DOWN` is a compare-and-swap, so racing triggers (a
//! node-loss event and normal completion, say) run the sequence once. The
//! first trigger's cause decides the exit code.

use crate::aggregator::AggregationQueue;
use crate::executor::ScheduledExecutor;
use crate::reporter;
use crate::stats::{StatsRegistry, StatsSummary};
use crate::storage::NodeStateListener;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Running,
            1 => RunState::ShuttingDown,
            _ => RunState::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Completed,
    Interrupted,
    AggregationFailed(String),
    NodeLost(String),
}

impl ShutdownCause {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownCause::Completed => EXIT_OK,
            ShutdownCause::Interrupted => EXIT_INTERRUPTED,
            ShutdownCause::AggregationFailed(_) | ShutdownCause::NodeLost(_) => EXIT_FATAL,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.exit_code() == EXIT_FATAL
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Completed => f.write_str("simulation completed"),
            ShutdownCause::Interrupted => f.write_str("interrupted"),
            ShutdownCause::AggregationFailed(reason) => write!(f, "aggregation failed: {reason}"),
            ShutdownCause::NodeLost(node) => write!(f, "storage node {node} lost"),
        }
    }
}

/// Everything the shutdown sequence stops, in the order it stops them.
pub struct ShutdownTargets<'a> {
    pub collectors: &'a ScheduledExecutor,
    pub aggregator: &'a ScheduledExecutor,
    pub reporter: &'a ScheduledExecutor,
    pub queue: &'a AggregationQueue,
    pub stats: &'a StatsRegistry,
    pub collector_timeout: Duration,
    pub aggregator_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub cause: ShutdownCause,
    pub exit_code: u8,
    pub collectors_drained: bool,
    pub aggregator_drained: bool,
    pub summary: StatsSummary,
}

#[derive(Debug)]
pub struct ShutdownController {
    state: AtomicU8,
    cause: OnceLock<ShutdownCause>,
    triggered: CancellationToken,
    sequence_started: AtomicBool,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Running as u8),
            cause: OnceLock::new(),
            triggered: CancellationToken::new(),
            sequence_started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn cause(&self) -> Option<&ShutdownCause> {
        self.cause.get()
    }

    /// Moves the run to `SHUTTING_DOWN`. Returns `false` when another
    /// trigger got there first.
    pub fn request(&self, cause: ShutdownCause) -> bool {
        let won = self
            .state
            .compare_exchange(
                RunState::Running as u8,
                RunState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !won {
            tracing::debug!(%cause, "shutdown already in progress; ignoring trigger");
            return false;
        }
        if cause.is_fatal() {
            tracing::error!(%cause, "fatal condition; shutting down");
        } else {
            tracing::info!(%cause, "shutting down");
        }
        let _ = self.cause.set(cause);
        self.triggered.cancel();
        true
    }

    pub fn complete(&self) -> bool {
        self.request(ShutdownCause::Completed)
    }

    pub fn interrupt(&self) -> bool {
        self.request(ShutdownCause::Interrupted)
    }

    pub fn fatal(&self, cause: ShutdownCause) -> bool {
        self.request(cause)
    }

    /// Resolves once any trigger has fired.
    pub async fn triggered(&self) {
        self.triggered.cancelled().await
    }

    /// Runs the ordered shutdown sequence. Returns `None` if it already ran.
    pub async fn shut_down(&self, targets: ShutdownTargets<'_>) -> Option<ShutdownReport> {
        if self.sequence_started.swap(true, Ordering::AcqRel) {
            tracing::warn!("shutdown sequence already executed");
            return None;
        }
        self.complete();
        let cause = self.cause().cloned().unwrap_or(ShutdownCause::Completed);

        let (collectors_drained, aggregator_drained) = match &cause {
            ShutdownCause::NodeLost(node) => {
                tracing::error!(node = %node, "skipping drain after storage node loss");
                targets.collectors.shutdown_now().await;
                targets.aggregator.shutdown_now().await;
                targets.queue.close();
                (false, false)
            }
            _ => {
                let collectors_drained =
                    targets.collectors.shutdown(targets.collector_timeout).await;
                let aggregator_drained =
                    targets.aggregator.shutdown(targets.aggregator_timeout).await;
                tracing::info!(
                    backlog = targets.queue.backlog(),
                    "waiting for queued aggregation passes"
                );
                targets.queue.shutdown().await;
                (collectors_drained, aggregator_drained)
            }
        };

        targets.reporter.shutdown_now().await;
        let summary = reporter::report_final(targets.stats, &cause);
        self.state.store(RunState::Stopped as u8, Ordering::Release);

        Some(ShutdownReport {
            exit_code: cause.exit_code(),
            cause,
            collectors_drained,
            aggregator_drained,
            summary,
        })
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStateListener for ShutdownController {
    fn on_down(&self, node: &str) {
        self.fatal(ShutdownCause::NodeLost(node.to_string()));
    }

    fn on_up(&self, node: &str) {
        tracing::info!(node, "storage node up");
    }
}
