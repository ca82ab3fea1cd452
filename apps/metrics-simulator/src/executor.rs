use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A scheduled-execution context: fixed-rate ticks plus tracked
/// fire-and-forget tasks, with a bounded wait-then-cancel shutdown.
#[derive(Debug)]
pub struct ScheduledExecutor {
    name: &'static str,
    stop: CancellationToken,
    kill: CancellationToken,
    tracker: TaskTracker,
}

impl ScheduledExecutor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invokes `tick` every `period`, starting immediately. Missed ticks are
    /// caught up in a burst so the long-run rate stays fixed. `tick` must not
    /// block.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_shutdown() {
            tracing::warn!(executor = self.name, "executor is shut down; schedule rejected");
            return;
        }
        let stop = self.stop.clone();
        let kill = self.kill.clone();
        let name = self.name;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = kill.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }
            tracing::debug!(executor = name, "fixed-rate schedule stopped");
        });
    }

    /// Runs `task` on the executor. Returns `false` when the executor no
    /// longer accepts work. Force-cancelled tasks are dropped at their next
    /// await point.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return false;
        }
        let kill = self.kill.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = kill.cancelled() => {}
                _ = task => {}
            }
        });
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stops new work, waits up to `bound` for in-flight tasks, then
    /// force-cancels whatever is left. Returns `true` when everything
    /// finished inside the bound.
    pub async fn shutdown(&self, bound: Duration) -> bool {
        self.stop.cancel();
        self.tracker.close();
        if tokio::time::timeout(bound, self.tracker.wait()).await.is_ok() {
            tracing::debug!(executor = self.name, "executor drained");
            return true;
        }
        tracing::warn!(
            executor = self.name,
            remaining = self.tracker.len(),
            bound_ms = bound.as_millis() as u64,
            "executor did not drain in time; cancelling remaining tasks"
        );
        self.kill.cancel();
        self.tracker.wait().await;
        false
    }

    /// Cancels everything without waiting for in-flight work to finish.
    pub async fn shutdown_now(&self) {
        self.stop.cancel();
        self.kill.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_a_fixed_rate_until_shutdown() {
        let executor = ScheduledExecutor::new("test");
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        executor.schedule_at_fixed_rate(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(executor.shutdown(Duration::from_secs(1)).await);
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 4);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tasks_are_cancelled_after_the_bound() {
        let executor = ScheduledExecutor::new("test");
        let finished = Arc::new(AtomicU64::new(0));
        let flag = finished.clone();
        assert!(executor.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!executor.shutdown(Duration::from_millis(50)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(executor.active_tasks(), 0);
        assert!(!executor.spawn(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn quick_tasks_drain_inside_the_bound() {
        let executor = ScheduledExecutor::new("test");
        let finished = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let flag = finished.clone();
            executor.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(executor.shutdown(Duration::from_secs(1)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_now_skips_the_drain() {
        let executor = ScheduledExecutor::new("test");
        let finished = Arc::new(AtomicU64::new(0));
        let flag = finished.clone();
        executor.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        });
        executor.shutdown_now().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(executor.is_shutdown());
    }
}
