//! Wires the collectors, the aggregation trigger and the reporter from a
//! resolved plan, runs them for the configured duration and hands control
//! to the shutdown controller.

use crate::aggregator::{AggregationQueue, MeasurementAggregator};
use crate::collector::{partition_schedule_ids, MeasurementCollector};
use crate::config::SimulationPlan;
use crate::executor::ScheduledExecutor;
use crate::reporter::StatsReporter;
use crate::shutdown::{ShutdownController, ShutdownReport, ShutdownTargets};
use crate::stats::StatsRegistry;
use crate::storage::MetricsStorage;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;


pub struct Simulator {
    plan: SimulationPlan,
    storage: Arc<dyn MetricsStorage>,
}

impl Simulator {
    pub fn new(plan: SimulationPlan, storage: Arc<dyn MetricsStorage>) -> Result<Self> {
        plan.validate().context("invalid simulation plan")?;
        Ok(Self { plan, storage })
    }

    pub fn plan(&self) -> &SimulationPlan {
        &self.plan
    }

    /// Runs until the simulation time elapses, a fatal condition occurs, or
    /// the process receives Ctrl-C.
    pub async fn run(&self) -> Result<ShutdownReport> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                futures::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`Simulator::run`], with `interrupt` standing in for the signal.
    pub async fn run_until<F>(&self, interrupt: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let plan = &self.plan;
        let stats = Arc::new(StatsRegistry::new(plan.latency_sample_size));
        let shutdown = Arc::new(ShutdownController::new());
        self.storage.register_node_listener(shutdown.clone());

        let ranges = partition_schedule_ids(plan.num_measurement_collectors, plan.batch_size)?;
        let queue = Arc::new(AggregationQueue::start(plan.backlog_policy()?)?);
        let collectors = Arc::new(ScheduledExecutor::new("collectors"));
        let aggregator = ScheduledExecutor::new("aggregator");
        let reporter = ScheduledExecutor::new("reporter");

        tracing::info!(
            collectors = plan.num_measurement_collectors,
            batch_size = plan.batch_size,
            collection_interval_ms = plan.collection_interval_ms,
            aggregation_interval_ms = plan.aggregation_interval_ms,
            simulation_time_ms = plan.simulation_time_ms,
            backlog = ?queue.policy(),
            nodes = ?plan.node_addresses(),
            "starting simulation"
        );

        for (index, ids) in ranges.into_iter().enumerate() {
            let mut collector = MeasurementCollector::new(
                index,
                ids,
                plan.collection_interval(),
                self.storage.clone(),
                stats.clone(),
                collectors.clone(),
                plan.seed,
            );
            tracing::debug!(collector = index, ids = ?collector.ids(), "scheduling collector");
            collectors.schedule_at_fixed_rate(plan.collection_interval(), move || collector.run());
        }

        let trigger = MeasurementAggregator::new(
            queue.clone(),
            self.storage.clone(),
            stats.clone(),
            shutdown.clone(),
            0,
            plan.schedule_id_count(),
        );
        aggregator.schedule_at_fixed_rate(plan.aggregation_interval(), move || {
            trigger.run();
        });

        let stats_reporter = StatsReporter::new(stats.clone());
        reporter.schedule_at_fixed_rate(plan.metrics_report_interval(), move || {
            stats_reporter.run();
        });

        tokio::pin!(interrupt);
        tokio::select! {
            _ = tokio::time::sleep(plan.simulation_time()) => {
                shutdown.complete();
            }
            _ = shutdown.triggered() => {}
            _ = &mut interrupt => {
                tracing::warn!("interrupt received");
                shutdown.interrupt();
            }
        }

        shutdown
            .shut_down(ShutdownTargets {
                collectors: &collectors,
                aggregator: &aggregator,
                reporter: &reporter,
                queue: &queue,
                stats: &stats,
                collector_timeout: plan.collector_shutdown_timeout(),
                aggregator_timeout: plan.aggregator_shutdown_timeout(),
            })
            .await
            .context("shutdown sequence ran more than once")
    }
}
