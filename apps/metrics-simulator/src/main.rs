use anyhow::{Context, Result};
use clap::Parser;
use metrics_simulator::cli;
use metrics_simulator::config::SimulationPlan;
use metrics_simulator::simulator::Simulator;
use metrics_simulator::storage::MemoryStorage;
use std::process::ExitCode;
use std::sync::Arc;

fn init_tracing(plan: &SimulationPlan) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,metrics_simulator=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &plan.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "metrics-simulator"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn run(args: cli::Args, plan: SimulationPlan) -> Result<ExitCode> {
    init_tracing(&plan)?;
    plan.validate().context("invalid simulation plan")?;
    if args.print_plan {
        tracing::info!(plan = ?plan, "resolved simulation plan");
        return Ok(ExitCode::SUCCESS);
    }

    let otlp_enabled = plan.otlp_endpoint.is_some();
    let storage = MemoryStorage::new(plan.storage_config()?);
    let simulator = Simulator::new(plan, Arc::new(storage))?;
    let report = simulator.run().await?;

    if otlp_enabled {
        opentelemetry::global::shutdown_tracer_provider();
    }
    Ok(ExitCode::from(report.exit_code))
}

fn main() -> Result<ExitCode> {
    let args = cli::Args::parse();
    let mut plan = SimulationPlan::load(args.plan.as_deref())?;
    if let Some(duration_ms) = args.duration_ms {
        plan.simulation_time_ms = duration_ms;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(plan.thread_pool_size())
        .thread_name("simulator-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(args, plan))
}
