use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "metrics-simulator",
    version,
    about = "Synthetic load generator for the metrics storage path"
)]
pub struct Args {
    /// JSON simulation plan. Defaults apply when omitted.
    pub plan: Option<PathBuf>,
    /// Overrides `simulation_time_ms` from the plan.
    #[arg(long)]
    pub duration_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    pub print_plan: bool,
}
