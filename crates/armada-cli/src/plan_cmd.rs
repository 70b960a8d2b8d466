//! `armada plan`: print the wave plan for a batch.

use std::io::{self, Write};
use std::path::PathBuf;

use tracing::info;

use armada_core::Config;
use armada_orchestration::scheduler::{
    OrchestrationPlan, SchedulerConfig, WaveScheduler, WorkItem,
};

use crate::{batch, render};

#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    /// JSON file holding an array of work items.
    pub batch: PathBuf,

    /// Print the plan as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Plan `items` with the scheduler settings from `config`.
pub fn plan_batch(items: &[WorkItem], config: &Config) -> anyhow::Result<OrchestrationPlan> {
    let scheduler = WaveScheduler::new(SchedulerConfig::from(&config.scheduler));
    let plan = scheduler.plan_execution(items)?;

    #[cfg(feature = "metrics")]
    armada_core::metrics::OrchestrationMeters::new().record_plan(
        plan.waves.len() as u64,
        plan.unscheduled.len() as u64,
        u64::from(plan.parallel_efficiency),
    );

    Ok(plan)
}

/// Execute the subcommand. Returns `false` when the plan is incomplete.
pub fn run(args: &PlanArgs, config: &Config) -> anyhow::Result<bool> {
    let items = batch::load_batch(&args.batch)?;
    info!(path = %args.batch.display(), items = items.len(), "Planning batch");
    let plan = plan_batch(&items, config)?;

    let mut out = io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &plan)?;
        writeln!(out)?;
        if let Err(e) = plan.check() {
            writeln!(io::stderr(), "{e}")?;
        }
    } else {
        render::write_plan(&mut out, &plan)?;
    }
    Ok(plan.is_complete())
}
