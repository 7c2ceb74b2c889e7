use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hanko_jobs_export::ExportProcessor;
use hanko_jobs_core::WorkerKind;
use hanko_jobs_worker::cli::{PolicyArgs, RuntimeArgs};
use hanko_jobs_worker::{WorkerConfig, serve, wiring};

/// Consumes analytics export jobs.
#[derive(Debug, Parser)]
#[command(name = "export-worker")]
struct Cli {
    /// Subscription for export jobs
    #[arg(long, env = "JOB_EXPORT_SUBSCRIPTION")]
    subscription: Option<String>,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(flatten)]
    policy: PolicyArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    hanko_jobs_observability::init();
    let cli = Cli::parse();
    hanko_jobs_worker::exit_code("export-worker", run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let handler = wiring::export_handler()?;

    let config = WorkerConfig {
        project_id: cli.runtime.project_or(""),
        subscription_id: cli.subscription.unwrap_or_default(),
        worker_name: cli.runtime.worker_or("export-worker"),
        skip_subscription_check: cli.runtime.skip_subscription_check(),
        broker_url: cli.runtime.broker_url.clone(),
        receive_settings: cli.runtime.receive_settings(),
        subscription_policy: Some(cli.policy.policy_for(WorkerKind::Export)),
    };
    serve(config, Arc::new(ExportProcessor::new(Some(handler)))).await
}
