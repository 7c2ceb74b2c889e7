use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hanko_jobs_invoicing::InvoiceProcessor;
use hanko_jobs_core::WorkerKind;
use hanko_jobs_worker::cli::{PolicyArgs, RuntimeArgs};
use hanko_jobs_worker::{WorkerConfig, serve, wiring};

/// Consumes invoice issuance jobs.
#[derive(Debug, Parser)]
#[command(name = "invoice-worker")]
struct Cli {
    /// Subscription for invoice jobs
    #[arg(long, env = "JOB_INVOICE_SUBSCRIPTION")]
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
    hanko_jobs_worker::exit_code("invoice-worker", run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let service = wiring::invoice_service()?;

    let config = WorkerConfig {
        project_id: cli.runtime.project_or(""),
        subscription_id: cli.subscription.unwrap_or_default(),
        worker_name: cli.runtime.worker_or("invoice-worker"),
        skip_subscription_check: cli.runtime.skip_subscription_check(),
        broker_url: cli.runtime.broker_url.clone(),
        receive_settings: cli.runtime.receive_settings(),
        subscription_policy: Some(cli.policy.policy_for(WorkerKind::Invoice)),
    };
    serve(config, Arc::new(InvoiceProcessor::new(Some(service)))).await
}
