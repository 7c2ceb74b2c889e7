//! Local runner for any job kind, without business wiring.
//!
//! AI messages are validated and acknowledged; invoice and export messages
//! fail permanently since no service is configured.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hanko_jobs_ai::AiProcessor;
use hanko_jobs_core::{Processor, WorkerKind};
use hanko_jobs_export::ExportProcessor;
use hanko_jobs_invoicing::InvoiceProcessor;
use hanko_jobs_worker::cli::{PolicyArgs, RuntimeArgs, non_blank};
use hanko_jobs_worker::{WorkerConfig, WorkerError, serve};

const DEFAULT_PROJECT: &str = "local-project";

#[derive(Debug, Parser)]
#[command(name = "dev-runner")]
struct Cli {
    /// Subscription to consume
    #[arg(long, env = "JOB_SUBSCRIPTION")]
    subscription: Option<String>,

    /// Worker type (ai|invoice|export)
    #[arg(long, env = "JOB_WORKER_TYPE", default_value = "ai")]
    worker_type: String,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(flatten)]
    policy: PolicyArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    hanko_jobs_observability::init();
    let cli = Cli::parse();
    hanko_jobs_worker::exit_code("dev-runner", run(cli).await)
}

fn dev_processor(kind: WorkerKind) -> (Arc<dyn Processor>, &'static str) {
    let processor: Arc<dyn Processor> = match kind {
        WorkerKind::Ai => Arc::new(AiProcessor::new(None)),
        WorkerKind::Invoice => Arc::new(InvoiceProcessor::new(None)),
        WorkerKind::Export => Arc::new(ExportProcessor::new(None)),
    };
    let name = match kind {
        WorkerKind::Ai => "ai-dev-worker",
        WorkerKind::Invoice => "invoice-dev-worker",
        WorkerKind::Export => "export-dev-worker",
    };
    (processor, name)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let kind: WorkerKind = cli.worker_type.parse().map_err(WorkerError::from)?;
    let subscription = non_blank(cli.subscription.as_deref())
        .ok_or(WorkerError::MissingSubscription)?
        .to_string();
    let (processor, default_name) = dev_processor(kind);

    let config = WorkerConfig {
        project_id: cli.runtime.project_or(DEFAULT_PROJECT),
        subscription_id: subscription,
        worker_name: cli.runtime.worker_or(default_name),
        skip_subscription_check: cli.runtime.skip_subscription_check(),
        broker_url: cli.runtime.broker_url.clone(),
        receive_settings: cli.runtime.receive_settings(),
        subscription_policy: Some(cli.policy.policy_for(kind)),
    };
    serve(config, processor).await
}
