use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hanko_jobs_infra::DeadLetterProcessor;
use hanko_jobs_worker::cli::RuntimeArgs;
use hanko_jobs_worker::{WorkerConfig, serve, wiring};

/// Captures messages that exhausted their delivery attempts.
#[derive(Debug, Parser)]
#[command(name = "deadletter-worker")]
struct Cli {
    /// Dead-letter subscription
    #[arg(long, env = "JOB_DEADLETTER_SUBSCRIPTION")]
    subscription: Option<String>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    hanko_jobs_observability::init();
    let cli = Cli::parse();
    hanko_jobs_worker::exit_code("deadletter-worker", run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let processor = DeadLetterProcessor::new(wiring::dead_letter_sink(), None);

    let config = WorkerConfig {
        project_id: cli.runtime.project_or(""),
        subscription_id: cli.subscription.unwrap_or_default(),
        worker_name: cli.runtime.worker_or("deadletter-worker"),
        skip_subscription_check: cli.runtime.skip_subscription_check(),
        broker_url: cli.runtime.broker_url.clone(),
        receive_settings: cli.runtime.receive_settings(),
        subscription_policy: None,
    };
    serve(config, Arc::new(processor)).await
}
