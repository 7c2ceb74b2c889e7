use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hanko_jobs_ai::AiProcessor;
use hanko_jobs_core::WorkerKind;
use hanko_jobs_worker::cli::{PolicyArgs, RuntimeArgs};
use hanko_jobs_worker::{WorkerConfig, serve, wiring};

/// Consumes AI suggestion jobs.
#[derive(Debug, Parser)]
#[command(name = "ai-worker")]
struct Cli {
    /// Subscription for AI jobs
    #[arg(long, env = "JOB_AI_SUBSCRIPTION")]
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
    hanko_jobs_worker::exit_code("ai-worker", run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let executor = wiring::ai_executor()?;

    let config = WorkerConfig {
        project_id: cli.runtime.project_or(""),
        subscription_id: cli.subscription.unwrap_or_default(),
        worker_name: cli.runtime.worker_or("ai-worker"),
        skip_subscription_check: cli.runtime.skip_subscription_check(),
        broker_url: cli.runtime.broker_url.clone(),
        receive_settings: cli.runtime.receive_settings(),
        subscription_policy: Some(cli.policy.policy_for(WorkerKind::Ai)),
    };
    serve(config, Arc::new(AiProcessor::new(Some(executor)))).await
}
