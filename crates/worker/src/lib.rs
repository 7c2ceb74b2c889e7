//! Worker binaries support: configuration, broker selection and process
//! lifecycle.
//!
//! Each binary in `src/bin` builds a [`WorkerConfig`] and a processor, then
//! hands both to [`serve`], which runs until SIGINT/SIGTERM.

pub mod cli;
pub mod wiring;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use hanko_jobs_broker::{BrokerConnector, InMemoryBroker, ReceiveSettings};
use hanko_jobs_core::{CancellationToken, Processor, SubscriptionPolicy, UnknownWorkerKind};
use hanko_jobs_infra::RuntimeOptions;
use hanko_jobs_infra::event_bus::RedisStreamsConnector;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unsupported broker url {0:?} (expected redis://, rediss:// or memory://)")]
    UnsupportedBrokerUrl(String),

    #[error("{0} wiring not configured; provide a real implementation before deploying")]
    Unwired(&'static str),

    #[error(transparent)]
    UnknownWorkerKind(#[from] UnknownWorkerKind),

    #[error("subscription id is required")]
    MissingSubscription,
}

/// Everything a worker needs besides its processor.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub project_id: String,
    pub subscription_id: String,
    pub worker_name: String,
    pub skip_subscription_check: bool,
    pub broker_url: String,
    pub receive_settings: Option<ReceiveSettings>,
    pub subscription_policy: Option<SubscriptionPolicy>,
}

/// Pick a broker backend from its URL.
pub fn connector_for(url: &str, project_id: &str) -> Result<Arc<dyn BrokerConnector>, WorkerError> {
    let url = url.trim();
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisStreamsConnector::new(url)));
    }
    if url.starts_with("memory://") {
        return Ok(Arc::new(InMemoryBroker::new(project_id.trim())));
    }
    Err(WorkerError::UnsupportedBrokerUrl(url.to_string()))
}

/// Run `processor` on the configured subscription until a shutdown signal.
pub async fn serve(config: WorkerConfig, processor: Arc<dyn Processor>) -> anyhow::Result<()> {
    let connector = connector_for(&config.broker_url, &config.project_id)?;

    let cancel = CancellationToken::new();
    let signalled = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signalled.cancel();
    });

    let options = RuntimeOptions {
        project_id: config.project_id,
        subscription_id: config.subscription_id,
        worker_name: config.worker_name,
        processor: Some(processor),
        receive_settings: config.receive_settings,
        skip_subscription_validation: config.skip_subscription_check,
        subscription_policy: config.subscription_policy,
        ..Default::default()
    };

    hanko_jobs_infra::run(cancel, options, connector.as_ref()).await?;
    Ok(())
}

/// Log a terminal error and map the result to a process exit code.
pub fn exit_code(worker: &str, result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(worker, error = %format!("{err:#}"), "worker terminated with error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_selects_backend() {
        assert!(connector_for("redis://127.0.0.1:6379", "p").is_ok());
        assert!(connector_for(" memory:// ", "p").is_ok());
        assert!(matches!(
            connector_for("pubsub://emulator", "p"),
            Err(WorkerError::UnsupportedBrokerUrl(_))
        ));
    }

    #[tokio::test]
    async fn memory_broker_without_subscription_fails() {
        let config = WorkerConfig {
            project_id: "local-project".to_string(),
            subscription_id: "missing-sub".to_string(),
            broker_url: "memory://".to_string(),
            ..Default::default()
        };
        let processor: Arc<dyn Processor> = Arc::new(hanko_jobs_ai::AiProcessor::new(None));

        let err = serve(config, processor).await.unwrap_err();
        assert!(format!("{err:#}").contains("not found"));
    }
}
