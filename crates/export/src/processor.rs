use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use hanko_jobs_core::{CancellationToken, Message, Processor, permanent};

use crate::message::ExportMessage;

/// Runs an export job.
#[async_trait]
pub trait ExportHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, message: ExportMessage) -> anyhow::Result<()>;
}

pub struct ExportHandlerFn<F> {
    f: F,
}

/// Build an [`ExportHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> ExportHandlerFn<F>
where
    F: Fn(CancellationToken, ExportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ExportHandlerFn { f }
}

#[async_trait]
impl<F, Fut> ExportHandler for ExportHandlerFn<F>
where
    F: Fn(CancellationToken, ExportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, message: ExportMessage) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), message).await
    }
}

#[derive(Clone, Default)]
pub struct ExportProcessor {
    handler: Option<Arc<dyn ExportHandler>>,
}

impl ExportProcessor {
    pub fn new(handler: Option<Arc<dyn ExportHandler>>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Processor for ExportProcessor {
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        let Some(handler) = &self.handler else {
            error!(
                message = %message.debug_string(),
                "export processor: handler not configured"
            );
            return Err(permanent(anyhow::anyhow!(
                "export processor: handler not configured"
            )));
        };

        let export = match message.decode_json::<ExportMessage>() {
            Ok(export) => export.normalized(),
            Err(err) => {
                error!(
                    message_id = %message.id,
                    error = %err,
                    "export processor: failed to decode payload"
                );
                return Err(permanent(
                    anyhow::Error::new(err).context("decode export message"),
                ));
            }
        };

        if !export.is_valid() {
            error!(
                message = %message.debug_string(),
                "export processor: invalid payload"
            );
            return Err(permanent(anyhow::anyhow!(
                "export processor: missing required fields"
            )));
        }

        let task_id = export.task_id.clone();
        let entities = export.entities.clone();
        if let Err(err) = handler.handle(ctx, export).await {
            error!(
                task_id = %task_id,
                entities = ?entities,
                error = %format!("{err:#}"),
                "export processor: handler failed"
            );
            return Err(err);
        }

        info!(
            task_id = %task_id,
            entities = ?entities,
            "export processor: job handled"
        );
        Ok(())
    }
}
