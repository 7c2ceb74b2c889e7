use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, error, warn};

use hanko_jobs_core::{CancellationToken, Message, Processor, permanent};

use crate::job::SuggestionJobMessage;

/// Performs the actual suggestion work.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &CancellationToken, job: SuggestionJobMessage)
    -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`Executor`].
pub struct ExecutorFn<F> {
    f: F,
}

pub fn executor_fn<F, Fut>(f: F) -> ExecutorFn<F>
where
    F: Fn(CancellationToken, SuggestionJobMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ExecutorFn { f }
}

#[async_trait]
impl<F, Fut> Executor for ExecutorFn<F>
where
    F: Fn(CancellationToken, SuggestionJobMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &CancellationToken,
        job: SuggestionJobMessage,
    ) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), job).await
    }
}

/// Processor for AI suggestion subscriptions.
///
/// Without an executor, valid messages are acknowledged and logged.
#[derive(Clone, Default)]
pub struct AiProcessor {
    executor: Option<Arc<dyn Executor>>,
}

impl AiProcessor {
    pub fn new(executor: Option<Arc<dyn Executor>>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Processor for AiProcessor {
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        let mut job: SuggestionJobMessage = match message.decode_json() {
            Ok(job) => job,
            Err(err) => {
                error!(
                    message_id = %message.id,
                    subscription = %message.subscription_name,
                    error = %err,
                    "ai processor: failed to decode message"
                );
                return Err(permanent(
                    anyhow::Error::new(err).context("decode suggestion job"),
                ));
            }
        };

        job.normalize();
        if !job.is_complete() {
            error!(
                message = %message.debug_string(),
                "ai processor: missing identifiers"
            );
            return Err(permanent(anyhow::anyhow!(
                "ai processor: jobId and suggestionId are required"
            )));
        }

        let Some(executor) = &self.executor else {
            warn!(
                job_id = %job.job_id,
                suggestion_id = %job.suggestion_id,
                "ai processor: executor not configured, acknowledging message"
            );
            return Ok(());
        };

        let (job_id, suggestion_id) = (job.job_id.clone(), job.suggestion_id.clone());
        executor
            .execute(ctx, job)
            .await
            .inspect_err(|err| {
                error!(
                    job_id = %job_id,
                    suggestion_id = %suggestion_id,
                    error = %format!("{err:#}"),
                    "ai processor: executor failed"
                );
            })
            .context("ai processor: execute suggestion job")?;

        debug!(
            job_id = %job_id,
            suggestion_id = %suggestion_id,
            "ai processor: job dispatched"
        );
        Ok(())
    }
}
