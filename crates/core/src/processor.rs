//! Processor contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Business handler for a single message.
///
/// Returning `Ok` acknowledges the message. Errors wrapped with
/// [`crate::permanent`] are acknowledged without retry; any other error is
/// redelivered by the broker. Processors must observe `ctx` and return
/// [`crate::Interrupted::Cancelled`] promptly once it fires.
///
/// Implementations are shared across concurrent dispatches.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        (**self).process(ctx, message).await
    }
}

/// Adapter turning an async closure into a [`Processor`].
pub struct ProcessorFn<F> {
    f: F,
}

/// Build a [`Processor`] from `f`.
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ProcessorFn { f }
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), message).await
    }
}

/// Invoke `processor` once, outside of any runner. Useful for replaying a
/// message by hand.
pub async fn run_one(
    ctx: &CancellationToken,
    processor: &dyn Processor,
    message: Message,
) -> anyhow::Result<()> {
    processor.process(ctx, message).await
}
