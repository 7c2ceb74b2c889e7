//! `hanko-jobs-core`: building blocks of the background job runtime.
//!
//! This crate contains **pure** job primitives (no broker or telemetry I/O):
//! the normalized [`Message`], permanent/transient error classification, the
//! [`Processor`] contract, the [`MetricsRecorder`] contract and the
//! per-worker [`SubscriptionPolicy`] defaults.

pub mod error;
pub mod message;
pub mod metrics;
pub mod outcome;
pub mod policy;
pub mod processor;

pub use error::{
    ErrorKind, Interrupted, PermanentError, PermanentExt, is_cancellation, is_permanent, permanent,
    settle,
};
pub use message::Message;
pub use metrics::{MetricsRecorder, NoopMetrics, sanitize_label};
pub use outcome::{Outcome, Reply};
pub use policy::{
    DeadLetterPolicy, PolicyOverrides, RetryPolicy, SubscriptionPolicy, TOPIC_RESOURCE_PREFIX,
    UnknownWorkerKind, WorkerKind,
};
pub use processor::{Processor, ProcessorFn, processor_fn, run_one};

/// Cancellation scope shared by a receive loop and every dispatch it spawns.
pub use tokio_util::sync::CancellationToken;
