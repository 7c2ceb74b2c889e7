//! `hanko-jobs-ai`
//!
//! **Responsibility:** bridge AI suggestion job messages to an [`Executor`].
//!
//! The crate only validates the payload; the inference work itself is done
//! by whatever executor the worker binary wires in.

pub mod job;
pub mod processor;

pub use job::SuggestionJobMessage;
pub use processor::{AiProcessor, Executor, ExecutorFn, executor_fn};
