//! Subscription workers.

pub mod runner;

pub use runner::{DEFAULT_WORKER_NAME, Runner, RunnerError, RunnerState, normalize_message};
