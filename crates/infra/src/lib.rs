//! Job runtime infrastructure: runner, harness, dead-letter capture and
//! broker backends.

pub mod event_bus;
pub mod jobs;
pub mod runtime;
pub mod workers;

pub use jobs::{DeadLetterEvent, DeadLetterProcessor, DeadLetterSink};
pub use runtime::{
    ConfigError, RuntimeError, RuntimeOptions, apply_subscription_policy, policy_update, run,
};
pub use workers::{Runner, RunnerError, RunnerState, normalize_message};
