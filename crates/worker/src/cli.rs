//! Command-line and environment configuration shared by the worker binaries.

use std::time::Duration;

use clap::Args;

use hanko_jobs_broker::ReceiveSettings;
use hanko_jobs_core::{PolicyOverrides, SubscriptionPolicy, WorkerKind};

pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379";

/// Environment variable consulted when `--skip-subscription-check` is absent.
pub const SKIP_SUBSCRIPTION_CHECK_ENV: &str = "JOB_SKIP_SUBSCRIPTION_CHECK";

#[derive(Debug, Clone, Default, Args)]
pub struct RuntimeArgs {
    /// Broker project identifier
    #[arg(long = "project", env = "JOB_PROJECT_ID")]
    pub project: Option<String>,

    /// Worker name used for logging and metrics
    #[arg(long = "worker", env = "JOB_WORKER_NAME")]
    pub worker: Option<String>,

    /// Skip subscription existence validation
    #[arg(long)]
    pub skip_subscription_check: bool,

    /// Broker URL: `redis://host:port` or `memory://`
    #[arg(long, env = "JOB_BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    pub broker_url: String,

    /// Maximum unsettled messages handed to the processor
    #[arg(long = "max-outstanding", env = "JOB_MAX_OUTSTANDING_MESSAGES")]
    pub max_outstanding: Option<usize>,
}

impl RuntimeArgs {
    /// Project id, falling back to `default` when unset or blank.
    pub fn project_or(&self, default: &str) -> String {
        non_blank(self.project.as_deref()).unwrap_or(default).to_string()
    }

    /// Worker name, falling back to `default` when unset or blank.
    pub fn worker_or(&self, default: &str) -> String {
        non_blank(self.worker.as_deref()).unwrap_or(default).to_string()
    }

    /// The flag, or a truthy [`SKIP_SUBSCRIPTION_CHECK_ENV`].
    pub fn skip_subscription_check(&self) -> bool {
        self.skip_subscription_check || env_bool(SKIP_SUBSCRIPTION_CHECK_ENV)
    }

    pub fn receive_settings(&self) -> Option<ReceiveSettings> {
        self.max_outstanding
            .filter(|n| *n > 0)
            .map(|max_outstanding_messages| ReceiveSettings {
                max_outstanding_messages,
            })
    }
}

/// Subscription policy overrides.
#[derive(Debug, Clone, Default, Args)]
pub struct PolicyArgs {
    /// Minimum redelivery backoff in seconds
    #[arg(long, env = "JOB_MIN_BACKOFF_SECS")]
    pub min_backoff_secs: Option<u64>,

    /// Maximum redelivery backoff in seconds
    #[arg(long, env = "JOB_MAX_BACKOFF_SECS")]
    pub max_backoff_secs: Option<u64>,

    /// Delivery attempts before dead-lettering
    #[arg(long, env = "JOB_MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: Option<u32>,

    /// Dead-letter topic id or fully qualified `projects/...` resource
    #[arg(long, env = "JOB_DEAD_LETTER_TOPIC")]
    pub dead_letter_topic: Option<String>,
}

impl PolicyArgs {
    pub fn overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            minimum_backoff: self.min_backoff_secs.map(Duration::from_secs),
            maximum_backoff: self.max_backoff_secs.map(Duration::from_secs),
            max_delivery_attempts: self.max_delivery_attempts,
            dead_letter_topic: self.dead_letter_topic.clone(),
        }
    }

    /// Default policy for `kind` with the overrides applied.
    pub fn policy_for(&self, kind: WorkerKind) -> SubscriptionPolicy {
        SubscriptionPolicy::default_for(kind).with_overrides(&self.overrides())
    }
}

/// `{1,true,yes,y,on}`, case-insensitive and trimmed; anything else is false.
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

pub fn env_bool(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| parse_truthy(&value))
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
