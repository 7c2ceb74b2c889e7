//! Subscription retry/backoff and dead-letter policies.
//!
//! Policies are declarative: the runtime harness applies them to the broker
//! subscription once at startup, after which they are frozen. Per-kind
//! defaults are part of the external contract; callers clone a default before
//! applying overrides so shared defaults are never mutated.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of a fully qualified topic resource path.
pub const TOPIC_RESOURCE_PREFIX: &str = "projects/";

/// Supported background worker categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// AI suggestion processing.
    Ai,
    /// Invoice issuance.
    Invoice,
    /// Export synchronisation.
    Export,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Ai => "ai",
            WorkerKind::Invoice => "invoice",
            WorkerKind::Export => "export",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported worker type {0:?}")]
pub struct UnknownWorkerKind(pub String);

impl FromStr for WorkerKind {
    type Err = UnknownWorkerKind;

    /// Case-insensitive and trimmed; accepts the `-worker` aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ai" | "ai-worker" | "aiworker" => Ok(WorkerKind::Ai),
            "invoice" | "invoice-worker" => Ok(WorkerKind::Invoice),
            "export" | "export-worker" => Ok(WorkerKind::Export),
            _ => Err(UnknownWorkerKind(s.to_string())),
        }
    }
}

/// Exponential backoff bounds enforced by the broker between redeliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
}

impl RetryPolicy {
    pub fn is_empty(&self) -> bool {
        self.minimum_backoff.is_zero() && self.maximum_backoff.is_zero()
    }
}

/// Forwarding of messages that exceed their delivery attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Short topic identifier, combined with the project id.
    pub topic_id: Option<String>,
    /// Fully qualified topic resource; takes precedence over `topic_id`.
    pub topic_resource: Option<String>,
    pub max_delivery_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn is_empty(&self) -> bool {
        non_blank(&self.topic_id).is_none()
            && non_blank(&self.topic_resource).is_none()
            && self.max_delivery_attempts == 0
    }

    /// Resolve the dead-letter topic resource for `project_id`.
    ///
    /// `topic_resource` is used verbatim; otherwise `topic_id` is expanded to
    /// `projects/{project_id}/topics/{topic_id}` unless it is already fully
    /// qualified. `None` when neither is set.
    pub fn resolve_topic(&self, project_id: &str) -> Option<String> {
        if let Some(resource) = non_blank(&self.topic_resource) {
            return Some(resource.to_string());
        }
        let topic_id = non_blank(&self.topic_id)?;
        if topic_id.starts_with(TOPIC_RESOURCE_PREFIX) {
            Some(topic_id.to_string())
        } else {
            Some(format!("projects/{project_id}/topics/{topic_id}"))
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Retry and dead-letter configuration applied to a subscription.
///
/// `Clone` is a deep copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    pub retry: Option<RetryPolicy>,
    pub dead_letter: Option<DeadLetterPolicy>,
}

impl SubscriptionPolicy {
    /// Standard policy for `kind`. Conservative on purpose: delayed retries
    /// are preferred over rapid redelivery storms.
    pub fn default_for(kind: WorkerKind) -> Self {
        let (min, max, topic, attempts) = match kind {
            WorkerKind::Ai => (10, 2 * 60, "ai-jobs-dlq", 10),
            WorkerKind::Invoice => (10, 5 * 60, "invoice-jobs-dlq", 8),
            WorkerKind::Export => (15, 10 * 60, "export-jobs-dlq", 8),
        };
        Self {
            retry: Some(RetryPolicy {
                minimum_backoff: Duration::from_secs(min),
                maximum_backoff: Duration::from_secs(max),
            }),
            dead_letter: Some(DeadLetterPolicy {
                topic_id: Some(topic.to_string()),
                topic_resource: None,
                max_delivery_attempts: attempts,
            }),
        }
    }

    /// Apply `overrides` in place. Absent and zero-valued fields are ignored;
    /// missing sub-policies are allocated on first use.
    pub fn apply_overrides(&mut self, overrides: &PolicyOverrides) {
        if let Some(min) = overrides.minimum_backoff.filter(|d| !d.is_zero()) {
            self.retry.get_or_insert_with(RetryPolicy::default).minimum_backoff = min;
        }
        if let Some(max) = overrides.maximum_backoff.filter(|d| !d.is_zero()) {
            self.retry.get_or_insert_with(RetryPolicy::default).maximum_backoff = max;
        }
        if let Some(attempts) = overrides.max_delivery_attempts.filter(|n| *n > 0) {
            self.dead_letter
                .get_or_insert_with(DeadLetterPolicy::default)
                .max_delivery_attempts = attempts;
        }
        if let Some(topic) = non_blank(&overrides.dead_letter_topic) {
            let dead_letter = self.dead_letter.get_or_insert_with(DeadLetterPolicy::default);
            if topic.starts_with(TOPIC_RESOURCE_PREFIX) {
                dead_letter.topic_resource = Some(topic.to_string());
                dead_letter.topic_id = None;
            } else {
                dead_letter.topic_id = Some(topic.to_string());
                dead_letter.topic_resource = None;
            }
        }
    }

    /// Builder form of [`SubscriptionPolicy::apply_overrides`].
    pub fn with_overrides(mut self, overrides: &PolicyOverrides) -> Self {
        self.apply_overrides(overrides);
        self
    }
}

/// Optional policy overrides sourced from flags or environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub minimum_backoff: Option<Duration>,
    pub maximum_backoff: Option<Duration>,
    pub max_delivery_attempts: Option<u32>,
    pub dead_letter_topic: Option<String>,
}

impl PolicyOverrides {
    pub fn is_empty(&self) -> bool {
        self.minimum_backoff.is_none()
            && self.maximum_backoff.is_none()
            && self.max_delivery_attempts.is_none()
            && non_blank(&self.dead_letter_topic).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KINDS: [WorkerKind; 3] = [WorkerKind::Ai, WorkerKind::Invoice, WorkerKind::Export];

    #[test]
    fn defaults_match_contract() {
        let expected = [
            (WorkerKind::Ai, 10, 120, "ai-jobs-dlq", 10),
            (WorkerKind::Invoice, 10, 300, "invoice-jobs-dlq", 8),
            (WorkerKind::Export, 15, 600, "export-jobs-dlq", 8),
        ];

        for (kind, min, max, topic, attempts) in expected {
            let policy = SubscriptionPolicy::default_for(kind);
            let retry = policy.retry.expect("retry policy");
            assert_eq!(retry.minimum_backoff, Duration::from_secs(min), "{kind}");
            assert_eq!(retry.maximum_backoff, Duration::from_secs(max), "{kind}");

            let dead_letter = policy.dead_letter.expect("dead letter policy");
            assert_eq!(dead_letter.topic_id.as_deref(), Some(topic), "{kind}");
            assert_eq!(dead_letter.topic_resource, None, "{kind}");
            assert_eq!(dead_letter.max_delivery_attempts, attempts, "{kind}");
        }
    }

    #[test]
    fn overrides_do_not_leak_into_defaults() {
        for kind in KINDS {
            let mut cloned = SubscriptionPolicy::default_for(kind).clone();
            cloned.apply_overrides(&PolicyOverrides {
                minimum_backoff: Some(Duration::from_secs(1)),
                maximum_backoff: Some(Duration::from_secs(2)),
                max_delivery_attempts: Some(3),
                dead_letter_topic: Some("projects/other/topics/dlq".to_string()),
            });

            assert_ne!(cloned, SubscriptionPolicy::default_for(kind));
            assert_eq!(
                SubscriptionPolicy::default_for(kind).dead_letter.unwrap().topic_resource,
                None
            );
        }
    }

    #[test]
    fn overrides_allocate_missing_sub_policies() {
        let mut policy = SubscriptionPolicy::default();
        policy.apply_overrides(&PolicyOverrides {
            maximum_backoff: Some(Duration::from_secs(30)),
            max_delivery_attempts: Some(5),
            ..Default::default()
        });

        assert_eq!(
            policy.retry,
            Some(RetryPolicy {
                minimum_backoff: Duration::ZERO,
                maximum_backoff: Duration::from_secs(30),
            })
        );
        let dead_letter = policy.dead_letter.unwrap();
        assert_eq!(dead_letter.max_delivery_attempts, 5);
        assert_eq!(dead_letter.topic_id, None);
    }

    #[test]
    fn zero_and_blank_overrides_are_ignored() {
        let base = SubscriptionPolicy::default_for(WorkerKind::Invoice);
        let overridden = base.clone().with_overrides(&PolicyOverrides {
            minimum_backoff: Some(Duration::ZERO),
            maximum_backoff: Some(Duration::ZERO),
            max_delivery_attempts: Some(0),
            dead_letter_topic: Some("   ".to_string()),
        });
        assert_eq!(overridden, base);
    }

    #[test]
    fn invoice_override_matches_policy_application_scenario() {
        let policy = SubscriptionPolicy::default_for(WorkerKind::Invoice).with_overrides(
            &PolicyOverrides {
                max_delivery_attempts: Some(7),
                dead_letter_topic: Some("ai-jobs-dlq".to_string()),
                ..Default::default()
            },
        );

        let dead_letter = policy.dead_letter.unwrap();
        assert_eq!(dead_letter.max_delivery_attempts, 7);
        assert_eq!(
            dead_letter.resolve_topic("test").as_deref(),
            Some("projects/test/topics/ai-jobs-dlq")
        );
    }

    #[test]
    fn resolve_topic_prefers_resource() {
        let policy = DeadLetterPolicy {
            topic_id: Some("ignored".to_string()),
            topic_resource: Some("projects/shared/topics/jobs-dlq".to_string()),
            max_delivery_attempts: 5,
        };
        assert_eq!(
            policy.resolve_topic("test").as_deref(),
            Some("projects/shared/topics/jobs-dlq")
        );

        let qualified_id = DeadLetterPolicy {
            topic_id: Some("projects/shared/topics/x".to_string()),
            ..Default::default()
        };
        assert_eq!(
            qualified_id.resolve_topic("test").as_deref(),
            Some("projects/shared/topics/x")
        );

        assert_eq!(DeadLetterPolicy::default().resolve_topic("test"), None);
    }

    #[test]
    fn worker_kind_parses_aliases() {
        assert_eq!(" AI ".parse::<WorkerKind>(), Ok(WorkerKind::Ai));
        assert_eq!("aiworker".parse::<WorkerKind>(), Ok(WorkerKind::Ai));
        assert_eq!("Invoice-Worker".parse::<WorkerKind>(), Ok(WorkerKind::Invoice));
        assert_eq!("export".parse::<WorkerKind>(), Ok(WorkerKind::Export));
        assert_eq!(
            "billing".parse::<WorkerKind>(),
            Err(UnknownWorkerKind("billing".to_string()))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: an override topic selects `topic_resource` iff it is
        /// fully qualified, and always clears the other field.
        #[test]
        fn override_topic_selects_exactly_one_field(
            kind_idx in 0usize..3,
            qualified in any::<bool>(),
            name in "[a-z][a-z0-9-]{0,20}",
        ) {
            let topic = if qualified {
                format!("projects/p/topics/{name}")
            } else {
                name.clone()
            };
            let policy = SubscriptionPolicy::default_for(KINDS[kind_idx]).with_overrides(
                &PolicyOverrides {
                    dead_letter_topic: Some(topic.clone()),
                    ..Default::default()
                },
            );
            let dead_letter = policy.dead_letter.unwrap();

            if qualified {
                prop_assert_eq!(dead_letter.topic_resource, Some(topic));
                prop_assert_eq!(dead_letter.topic_id, None);
            } else {
                prop_assert_eq!(dead_letter.topic_id, Some(topic));
                prop_assert_eq!(dead_letter.topic_resource, None);
            }
        }

        /// Property: mutating a clone never changes a later default.
        #[test]
        fn clone_is_independent(
            kind_idx in 0usize..3,
            min in 1u64..3600,
            attempts in 1u32..100,
        ) {
            let kind = KINDS[kind_idx];
            let pristine = SubscriptionPolicy::default_for(kind);

            let mut cloned = pristine.clone();
            if let Some(retry) = cloned.retry.as_mut() {
                retry.minimum_backoff = Duration::from_secs(min + 1000);
            }
            if let Some(dead_letter) = cloned.dead_letter.as_mut() {
                dead_letter.max_delivery_attempts = attempts + 100;
                dead_letter.topic_id = None;
            }

            prop_assert_eq!(&pristine, &SubscriptionPolicy::default_for(kind));
            prop_assert_ne!(&cloned, &pristine);
        }
    }
}
