//! Processor error classification.
//!
//! Processors return `anyhow::Result<()>`. The runner decides ack vs nack from
//! the error chain alone:
//!
//! - a [`PermanentError`] anywhere in the chain acknowledges the message,
//! - an [`Interrupted`] sentinel (or a tokio timeout) means the dispatch was
//!   cancelled and the message is redelivered,
//! - everything else is transient and redelivered.
//!
//! Permanence is never inferred from error identity; processors wrap their
//! own poisoned-message failures with [`permanent`].

use std::any::Any;
use std::fmt;

use crate::outcome::{Outcome, Reply};

/// Marker wrapping an error that must not be retried.
#[derive(Debug)]
pub struct PermanentError {
    inner: anyhow::Error,
}

impl PermanentError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for PermanentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for PermanentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}

/// Wrap `err` so the runner acknowledges the message instead of retrying it.
pub fn permanent(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(PermanentError { inner: err.into() })
}

/// Whether any element of the error chain is a [`PermanentError`].
pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<PermanentError>())
}

/// Result-level form of [`permanent`]: `Ok` passes through untouched.
pub trait PermanentExt<T> {
    fn permanent(self) -> anyhow::Result<T>;
}

impl<T, E> PermanentExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn permanent(self) -> anyhow::Result<T> {
        self.map_err(permanent)
    }
}

/// Cancellation sentinels returned by processors that observe their
/// cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Whether the error chain carries a cancellation or deadline sentinel.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<Interrupted>() || cause.is::<tokio::time::error::Elapsed>())
}

/// Classified failure of a single dispatch.
#[derive(Debug)]
pub enum ErrorKind {
    /// The processor declared the message poisoned.
    Permanent(anyhow::Error),
    /// Any other processor error.
    Transient(anyhow::Error),
    /// The dispatch was cancelled.
    Cancellation(anyhow::Error),
    /// The processor panicked; carries the rendered panic payload.
    Panic(String),
}

impl ErrorKind {
    /// Classify a processor error. Cancellation wins over permanence.
    pub fn classify(err: anyhow::Error) -> Self {
        if is_cancellation(&err) {
            ErrorKind::Cancellation(err)
        } else if is_permanent(&err) {
            ErrorKind::Permanent(err)
        } else {
            ErrorKind::Transient(err)
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let rendered = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ErrorKind::Panic(rendered)
    }

    pub fn reply(&self) -> Reply {
        match self {
            ErrorKind::Permanent(_) => Reply::Ack,
            ErrorKind::Transient(_) | ErrorKind::Cancellation(_) | ErrorKind::Panic(_) => {
                Reply::Nack
            }
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            ErrorKind::Permanent(_) => Outcome::PermanentFailure,
            ErrorKind::Transient(_) | ErrorKind::Cancellation(_) => Outcome::Retry,
            ErrorKind::Panic(_) => Outcome::Panic,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Permanent(err)
            | ErrorKind::Transient(err)
            | ErrorKind::Cancellation(err) => fmt::Display::fmt(err, f),
            ErrorKind::Panic(value) => write!(f, "panic: {value}"),
        }
    }
}

/// Reply and outcome for a finished dispatch.
pub fn settle(result: &Result<(), ErrorKind>) -> (Reply, Outcome) {
    match result {
        Ok(()) => (Reply::Ack, Outcome::Success),
        Err(kind) => (kind.reply(), kind.outcome()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn permanent_is_detected_through_context() {
        let err = permanent(anyhow!("bad payload")).context("ai processor");
        assert!(is_permanent(&err));
        assert_eq!(err.to_string(), "ai processor");
    }

    #[test]
    fn permanent_is_idempotent() {
        let err = permanent(permanent(anyhow!("boom")));
        assert!(is_permanent(&err));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn permanent_passes_ok_through() {
        let ok: Result<(), anyhow::Error> = Ok(());
        assert!(ok.permanent().is_ok());

        let err: Result<(), serde_json::Error> = serde_json::from_str::<()>("{");
        assert!(is_permanent(&err.permanent().unwrap_err()));
    }

    #[test]
    fn plain_errors_are_not_permanent() {
        assert!(!is_permanent(&anyhow!("boom")));
    }

    #[test]
    fn cancellation_sentinels_are_detected() {
        assert!(is_cancellation(&Interrupted::Cancelled.into()));
        assert!(is_cancellation(
            &anyhow::Error::from(Interrupted::DeadlineExceeded).context("executor")
        ));
        assert!(!is_cancellation(&anyhow!("context canceled")));
    }

    #[tokio::test]
    async fn tokio_timeout_counts_as_deadline() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(is_cancellation(&elapsed.into()));
    }

    #[test]
    fn classification_table() {
        assert_eq!(settle(&Ok(())), (Reply::Ack, Outcome::Success));

        let cancelled = ErrorKind::classify(Interrupted::Cancelled.into());
        assert_eq!(settle(&Err(cancelled)), (Reply::Nack, Outcome::Retry));

        // Cancellation is matched before permanence.
        let both = ErrorKind::classify(permanent(Interrupted::Cancelled));
        assert_eq!(settle(&Err(both)), (Reply::Nack, Outcome::Retry));

        let poisoned = ErrorKind::classify(permanent(anyhow!("malformed")));
        assert_eq!(
            settle(&Err(poisoned)),
            (Reply::Ack, Outcome::PermanentFailure)
        );

        let transient = ErrorKind::classify(anyhow!("boom"));
        assert_eq!(settle(&Err(transient)), (Reply::Nack, Outcome::Retry));

        let panicked = ErrorKind::from_panic(Box::new("kaboom"));
        assert_eq!(settle(&Err(panicked)), (Reply::Nack, Outcome::Panic));
    }

    #[test]
    fn panic_payload_is_rendered() {
        match ErrorKind::from_panic(Box::new(String::from("index out of bounds"))) {
            ErrorKind::Panic(value) => assert_eq!(value, "index out of bounds"),
            other => panic!("unexpected classification: {other:?}"),
        }
        match ErrorKind::from_panic(Box::new(42_u8)) {
            ErrorKind::Panic(value) => assert_eq!(value, "non-string panic payload"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
