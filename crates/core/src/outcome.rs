//! Dispatch outcomes and broker replies.

use std::fmt;

/// Outcome label recorded for every processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Processed and acknowledged.
    Success,
    /// Negatively acknowledged; the broker redelivers.
    Retry,
    /// Poisoned message; acknowledged without retry.
    PermanentFailure,
    /// The processor panicked; negatively acknowledged.
    Panic,
    /// A dead-lettered message was captured.
    DeadLetter,
    /// Capturing a dead-lettered message failed and will be retried.
    DeadLetterRetry,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Success,
        Outcome::Retry,
        Outcome::PermanentFailure,
        Outcome::Panic,
        Outcome::DeadLetter,
        Outcome::DeadLetterRetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry => "retry",
            Outcome::PermanentFailure => "permanent_failure",
            Outcome::Panic => "panic",
            Outcome::DeadLetter => "dead_letter",
            Outcome::DeadLetterRetry => "dead_letter_retry",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply sent to the broker for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
}
