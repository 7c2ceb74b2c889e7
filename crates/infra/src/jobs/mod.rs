//! Job processors owned by the runtime itself.
//!
//! Business processors (AI, invoicing, export) live in their own crates;
//! this module only hosts the dead-letter processor every deployment needs.

pub mod deadletter;

pub use deadletter::{
    DEAD_LETTER_WORKER_NAME, DeadLetterEvent, DeadLetterProcessor, DeadLetterSink,
};
