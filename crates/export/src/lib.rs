//! Analytics export jobs.
//!
//! Each message asks for a set of entities to be synchronised to the
//! analytics warehouse. The [`ExportProcessor`] normalises the request and
//! delegates to an [`ExportHandler`].

pub mod message;
pub mod processor;

pub use message::ExportMessage;
pub use processor::{ExportHandler, ExportHandlerFn, ExportProcessor, handler_fn};
