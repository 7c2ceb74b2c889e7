//! Production business wiring.
//!
//! The job runtime only bridges messages to these contracts. Deployments
//! link concrete implementations here; until then the production binaries
//! refuse to start rather than silently acknowledging work.

use std::sync::Arc;

use hanko_jobs_ai::Executor;
use hanko_jobs_export::ExportHandler;
use hanko_jobs_infra::DeadLetterSink;
use hanko_jobs_invoicing::InvoiceService;

use crate::WorkerError;

pub fn ai_executor() -> Result<Arc<dyn Executor>, WorkerError> {
    Err(WorkerError::Unwired("ai executor"))
}

pub fn invoice_service() -> Result<Arc<dyn InvoiceService>, WorkerError> {
    Err(WorkerError::Unwired("invoice service"))
}

pub fn export_handler() -> Result<Arc<dyn ExportHandler>, WorkerError> {
    Err(WorkerError::Unwired("export handler"))
}

/// Optional: without a sink the dead-letter worker only logs captures.
pub fn dead_letter_sink() -> Option<Arc<dyn DeadLetterSink>> {
    None
}
