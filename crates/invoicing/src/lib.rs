//! Invoice issuance jobs.
//!
//! Messages carry an [`IssueInvoicesCommand`]; the [`InvoiceProcessor`]
//! validates it and hands it to an [`InvoiceService`]. Service errors are
//! split into permanent (bad input, conflicts, unknown orders) and transient.

pub mod processor;
pub mod service;

pub use processor::InvoiceProcessor;
pub use service::{
    InvoiceBatchFilter, InvoiceService, InvoiceServiceError, IssueInvoicesCommand,
    IssueInvoicesResult, IssuedInvoice,
};
