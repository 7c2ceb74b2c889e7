use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hanko_jobs_core::CancellationToken;

/// Order selection used when `order_ids` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvoiceBatchFilter {
    pub statuses: Vec<String>,
    pub placed_from: Option<DateTime<Utc>>,
    pub placed_to: Option<DateTime<Utc>>,
}

/// Batch invoice issuance request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueInvoicesCommand {
    pub actor_id: String,
    pub order_ids: Vec<String>,
    pub filter: Option<InvoiceBatchFilter>,
    pub limit: Option<u32>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedInvoice {
    pub order_id: String,
    pub invoice_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueInvoicesResult {
    pub issued: Vec<IssuedInvoice>,
    /// Orders skipped because they already carry an invoice.
    pub skipped: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvoiceServiceError {
    #[error("invoice: invalid input: {0}")]
    InvalidInput(String),

    #[error("invoice: conflict: {0}")]
    Conflict(String),

    #[error("invoice: order {0:?} not found")]
    OrderNotFound(String),

    #[error("invoice: service unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl InvoiceServiceError {
    /// Whether redelivering the same command can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::Conflict(_) | Self::OrderNotFound(_)
        )
    }
}

#[async_trait]
pub trait InvoiceService: Send + Sync {
    async fn issue_invoices(
        &self,
        ctx: &CancellationToken,
        command: IssueInvoicesCommand,
    ) -> Result<IssueInvoicesResult, InvoiceServiceError>;
}
