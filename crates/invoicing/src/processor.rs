use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use hanko_jobs_core::{CancellationToken, Message, Processor, permanent};

use crate::service::{InvoiceService, IssueInvoicesCommand};

/// Processor for invoice issuance subscriptions.
///
/// A processor without a service acknowledges every message as a permanent
/// failure; worker binaries refuse to start in that state.
#[derive(Clone, Default)]
pub struct InvoiceProcessor {
    service: Option<Arc<dyn InvoiceService>>,
}

impl InvoiceProcessor {
    pub fn new(service: Option<Arc<dyn InvoiceService>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Processor for InvoiceProcessor {
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        let Some(service) = &self.service else {
            error!(
                message = %message.debug_string(),
                "invoice processor: service not configured"
            );
            return Err(permanent(anyhow::anyhow!(
                "invoice processor: service not configured"
            )));
        };

        let mut command: IssueInvoicesCommand = match message.decode_json() {
            Ok(command) => command,
            Err(err) => {
                error!(
                    message_id = %message.id,
                    error = %err,
                    "invoice processor: failed to decode payload"
                );
                return Err(permanent(
                    anyhow::Error::new(err).context("decode invoice message"),
                ));
            }
        };

        command.actor_id = command.actor_id.trim().to_string();
        if command.actor_id.is_empty() {
            error!(
                message = %message.debug_string(),
                "invoice processor: missing actorId"
            );
            return Err(permanent(anyhow::anyhow!(
                "invoice processor: actorId is required"
            )));
        }

        let actor_id = command.actor_id.clone();
        let orders = command.order_ids.len();
        match service.issue_invoices(ctx, command).await {
            Ok(result) => {
                info!(
                    actor_id = %actor_id,
                    orders,
                    issued = result.issued.len(),
                    skipped = result.skipped.len(),
                    "invoice processor: batch issued"
                );
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                warn!(
                    actor_id = %actor_id,
                    error = %err,
                    "invoice processor: permanent error"
                );
                Err(permanent(err))
            }
            Err(err) => {
                error!(
                    actor_id = %actor_id,
                    error = %err,
                    "invoice processor: transient error"
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{InvoiceServiceError, IssueInvoicesResult, IssuedInvoice};
    use hanko_jobs_core::{is_permanent, run_one};
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Service that replays a scripted outcome and records every command.
    struct ScriptedService {
        outcome: fn() -> Result<IssueInvoicesResult, InvoiceServiceError>,
        commands: Mutex<Vec<IssueInvoicesCommand>>,
    }

    impl ScriptedService {
        fn new(outcome: fn() -> Result<IssueInvoicesResult, InvoiceServiceError>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InvoiceService for ScriptedService {
        async fn issue_invoices(
            &self,
            _ctx: &CancellationToken,
            command: IssueInvoicesCommand,
        ) -> Result<IssueInvoicesResult, InvoiceServiceError> {
            self.commands.lock().unwrap().push(command);
            (self.outcome)()
        }
    }

    fn issued() -> Result<IssueInvoicesResult, InvoiceServiceError> {
        Ok(IssueInvoicesResult {
            issued: vec![IssuedInvoice {
                order_id: "o1".to_string(),
                invoice_number: "INV-0001".to_string(),
            }],
            skipped: vec![],
        })
    }

    fn message(payload: &str) -> Message {
        Message {
            id: "msg_1".to_string(),
            data: payload.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn issues_trimmed_command() {
        let service = ScriptedService::new(issued);
        let processor = InvoiceProcessor::new(Some(service.clone()));

        run_one(
            &CancellationToken::new(),
            &processor,
            message(r#"{"actorId":" staff_1 ","orderIds":["o1"]}"#),
        )
        .await
        .unwrap();

        let commands = service.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].actor_id, "staff_1");
        assert_eq!(commands[0].order_ids, vec!["o1"]);
    }

    #[tokio::test]
    async fn missing_service_is_permanent() {
        let err = run_one(
            &CancellationToken::new(),
            &InvoiceProcessor::new(None),
            message(r#"{"actorId":"staff_1"}"#),
        )
        .await
        .unwrap_err();
        assert!(is_permanent(&err));
    }

    #[tokio::test]
    async fn invalid_payloads_never_reach_service() {
        let service = ScriptedService::new(issued);
        let processor = InvoiceProcessor::new(Some(service.clone()));

        for payload in ["{", r#"{"actorId":"  ","orderIds":["o1"]}"#, "{}"] {
            let err = run_one(&CancellationToken::new(), &processor, message(payload))
                .await
                .unwrap_err();
            assert!(is_permanent(&err), "{payload}");
        }
        assert!(service.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn service_errors_are_split() {
        let cases: [(fn() -> Result<IssueInvoicesResult, InvoiceServiceError>, bool); 4] = [
            (|| Err(InvoiceServiceError::InvalidInput("limit".into())), true),
            (|| Err(InvoiceServiceError::Conflict("already issued".into())), true),
            (|| Err(InvoiceServiceError::OrderNotFound("o9".into())), true),
            (
                || Err(InvoiceServiceError::Unavailable(anyhow::anyhow!("firestore"))),
                false,
            ),
        ];

        for (outcome, expect_permanent) in cases {
            let processor = InvoiceProcessor::new(Some(ScriptedService::new(outcome)));
            let err = run_one(
                &CancellationToken::new(),
                &processor,
                message(r#"{"actorId":"staff_1"}"#),
            )
            .await
            .unwrap_err();
            assert_eq!(is_permanent(&err), expect_permanent, "{err}");
        }
    }

    proptest! {
        #[test]
        fn blank_actor_is_always_permanent(actor in "[ \t\n]{0,8}") {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let payload = serde_json::json!({ "actorId": actor }).to_string();
            let result = runtime.block_on(run_one(
                &CancellationToken::new(),
                &InvoiceProcessor::new(Some(ScriptedService::new(issued))),
                message(&payload),
            ));
            prop_assert!(result.is_err_and(|err| is_permanent(&err)));
        }
    }
}
