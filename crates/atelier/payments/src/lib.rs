//! Purchase completion over an opaque payment provider.
//!
//! The provider is consumed through the narrow [`PaymentGateway`] trait:
//! initialize a charge, verify a reference. Completion trusts only the
//! verification result, and the credit it applies carries the provider
//! reference, so the ledger's atomic dedup makes every path into this
//! module - client completion call, webhook, reconciliation sweep - safely
//! replayable.

#![deny(unsafe_code)]

use async_trait::async_trait;
use atelier_ledger::{CreditLedger, LedgerError, LedgerReceipt};
use atelier_types::{AccountId, ExternalReference, TransactionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// A charge initialized with the provider: where to send the payer, and the
/// provider-assigned reference that later drives verification and dedup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentSession {
    pub redirect_url: String,
    pub reference: ExternalReference,
}

/// What the provider reports for a reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub success: bool,
    pub amount_minor: i64,
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub metadata: Value,
}

/// Payment provider seam.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(
        &self,
        payer: &AccountId,
        amount_minor: i64,
        metadata: Value,
    ) -> Result<PaymentSession, PaymentError>;

    async fn verify(
        &self,
        reference: &ExternalReference,
    ) -> Result<PaymentVerification, PaymentError>;
}

/// Provider callback payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub reference: ExternalReference,
    #[serde(default)]
    pub metadata: Value,
}

/// What happened to a webhook.
#[derive(Debug)]
pub enum WebhookDisposition {
    Processed(LedgerReceipt),
    Ignored { reason: String },
}

/// Outcome of a reconciliation sweep.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub completed: Vec<ExternalReference>,
    pub replayed: Vec<ExternalReference>,
    pub failed: Vec<(ExternalReference, PaymentError)>,
}

/// Payment errors. A failed verification records nothing.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("verification failed for reference {reference}")]
    VerificationFailed { reference: String },

    #[error("verification for reference {reference} names no account")]
    MissingAccount { reference: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Processor tuning: which webhook events count as successful charges and
/// which metadata marker claims them for this ledger.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub success_event_type: String,
    pub marker_key: String,
    pub marker_value: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            success_event_type: "charge.success".to_string(),
            marker_key: "purpose".to_string(),
            marker_value: "credits".to_string(),
        }
    }
}

/// Drives a purchase from provider charge to ledger credit.
pub struct PurchaseProcessor {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<CreditLedger>,
    config: ProcessorConfig,
}

impl PurchaseProcessor {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<CreditLedger>) -> Self {
        Self::with_config(gateway, ledger, ProcessorConfig::default())
    }

    pub fn with_config(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<CreditLedger>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            config,
        }
    }

    /// Initialize a charge with the provider. No ledger mutation happens
    /// here; credits move only after verification succeeds.
    pub async fn start_purchase(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        metadata: Value,
    ) -> Result<PaymentSession, PaymentError> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidAmount(amount_minor));
        }

        let mut metadata = match metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            self.config.marker_key.clone(),
            Value::String(self.config.marker_value.clone()),
        );

        let session = self
            .gateway
            .initialize(account_id, amount_minor, Value::Object(metadata))
            .await?;
        tracing::info!(
            account_id = %account_id,
            amount = amount_minor,
            reference = %session.reference,
            "purchase initialized"
        );
        Ok(session)
    }

    /// Complete a purchase by provider reference. Safe to call any number
    /// of times: an already-processed reference returns the recorded
    /// outcome without touching the provider or the balance.
    pub async fn complete_purchase(
        &self,
        reference: &ExternalReference,
    ) -> Result<LedgerReceipt, PaymentError> {
        if let Some(existing) = self.ledger.lookup_reference(reference).await? {
            let balance = self.ledger.balance(&existing.account_id).await?;
            tracing::info!(
                reference = %reference,
                "purchase already completed, returning recorded outcome"
            );
            return Ok(LedgerReceipt {
                balance_minor: balance,
                replayed: true,
                transaction: existing,
            });
        }

        let verification = self.gateway.verify(reference).await?;
        if !verification.success {
            tracing::warn!(reference = %reference, "charge verification failed");
            return Err(PaymentError::VerificationFailed {
                reference: reference.0.clone(),
            });
        }
        let account_id = verification
            .account_id
            .ok_or_else(|| PaymentError::MissingAccount {
                reference: reference.0.clone(),
            })?;
        if verification.amount_minor <= 0 {
            return Err(PaymentError::InvalidAmount(verification.amount_minor));
        }

        // The reference rides on the credit, so a concurrent duplicate of
        // this call collapses inside the ledger's atomic unit.
        let receipt = self
            .ledger
            .credit(
                &account_id,
                verification.amount_minor,
                TransactionKind::Purchase,
                Some(reference.clone()),
                None,
                verification.metadata,
            )
            .await?;
        tracing::info!(
            account_id = %account_id,
            reference = %reference,
            amount = verification.amount_minor,
            replayed = receipt.replayed,
            "purchase completed"
        );
        Ok(receipt)
    }

    /// Provider callback intake. Anything that is not a successful charge
    /// marked for this ledger is ignored; the rest goes through the same
    /// verify-then-credit path as a client completion call.
    pub async fn handle_webhook(
        &self,
        event: WebhookEvent,
    ) -> Result<WebhookDisposition, PaymentError> {
        if event.event_type != self.config.success_event_type {
            return Ok(WebhookDisposition::Ignored {
                reason: format!("event type {} is not a successful charge", event.event_type),
            });
        }
        let marked = event
            .metadata
            .get(&self.config.marker_key)
            .and_then(Value::as_str)
            == Some(self.config.marker_value.as_str());
        if !marked {
            return Ok(WebhookDisposition::Ignored {
                reason: "event is not marked as a ledger credit".to_string(),
            });
        }

        let receipt = self.complete_purchase(&event.reference).await?;
        Ok(WebhookDisposition::Processed(receipt))
    }

    /// Re-attempt completions that failed earlier (verify timeouts that a
    /// later webhook showed to have succeeded upstream). Each unit is one
    /// idempotent completion; failures are reported, never retried here.
    pub async fn reconcile(&self, references: &[ExternalReference]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for reference in references {
            match self.complete_purchase(reference).await {
                Ok(receipt) if receipt.replayed => report.replayed.push(reference.clone()),
                Ok(_) => report.completed.push(reference.clone()),
                Err(err) => {
                    tracing::warn!(
                        reference = %reference,
                        error = %err,
                        "reconciliation attempt failed"
                    );
                    report.failed.push((reference.clone(), err));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_notify::LogNotifier;
    use atelier_storage::memory::InMemoryAtelierStorage;
    use atelier_storage::QueryWindow;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Gateway stub with scripted verification results.
    #[derive(Default)]
    struct TestGateway {
        verifications: Mutex<HashMap<String, PaymentVerification>>,
    }

    impl TestGateway {
        fn script(&self, reference: &str, verification: PaymentVerification) {
            self.verifications
                .lock()
                .unwrap()
                .insert(reference.to_string(), verification);
        }
    }

    #[async_trait]
    impl PaymentGateway for TestGateway {
        async fn initialize(
            &self,
            payer: &AccountId,
            amount_minor: i64,
            metadata: Value,
        ) -> Result<PaymentSession, PaymentError> {
            let reference = ExternalReference::new(format!("pay_{payer}"));
            self.script(
                reference.as_str(),
                PaymentVerification {
                    success: true,
                    amount_minor,
                    account_id: Some(payer.clone()),
                    metadata,
                },
            );
            Ok(PaymentSession {
                redirect_url: format!("https://pay.example/{reference}"),
                reference,
            })
        }

        async fn verify(
            &self,
            reference: &ExternalReference,
        ) -> Result<PaymentVerification, PaymentError> {
            self.verifications
                .lock()
                .unwrap()
                .get(reference.as_str())
                .cloned()
                .ok_or_else(|| PaymentError::Gateway(format!("unknown reference {reference}")))
        }
    }

    fn setup() -> (Arc<TestGateway>, Arc<CreditLedger>, PurchaseProcessor) {
        let storage = Arc::new(InMemoryAtelierStorage::new());
        let ledger = Arc::new(CreditLedger::new(storage, Arc::new(LogNotifier)));
        let gateway = Arc::new(TestGateway::default());
        let processor = PurchaseProcessor::new(gateway.clone(), ledger.clone());
        (gateway, ledger, processor)
    }

    async fn open(ledger: &CreditLedger, id: &str) -> AccountId {
        let account = AccountId::new(id);
        ledger.open_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn completion_credits_once_and_replays_after() {
        let (_, ledger, processor) = setup();
        let account = open(&ledger, "acct-1").await;

        let session = processor
            .start_purchase(&account, 10, Value::Null)
            .await
            .unwrap();
        assert_eq!(ledger.balance(&account).await.unwrap(), 0);

        let first = processor.complete_purchase(&session.reference).await.unwrap();
        assert!(!first.replayed);
        assert_eq!(first.balance_minor, 10);

        let second = processor.complete_purchase(&session.reference).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.balance_minor, 10);

        let statement = ledger
            .statement(&account, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(statement.len(), 1);
    }

    #[tokio::test]
    async fn failed_verification_records_no_transaction() {
        let (gateway, ledger, processor) = setup();
        let account = open(&ledger, "acct-1").await;

        let reference = ExternalReference::new("pay_declined");
        gateway.script(
            reference.as_str(),
            PaymentVerification {
                success: false,
                amount_minor: 10,
                account_id: Some(account.clone()),
                metadata: Value::Null,
            },
        );

        let result = processor.complete_purchase(&reference).await;
        assert!(matches!(
            result,
            Err(PaymentError::VerificationFailed { .. })
        ));
        assert_eq!(ledger.balance(&account).await.unwrap(), 0);
        let statement = ledger
            .statement(&account, QueryWindow::default())
            .await
            .unwrap();
        assert!(statement.is_empty());
    }

    #[tokio::test]
    async fn webhook_filters_event_type_and_marker() {
        let (_, ledger, processor) = setup();
        let account = open(&ledger, "acct-1").await;
        let session = processor
            .start_purchase(&account, 10, Value::Null)
            .await
            .unwrap();

        let wrong_type = processor
            .handle_webhook(WebhookEvent {
                event_type: "charge.refunded".to_string(),
                reference: session.reference.clone(),
                metadata: serde_json::json!({"purpose": "credits"}),
            })
            .await
            .unwrap();
        assert!(matches!(wrong_type, WebhookDisposition::Ignored { .. }));

        let unmarked = processor
            .handle_webhook(WebhookEvent {
                event_type: "charge.success".to_string(),
                reference: session.reference.clone(),
                metadata: serde_json::json!({"purpose": "marketplace-order"}),
            })
            .await
            .unwrap();
        assert!(matches!(unmarked, WebhookDisposition::Ignored { .. }));
        assert_eq!(ledger.balance(&account).await.unwrap(), 0);

        let processed = processor
            .handle_webhook(WebhookEvent {
                event_type: "charge.success".to_string(),
                reference: session.reference,
                metadata: serde_json::json!({"purpose": "credits"}),
            })
            .await
            .unwrap();
        assert!(matches!(processed, WebhookDisposition::Processed(_)));
        assert_eq!(ledger.balance(&account).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn reconcile_reports_each_reference_once() {
        let (gateway, ledger, processor) = setup();
        let account = open(&ledger, "acct-1").await;

        let fresh = processor
            .start_purchase(&account, 5, Value::Null)
            .await
            .unwrap()
            .reference;
        let done = ExternalReference::new("pay_done");
        gateway.script(
            done.as_str(),
            PaymentVerification {
                success: true,
                amount_minor: 7,
                account_id: Some(account.clone()),
                metadata: Value::Null,
            },
        );
        processor.complete_purchase(&done).await.unwrap();
        let unknown = ExternalReference::new("pay_lost");

        let report = processor
            .reconcile(&[fresh.clone(), done.clone(), unknown.clone()])
            .await;
        assert_eq!(report.completed, vec![fresh]);
        assert_eq!(report.replayed, vec![done]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, unknown);
        assert_eq!(ledger.balance(&account).await.unwrap(), 12);
    }
}
