//! Atelier integration - re-exports the core crates and provides the
//! reference wiring used by the end-to-end scenario tests.

#![deny(unsafe_code)]

pub use atelier_escrow;
pub use atelier_gate;
pub use atelier_ledger;
pub use atelier_notify;
pub use atelier_payments;
pub use atelier_storage;
pub use atelier_types;

use async_trait::async_trait;
use atelier_escrow::EscrowEngine;
use atelier_gate::WorkflowGate;
use atelier_ledger::CreditLedger;
use atelier_notify::RecordingNotifier;
use atelier_payments::{
    PaymentError, PaymentGateway, PaymentSession, PaymentVerification, PurchaseProcessor,
};
use atelier_storage::memory::InMemoryAtelierStorage;
use atelier_storage::AtelierStorage;
use atelier_types::{AccountId, ExternalReference};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// All core engines wired over one storage backend.
pub struct Platform {
    pub storage: Arc<dyn AtelierStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Arc<ScriptedGateway>,
    pub ledger: Arc<CreditLedger>,
    pub escrow: EscrowEngine,
    pub gate: WorkflowGate,
    pub payments: PurchaseProcessor,
}

impl Platform {
    /// Wire everything over the in-memory backend with a recording
    /// notifier and a scripted gateway.
    pub fn in_memory() -> Self {
        let storage: Arc<dyn AtelierStorage> = Arc::new(InMemoryAtelierStorage::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let ledger = Arc::new(CreditLedger::new(storage.clone(), notifier.clone()));
        let escrow = EscrowEngine::new(storage.clone(), notifier.clone());
        let gate = WorkflowGate::new(storage.clone());
        let payments = PurchaseProcessor::new(gateway.clone(), ledger.clone());
        Self {
            storage,
            notifier,
            gateway,
            ledger,
            escrow,
            gate,
            payments,
        }
    }
}

/// Gateway whose verification results are scripted by the caller.
/// `initialize` auto-scripts a successful verification for the charge it
/// creates, mirroring a provider that settles instantly.
#[derive(Default)]
pub struct ScriptedGateway {
    verifications: Mutex<HashMap<String, PaymentVerification>>,
    issued: Mutex<u64>,
}

impl ScriptedGateway {
    pub fn script(&self, reference: &ExternalReference, verification: PaymentVerification) {
        self.verifications
            .lock()
            .expect("gateway lock")
            .insert(reference.0.clone(), verification);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn initialize(
        &self,
        payer: &AccountId,
        amount_minor: i64,
        metadata: Value,
    ) -> Result<PaymentSession, PaymentError> {
        let serial = {
            let mut issued = self.issued.lock().expect("gateway lock");
            *issued += 1;
            *issued
        };
        let reference = ExternalReference::new(format!("pay_{serial:04}"));
        self.script(
            &reference,
            PaymentVerification {
                success: true,
                amount_minor,
                account_id: Some(payer.clone()),
                metadata,
            },
        );
        Ok(PaymentSession {
            redirect_url: format!("https://checkout.example/{reference}"),
            reference,
        })
    }

    async fn verify(
        &self,
        reference: &ExternalReference,
    ) -> Result<PaymentVerification, PaymentError> {
        self.verifications
            .lock()
            .expect("gateway lock")
            .get(&reference.0)
            .cloned()
            .ok_or_else(|| PaymentError::Gateway(format!("unknown reference {reference}")))
    }
}
