//! Notification collaborator interface.
//!
//! Delivery (push, email) lives outside the core. The ledger and escrow
//! engines emit notification requests through this trait after their atomic
//! units commit; a failed delivery is logged and never rolls anything back.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use async_trait::async_trait;
use atelier_types::AccountId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Events the core asks the platform to tell a party about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CreditsLow,
    CreditsExhausted,
    EscrowFunded,
    MilestoneReleased,
    EscrowCompleted,
    EscrowDisputed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::CreditsLow => "credits_low",
            NotificationKind::CreditsExhausted => "credits_exhausted",
            NotificationKind::EscrowFunded => "escrow_funded",
            NotificationKind::MilestoneReleased => "milestone_released",
            NotificationKind::EscrowCompleted => "escrow_completed",
            NotificationKind::EscrowDisputed => "escrow_disputed",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Notification delivery seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        account_id: &AccountId,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotifyError>;
}

/// Fire-and-forget dispatch: failures are logged at `warn` and swallowed.
pub async fn dispatch(
    notifier: &dyn Notifier,
    account_id: &AccountId,
    kind: NotificationKind,
    payload: Value,
) {
    if let Err(err) = notifier.notify(account_id, kind, payload).await {
        tracing::warn!(
            account_id = %account_id,
            kind = %kind,
            error = %err,
            "notification delivery failed"
        );
    }
}

/// Notifier that only logs. The default wiring for deployments where
/// delivery is handled by a separate consumer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        account_id: &AccountId,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            account_id = %account_id,
            kind = %kind,
            payload = %payload,
            "notification requested"
        );
        Ok(())
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentNotification {
    pub account_id: AccountId,
    pub kind: NotificationKind,
    pub payload: Value,
}

/// Notifier that records every request, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    pub fn sent_of_kind(&self, kind: NotificationKind) -> Vec<SentNotification> {
        self.sent()
            .into_iter()
            .filter(|notification| notification.kind == kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        account_id: &AccountId,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        let mut guard = self
            .sent
            .lock()
            .map_err(|_| NotifyError::Delivery("recording lock poisoned".to_string()))?;
        guard.push(SentNotification {
            account_id: account_id.clone(),
            kind,
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_notifier_captures_requests() {
        let notifier = RecordingNotifier::new();
        let account = AccountId::new("acct-1");

        notifier
            .notify(
                &account,
                NotificationKind::CreditsLow,
                serde_json::json!({"balance": 2}),
            )
            .await
            .unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::CreditsLow);
        assert_eq!(sent[0].account_id, account);
    }

    #[tokio::test]
    async fn dispatch_swallows_delivery_failures() {
        struct FailingNotifier;

        #[async_trait]
        impl Notifier for FailingNotifier {
            async fn notify(
                &self,
                _account_id: &AccountId,
                _kind: NotificationKind,
                _payload: Value,
            ) -> Result<(), NotifyError> {
                Err(NotifyError::Delivery("push service down".to_string()))
            }
        }

        // Must not panic or propagate.
        dispatch(
            &FailingNotifier,
            &AccountId::new("acct-1"),
            NotificationKind::CreditsExhausted,
            Value::Null,
        )
        .await;
    }
}
