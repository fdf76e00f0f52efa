//! Credit ledger - the single writer of account balances.
//!
//! Every balance change is one [`atelier_storage::LedgerStore::apply_entry`]
//! call: the storage backend locks the account row, enforces the
//! non-negative floor, deduplicates by external reference, and writes the
//! account and the journal entry together. This facade adds amount
//! validation, the error taxonomy callers see, and the post-commit
//! low-balance notification side effect.

#![deny(unsafe_code)]

use atelier_notify::{dispatch, NotificationKind, Notifier};
use atelier_storage::{
    compute_entry_hash, AtelierStorage, EntryAppend, QueryWindow, StorageError, TransactionRecord,
};
use atelier_types::{AccountId, EngagementId, ExternalReference, TransactionKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Ledger tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct LedgerConfig {
    /// Debits that take the balance to or below this value fire a
    /// credits-low notification; reaching zero fires credits-exhausted.
    pub low_balance_threshold_minor: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            low_balance_threshold_minor: 10,
        }
    }
}

/// Outcome of a ledger operation.
///
/// `replayed` means the external reference had already been processed: the
/// transaction is the originally recorded one and no balance moved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction: TransactionRecord,
    pub balance_minor: i64,
    pub replayed: bool,
}

/// Result of a full journal replay for one account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub account_id: AccountId,
    pub transaction_count: usize,
    pub balance_minor: i64,
}

/// Ledger errors. Every rejection leaves the account untouched and carries
/// the authoritative state the caller needs to decide what to do next.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("insufficient balance: required {required_minor}, available {available_minor}")]
    InsufficientBalance {
        required_minor: i64,
        available_minor: i64,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("busy, retry: {0}")]
    Busy(String),

    #[error("journal integrity violation: {0}")]
    Integrity(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::AccountNotFound(msg),
            StorageError::InsufficientFunds {
                required_minor,
                available_minor,
            } => Self::InsufficientBalance {
                required_minor,
                available_minor,
            },
            StorageError::Busy(msg) => Self::Busy(msg),
            StorageError::Conflict(msg) | StorageError::InvariantViolation(msg) => {
                Self::Conflict(msg)
            }
            StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}

/// The credit ledger facade.
pub struct CreditLedger {
    storage: Arc<dyn AtelierStorage>,
    notifier: Arc<dyn Notifier>,
    config: LedgerConfig,
}

impl CreditLedger {
    pub fn new(storage: Arc<dyn AtelierStorage>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_config(storage, notifier, LedgerConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn AtelierStorage>,
        notifier: Arc<dyn Notifier>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            storage,
            notifier,
            config,
        }
    }

    /// Create an account with a zero balance, at onboarding.
    pub async fn open_account(&self, account_id: &AccountId) -> Result<(), LedgerError> {
        self.storage.create_account(account_id, Utc::now()).await?;
        tracing::info!(account_id = %account_id, "account opened");
        Ok(())
    }

    /// Current balance.
    pub async fn balance(&self, account_id: &AccountId) -> Result<i64, LedgerError> {
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.0.clone()))?;
        Ok(account.balance_minor)
    }

    /// Charge credits from an account.
    pub async fn debit(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        kind: TransactionKind,
        correlation_id: Option<EngagementId>,
        metadata: Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount_minor <= 0 {
            return Err(LedgerError::InvalidAmount(amount_minor));
        }

        let mut append = EntryAppend::new(account_id.clone(), kind, -amount_minor)
            .with_metadata(metadata);
        if let Some(correlation_id) = correlation_id {
            append = append.with_correlation(correlation_id);
        }
        let applied = self.storage.apply_entry(append, Utc::now()).await?;

        tracing::info!(
            account_id = %account_id,
            amount = amount_minor,
            balance = applied.account.balance_minor,
            kind = %kind,
            "debit applied"
        );
        self.notify_if_low(
            account_id,
            applied.transaction.balance_before_minor,
            applied.account.balance_minor,
        )
        .await;

        Ok(LedgerReceipt {
            balance_minor: applied.account.balance_minor,
            replayed: false,
            transaction: applied.transaction,
        })
    }

    /// Add credits to an account, idempotent on the external reference.
    pub async fn credit(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        kind: TransactionKind,
        external_reference: Option<ExternalReference>,
        correlation_id: Option<EngagementId>,
        metadata: Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount_minor <= 0 {
            return Err(LedgerError::InvalidAmount(amount_minor));
        }

        let mut append = EntryAppend::new(account_id.clone(), kind, amount_minor)
            .with_metadata(metadata);
        if let Some(reference) = external_reference {
            append = append.with_external_reference(reference);
        }
        if let Some(correlation_id) = correlation_id {
            append = append.with_correlation(correlation_id);
        }
        let applied = self.storage.apply_entry(append, Utc::now()).await?;

        if applied.replayed {
            tracing::info!(
                account_id = %account_id,
                reference = ?applied.transaction.external_reference,
                "credit replayed, no balance change"
            );
        } else {
            tracing::info!(
                account_id = %account_id,
                amount = amount_minor,
                balance = applied.account.balance_minor,
                kind = %kind,
                "credit applied"
            );
        }

        Ok(LedgerReceipt {
            balance_minor: applied.account.balance_minor,
            replayed: applied.replayed,
            transaction: applied.transaction,
        })
    }

    /// Credit back a previous charge. No matching debit is required.
    pub async fn refund(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        external_reference: Option<ExternalReference>,
        metadata: Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.credit(
            account_id,
            amount_minor,
            TransactionKind::Refund,
            external_reference,
            None,
            metadata,
        )
        .await
    }

    /// Grant promotional credits.
    pub async fn bonus(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        metadata: Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.credit(
            account_id,
            amount_minor,
            TransactionKind::Bonus,
            None,
            None,
            metadata,
        )
        .await
    }

    /// Signed support-tooling adjustment. The balance floor still applies.
    pub async fn admin_adjust(
        &self,
        account_id: &AccountId,
        amount_minor: i64,
        metadata: Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount_minor == 0 {
            return Err(LedgerError::InvalidAmount(amount_minor));
        }
        let append = EntryAppend::new(
            account_id.clone(),
            TransactionKind::AdminAdjustment,
            amount_minor,
        )
        .with_metadata(metadata);
        let applied = self.storage.apply_entry(append, Utc::now()).await?;

        tracing::info!(
            account_id = %account_id,
            amount = amount_minor,
            balance = applied.account.balance_minor,
            "admin adjustment applied"
        );

        Ok(LedgerReceipt {
            balance_minor: applied.account.balance_minor,
            replayed: applied.replayed,
            transaction: applied.transaction,
        })
    }

    /// The transaction previously recorded for an external reference.
    pub async fn lookup_reference(
        &self,
        reference: &ExternalReference,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.storage.find_by_external_reference(reference).await?)
    }

    /// Journal entries for an account, newest first.
    pub async fn statement(
        &self,
        account_id: &AccountId,
        window: QueryWindow,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let mut entries = self.storage.list_transactions(account_id, window).await?;
        entries.reverse();
        Ok(entries)
    }

    /// Replay the full journal and check it against the stored balance:
    /// every entry must chain `balance_before -> balance_after`, hash-link
    /// to its predecessor, and the final balance must match the account.
    pub async fn verify_account(&self, account_id: &AccountId) -> Result<LedgerAudit, LedgerError> {
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.0.clone()))?;
        let entries = self
            .storage
            .list_transactions(account_id, QueryWindow::default())
            .await?;

        let mut running = 0_i64;
        let mut previous_hash: Option<String> = None;
        for entry in &entries {
            if entry.balance_before_minor != running {
                return Err(LedgerError::Integrity(format!(
                    "entry {} starts from {}, journal reconstructs {}",
                    entry.transaction_id, entry.balance_before_minor, running
                )));
            }
            if entry.balance_after_minor != entry.balance_before_minor + entry.amount_minor {
                return Err(LedgerError::Integrity(format!(
                    "entry {} breaks balance arithmetic",
                    entry.transaction_id
                )));
            }
            if entry.previous_hash != previous_hash {
                return Err(LedgerError::Integrity(format!(
                    "entry {} breaks the hash chain link",
                    entry.transaction_id
                )));
            }
            let expected_hash = compute_entry_hash(
                &entry.account_id,
                entry.kind,
                entry.amount_minor,
                entry.balance_before_minor,
                entry.balance_after_minor,
                entry.external_reference.as_ref(),
                entry.created_at,
                entry.previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash {
                return Err(LedgerError::Integrity(format!(
                    "entry {} hash does not match its content",
                    entry.transaction_id
                )));
            }
            running = entry.balance_after_minor;
            previous_hash = Some(entry.entry_hash.clone());
        }

        if running != account.balance_minor {
            return Err(LedgerError::Integrity(format!(
                "journal reconstructs {}, account holds {}",
                running, account.balance_minor
            )));
        }

        Ok(LedgerAudit {
            account_id: account_id.clone(),
            transaction_count: entries.len(),
            balance_minor: account.balance_minor,
        })
    }

    async fn notify_if_low(&self, account_id: &AccountId, before: i64, after: i64) {
        let threshold = self.config.low_balance_threshold_minor;
        if after == 0 {
            dispatch(
                self.notifier.as_ref(),
                account_id,
                NotificationKind::CreditsExhausted,
                serde_json::json!({ "balance_minor": after }),
            )
            .await;
        } else if before > threshold && after <= threshold {
            dispatch(
                self.notifier.as_ref(),
                account_id,
                NotificationKind::CreditsLow,
                serde_json::json!({ "balance_minor": after, "threshold_minor": threshold }),
            )
            .await;
        }
    }
}
