//! In-memory reference implementation for the atelier storage traits.
//!
//! Deterministic and test-friendly. Each compound operation runs under one
//! write lock, which gives it the same all-or-nothing behavior the postgres
//! adapter gets from row locks and transactions.

use crate::model::{
    compute_entry_hash, AccountRecord, ActionClaim, ActionOutcome, AppliedEntry,
    EngagementStateRecord, EntryAppend, EscrowRecord, MilestoneRecord, ReleaseOutcome,
    TransactionRecord,
};
use crate::traits::{
    AccountStore, EngagementStateStore, EscrowStore, LedgerStore, QueryWindow,
};
use crate::{StorageError, StorageResult};
use atelier_types::{
    AccountId, EngagementId, EscrowStatus, ExternalReference, MilestoneId, MilestoneStatus,
    TransactionId, WorkflowPhase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Ledger tables guarded by one lock so the balance write and the journal
/// append cannot be observed apart.
#[derive(Default)]
struct LedgerTables {
    accounts: HashMap<AccountId, AccountRecord>,
    transactions: Vec<TransactionRecord>,
}

/// Escrow tables guarded together for the same reason.
#[derive(Default)]
struct EscrowTables {
    escrows: HashMap<EngagementId, EscrowRecord>,
    milestones: HashMap<EngagementId, Vec<MilestoneRecord>>,
}

/// In-memory atelier storage adapter.
#[derive(Default)]
pub struct InMemoryAtelierStorage {
    ledger: RwLock<LedgerTables>,
    escrow: RwLock<EscrowTables>,
    states: RwLock<HashMap<EngagementId, EngagementStateRecord>>,
}

impl InMemoryAtelierStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(table: &str) -> StorageError {
    StorageError::Backend(format!("{table} lock poisoned"))
}

#[async_trait]
impl AccountStore for InMemoryAtelierStorage {
    async fn create_account(
        &self,
        account_id: &AccountId,
        at: DateTime<Utc>,
    ) -> StorageResult<AccountRecord> {
        let mut guard = self.ledger.write().map_err(|_| poisoned("ledger"))?;
        if guard.accounts.contains_key(account_id) {
            return Err(StorageError::Conflict(format!(
                "account {} already exists",
                account_id
            )));
        }
        let record = AccountRecord {
            account_id: account_id.clone(),
            balance_minor: 0,
            created_at: at,
            updated_at: at,
        };
        guard.accounts.insert(account_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_account(&self, account_id: &AccountId) -> StorageResult<Option<AccountRecord>> {
        let guard = self.ledger.read().map_err(|_| poisoned("ledger"))?;
        Ok(guard.accounts.get(account_id).cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryAtelierStorage {
    async fn apply_entry(
        &self,
        append: EntryAppend,
        at: DateTime<Utc>,
    ) -> StorageResult<AppliedEntry> {
        if append.amount_minor == 0 {
            return Err(StorageError::InvalidInput(
                "entry amount must be non-zero".to_string(),
            ));
        }

        let mut guard = self.ledger.write().map_err(|_| poisoned("ledger"))?;

        // Replay check and mutation share this one lock scope.
        if let Some(reference) = &append.external_reference {
            if let Some(existing) = guard
                .transactions
                .iter()
                .find(|txn| txn.external_reference.as_ref() == Some(reference))
                .cloned()
            {
                let account = guard
                    .accounts
                    .get(&existing.account_id)
                    .cloned()
                    .ok_or_else(|| {
                        StorageError::Backend(format!(
                            "journal references missing account {}",
                            existing.account_id
                        ))
                    })?;
                return Ok(AppliedEntry {
                    transaction: existing,
                    account,
                    replayed: true,
                });
            }
        }

        let account = guard.accounts.get(&append.account_id).cloned().ok_or_else(|| {
            StorageError::NotFound(format!("account {} not found", append.account_id))
        })?;

        let balance_before = account.balance_minor;
        let balance_after = balance_before + append.amount_minor;
        if balance_after < 0 {
            return Err(StorageError::InsufficientFunds {
                required_minor: -append.amount_minor,
                available_minor: balance_before,
            });
        }

        let previous_hash = guard
            .transactions
            .iter()
            .rev()
            .find(|txn| txn.account_id == append.account_id)
            .map(|txn| txn.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            &append.account_id,
            append.kind,
            append.amount_minor,
            balance_before,
            balance_after,
            append.external_reference.as_ref(),
            at,
            previous_hash.as_deref(),
        );

        let transaction = TransactionRecord {
            transaction_id: TransactionId::generate(),
            account_id: append.account_id.clone(),
            kind: append.kind,
            amount_minor: append.amount_minor,
            balance_before_minor: balance_before,
            balance_after_minor: balance_after,
            external_reference: append.external_reference,
            correlation_id: append.correlation_id,
            metadata: append.metadata,
            previous_hash,
            entry_hash,
            created_at: at,
        };

        let account = {
            let stored = guard.accounts.get_mut(&append.account_id).ok_or_else(|| {
                StorageError::NotFound(format!("account {} not found", append.account_id))
            })?;
            stored.balance_minor = balance_after;
            stored.updated_at = at;
            stored.clone()
        };
        guard.transactions.push(transaction.clone());

        Ok(AppliedEntry {
            transaction,
            account,
            replayed: false,
        })
    }

    async fn find_by_external_reference(
        &self,
        reference: &ExternalReference,
    ) -> StorageResult<Option<TransactionRecord>> {
        let guard = self.ledger.read().map_err(|_| poisoned("ledger"))?;
        Ok(guard
            .transactions
            .iter()
            .find(|txn| txn.external_reference.as_ref() == Some(reference))
            .cloned())
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let guard = self.ledger.read().map_err(|_| poisoned("ledger"))?;
        let values = guard
            .transactions
            .iter()
            .filter(|txn| &txn.account_id == account_id)
            .cloned()
            .collect::<Vec<_>>();
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl EscrowStore for InMemoryAtelierStorage {
    async fn create_escrow(&self, escrow: EscrowRecord) -> StorageResult<()> {
        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        if guard.escrows.contains_key(&escrow.engagement_id) {
            return Err(StorageError::Conflict(format!(
                "escrow for engagement {} already exists",
                escrow.engagement_id
            )));
        }
        guard.escrows.insert(escrow.engagement_id.clone(), escrow);
        Ok(())
    }

    async fn get_escrow(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Option<EscrowRecord>> {
        let guard = self.escrow.read().map_err(|_| poisoned("escrow"))?;
        Ok(guard.escrows.get(engagement_id).cloned())
    }

    async fn fund_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        milestones: Vec<MilestoneRecord>,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord> {
        for (expected_ordinal, milestone) in milestones.iter().enumerate() {
            if milestone.ordinal != expected_ordinal as u32 {
                return Err(StorageError::InvariantViolation(format!(
                    "milestone ordinals must be contiguous from zero, found {} at position {}",
                    milestone.ordinal, expected_ordinal
                )));
            }
        }

        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        if guard.milestones.contains_key(engagement_id) {
            return Err(StorageError::Conflict(format!(
                "milestones for engagement {} already exist",
                engagement_id
            )));
        }
        let record = guard.escrows.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("escrow for engagement {} not found", engagement_id))
        })?;
        if record.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid escrow transition: expected {}, found {}",
                expected_from, record.status
            )));
        }
        record.status = EscrowStatus::Funded;
        record.updated_at = at;
        let updated = record.clone();
        guard.milestones.insert(engagement_id.clone(), milestones);
        Ok(updated)
    }

    async fn transition_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord> {
        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        let record = guard.escrows.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("escrow for engagement {} not found", engagement_id))
        })?;
        if record.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid escrow transition: expected {}, found {}",
                expected_from, record.status
            )));
        }
        record.status = to;
        record.updated_at = at;
        Ok(record.clone())
    }

    async fn release_milestone(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome> {
        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        let tables = &mut *guard;

        let escrow = tables.escrows.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("escrow for engagement {} not found", engagement_id))
        })?;
        if escrow.status != EscrowStatus::Funded {
            return Err(StorageError::InvariantViolation(format!(
                "release requires funded escrow, found {}",
                escrow.status
            )));
        }

        let milestones = tables.milestones.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!(
                "milestones for engagement {} not found",
                engagement_id
            ))
        })?;
        let position = milestones
            .iter()
            .position(|m| &m.milestone_id == milestone_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("milestone {} not found", milestone_id))
            })?;
        if milestones[position].status == MilestoneStatus::Completed {
            return Err(StorageError::Conflict(format!(
                "milestone {} already completed",
                milestone_id
            )));
        }
        let blocked = milestones[..position]
            .iter()
            .any(|m| m.status != MilestoneStatus::Completed);
        if blocked {
            return Err(StorageError::InvariantViolation(format!(
                "milestone {} released out of sequence",
                milestone_id
            )));
        }

        let amount = milestones[position].amount_minor;
        if escrow.released_minor + amount > escrow.committed_minor {
            return Err(StorageError::InvariantViolation(format!(
                "release of {} exceeds remaining {}",
                amount,
                escrow.committed_minor - escrow.released_minor
            )));
        }

        milestones[position].status = MilestoneStatus::Completed;
        milestones[position].completed_at = Some(at);
        escrow.released_minor += amount;
        if escrow.released_minor == escrow.committed_minor {
            escrow.status = EscrowStatus::Completed;
        }
        escrow.updated_at = at;

        Ok(ReleaseOutcome {
            escrow: escrow.clone(),
            milestone: Some(milestones[position].clone()),
        })
    }

    async fn release_amount(
        &self,
        engagement_id: &EngagementId,
        amount_minor: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome> {
        if amount_minor <= 0 {
            return Err(StorageError::InvalidInput(
                "release amount must be positive".to_string(),
            ));
        }
        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        let escrow = guard.escrows.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("escrow for engagement {} not found", engagement_id))
        })?;
        if escrow.status != EscrowStatus::Funded {
            return Err(StorageError::InvariantViolation(format!(
                "release requires funded escrow, found {}",
                escrow.status
            )));
        }
        if escrow.released_minor + amount_minor > escrow.committed_minor {
            return Err(StorageError::InvariantViolation(format!(
                "release of {} exceeds remaining {}",
                amount_minor,
                escrow.committed_minor - escrow.released_minor
            )));
        }
        escrow.released_minor += amount_minor;
        if escrow.released_minor == escrow.committed_minor {
            escrow.status = EscrowStatus::Completed;
        }
        escrow.updated_at = at;
        Ok(ReleaseOutcome {
            escrow: escrow.clone(),
            milestone: None,
        })
    }

    async fn set_milestone_status(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        expected_from: MilestoneStatus,
        to: MilestoneStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<MilestoneRecord> {
        let mut guard = self.escrow.write().map_err(|_| poisoned("escrow"))?;
        let milestones = guard.milestones.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!(
                "milestones for engagement {} not found",
                engagement_id
            ))
        })?;
        let milestone = milestones
            .iter_mut()
            .find(|m| &m.milestone_id == milestone_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("milestone {} not found", milestone_id))
            })?;
        if milestone.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid milestone transition: expected {}, found {}",
                expected_from, milestone.status
            )));
        }
        milestone.status = to;
        if to == MilestoneStatus::Completed {
            milestone.completed_at = Some(at);
        }
        Ok(milestone.clone())
    }

    async fn list_milestones(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Vec<MilestoneRecord>> {
        let guard = self.escrow.read().map_err(|_| poisoned("escrow"))?;
        let mut values = guard
            .milestones
            .get(engagement_id)
            .cloned()
            .unwrap_or_default();
        values.sort_by_key(|m| m.ordinal);
        Ok(values)
    }
}

#[async_trait]
impl EngagementStateStore for InMemoryAtelierStorage {
    async fn init_state(
        &self,
        engagement_id: &EngagementId,
        phase: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut guard = self.states.write().map_err(|_| poisoned("states"))?;
        if guard.contains_key(engagement_id) {
            return Err(StorageError::Conflict(format!(
                "state for engagement {} already exists",
                engagement_id
            )));
        }
        let record = EngagementStateRecord {
            engagement_id: engagement_id.clone(),
            phase,
            busy_action: None,
            last_completed_action: None,
            last_completed_at: None,
            last_result: None,
            metadata: Value::Null,
            updated_at: at,
        };
        guard.insert(engagement_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_state(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Option<EngagementStateRecord>> {
        let guard = self.states.read().map_err(|_| poisoned("states"))?;
        Ok(guard.get(engagement_id).cloned())
    }

    async fn begin_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ActionClaim> {
        let mut guard = self.states.write().map_err(|_| poisoned("states"))?;
        let record = guard.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
        })?;
        if let Some(held) = &record.busy_action {
            return Ok(ActionClaim::Held {
                action: held.clone(),
            });
        }
        record.busy_action = Some(action.to_string());
        record.updated_at = at;
        Ok(ActionClaim::Claimed(record.clone()))
    }

    async fn finish_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut guard = self.states.write().map_err(|_| poisoned("states"))?;
        let record = guard.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
        })?;
        if record.busy_action.as_deref() != Some(action) {
            return Err(StorageError::InvariantViolation(format!(
                "finish for action {} but flag holds {:?}",
                action, record.busy_action
            )));
        }
        record.busy_action = None;
        if let ActionOutcome::Completed { result, next_phase } = outcome {
            record.last_completed_action = Some(action.to_string());
            record.last_completed_at = Some(at);
            record.last_result = Some(result);
            if let Some(phase) = next_phase {
                record.phase = phase;
            }
        }
        record.updated_at = at;
        Ok(record.clone())
    }

    async fn transition_phase(
        &self,
        engagement_id: &EngagementId,
        expected_from: WorkflowPhase,
        to: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut guard = self.states.write().map_err(|_| poisoned("states"))?;
        let record = guard.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
        })?;
        if record.phase != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid phase transition: expected {}, found {}",
                expected_from, record.phase
            )));
        }
        record.phase = to;
        record.updated_at = at;
        Ok(record.clone())
    }

    async fn put_metadata(
        &self,
        engagement_id: &EngagementId,
        key: &str,
        value: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut guard = self.states.write().map_err(|_| poisoned("states"))?;
        let record = guard.get_mut(engagement_id).ok_or_else(|| {
            StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
        })?;
        if !record.metadata.is_object() {
            record.metadata = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = record.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        record.updated_at = at;
        Ok(record.clone())
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::TransactionKind;

    fn acct(id: &str) -> AccountId {
        AccountId::new(id)
    }

    #[tokio::test]
    async fn apply_entry_enforces_balance_floor() {
        let storage = InMemoryAtelierStorage::new();
        let account = acct("a");
        storage.create_account(&account, Utc::now()).await.unwrap();

        let result = storage
            .apply_entry(
                EntryAppend::new(account.clone(), TransactionKind::Usage, -5),
                Utc::now(),
            )
            .await;
        assert!(matches!(
            result,
            Err(StorageError::InsufficientFunds {
                required_minor: 5,
                available_minor: 0
            })
        ));

        // The failed debit must leave no journal entry behind.
        let journal = storage
            .list_transactions(&account, QueryWindow::default())
            .await
            .unwrap();
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn apply_entry_replays_by_external_reference() {
        let storage = InMemoryAtelierStorage::new();
        let account = acct("a");
        storage.create_account(&account, Utc::now()).await.unwrap();

        let reference = ExternalReference::new("pay_1");
        let first = storage
            .apply_entry(
                EntryAppend::new(account.clone(), TransactionKind::Purchase, 10)
                    .with_external_reference(reference.clone()),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.account.balance_minor, 10);

        let second = storage
            .apply_entry(
                EntryAppend::new(account.clone(), TransactionKind::Purchase, 10)
                    .with_external_reference(reference),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.account.balance_minor, 10);
        assert_eq!(
            second.transaction.transaction_id,
            first.transaction.transaction_id
        );

        let journal = storage
            .list_transactions(&account, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn journal_entries_are_hash_linked() {
        let storage = InMemoryAtelierStorage::new();
        let account = acct("a");
        storage.create_account(&account, Utc::now()).await.unwrap();

        storage
            .apply_entry(
                EntryAppend::new(account.clone(), TransactionKind::Bonus, 3),
                Utc::now(),
            )
            .await
            .unwrap();
        storage
            .apply_entry(
                EntryAppend::new(account.clone(), TransactionKind::Usage, -1),
                Utc::now(),
            )
            .await
            .unwrap();

        let journal = storage
            .list_transactions(&account, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].previous_hash, None);
        assert_eq!(
            journal[1].previous_hash.as_deref(),
            Some(journal[0].entry_hash.as_str())
        );
    }

    #[tokio::test]
    async fn release_rejects_out_of_sequence_milestone() {
        let storage = InMemoryAtelierStorage::new();
        let engagement = EngagementId::new("eng-1");
        let now = Utc::now();
        storage
            .create_escrow(EscrowRecord {
                engagement_id: engagement.clone(),
                initiator_id: acct("buyer"),
                committed_minor: 100,
                released_minor: 0,
                status: EscrowStatus::Pending,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let milestones = vec![
            milestone(&engagement, 0, 50, 50),
            milestone(&engagement, 1, 50, 50),
        ];
        let second_id = milestones[1].milestone_id.clone();
        storage
            .fund_escrow(&engagement, EscrowStatus::Pending, milestones, now)
            .await
            .unwrap();

        let result = storage.release_milestone(&engagement, &second_id, now).await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn begin_action_is_exclusive_until_finished() {
        let storage = InMemoryAtelierStorage::new();
        let engagement = EngagementId::new("eng-1");
        storage
            .init_state(&engagement, WorkflowPhase::GatheringInfo, Utc::now())
            .await
            .unwrap();

        let first = storage
            .begin_action(&engagement, "generate_variations", Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, ActionClaim::Claimed(_)));

        let second = storage
            .begin_action(&engagement, "generate_variations", Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, ActionClaim::Held { .. }));

        storage
            .finish_action(
                &engagement,
                "generate_variations",
                ActionOutcome::Completed {
                    result: serde_json::json!({"variations": 3}),
                    next_phase: Some(WorkflowPhase::PreviewingDesign),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let state = storage.get_state(&engagement).await.unwrap().unwrap();
        assert_eq!(state.phase, WorkflowPhase::PreviewingDesign);
        assert!(state.busy_action.is_none());
        assert!(state.last_completed_at.is_some());
    }

    fn milestone(
        engagement_id: &EngagementId,
        ordinal: u32,
        weight_pct: u32,
        amount_minor: i64,
    ) -> MilestoneRecord {
        MilestoneRecord {
            milestone_id: MilestoneId::generate(),
            engagement_id: engagement_id.clone(),
            ordinal,
            label: format!("step-{ordinal}"),
            weight_pct,
            amount_minor,
            status: MilestoneStatus::Pending,
            completed_at: None,
        }
    }
}
