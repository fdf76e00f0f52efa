use crate::model::{
    AccountRecord, ActionClaim, ActionOutcome, AppliedEntry, EngagementStateRecord, EntryAppend,
    EscrowRecord, MilestoneRecord, ReleaseOutcome, TransactionRecord,
};
use crate::StorageResult;
use atelier_types::{
    AccountId, EngagementId, EscrowStatus, ExternalReference, MilestoneId, MilestoneStatus,
    WorkflowPhase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Generic query window for paged reads. `limit == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Storage interface for credit accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create an account with a zero balance. Conflict if it exists.
    async fn create_account(
        &self,
        account_id: &AccountId,
        at: DateTime<Utc>,
    ) -> StorageResult<AccountRecord>;

    async fn get_account(&self, account_id: &AccountId) -> StorageResult<Option<AccountRecord>>;
}

/// Storage interface for the balance-and-journal unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply one signed delta: lock the account row, enforce the
    /// non-negative balance floor, deduplicate by external reference, and
    /// write the account and the journal entry in one atomic unit.
    ///
    /// A matching external reference short-circuits into a replay: the
    /// recorded entry comes back with `replayed == true` and nothing is
    /// written. The dedup check runs inside the same atomic scope as the
    /// mutation.
    async fn apply_entry(
        &self,
        append: EntryAppend,
        at: DateTime<Utc>,
    ) -> StorageResult<AppliedEntry>;

    async fn find_by_external_reference(
        &self,
        reference: &ExternalReference,
    ) -> StorageResult<Option<TransactionRecord>>;

    /// Journal entries for one account, oldest first.
    async fn list_transactions(
        &self,
        account_id: &AccountId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>>;
}

/// Storage interface for escrow and milestone rows.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a new escrow. Conflict if one exists for the engagement.
    async fn create_escrow(&self, escrow: EscrowRecord) -> StorageResult<()>;

    async fn get_escrow(&self, engagement_id: &EngagementId)
        -> StorageResult<Option<EscrowRecord>>;

    /// Transition `expected_from -> Funded` and insert the milestone set,
    /// atomically. Ordinals must be contiguous from zero.
    async fn fund_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        milestones: Vec<MilestoneRecord>,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord>;

    /// Plain status compare-and-set (used for dispute).
    async fn transition_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord>;

    /// Release the milestone's fixed amount: requires `Funded` status and
    /// every lower ordinal already completed; marks the milestone
    /// completed, increases the released amount, and completes the escrow
    /// when fully released. One atomic unit under the escrow row lock.
    async fn release_milestone(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome>;

    /// Freeform release of part of the remaining amount, not bound to a
    /// milestone. Same status and bounds discipline as milestone release.
    async fn release_amount(
        &self,
        engagement_id: &EngagementId,
        amount_minor: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome>;

    /// Milestone status compare-and-set (used for unlock).
    async fn set_milestone_status(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        expected_from: MilestoneStatus,
        to: MilestoneStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<MilestoneRecord>;

    /// Milestones for one engagement in ordinal order.
    async fn list_milestones(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Vec<MilestoneRecord>>;
}

/// Storage interface for per-engagement workflow state.
#[async_trait]
pub trait EngagementStateStore: Send + Sync {
    /// Create the state record for a new engagement. Conflict if present.
    async fn init_state(
        &self,
        engagement_id: &EngagementId,
        phase: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord>;

    async fn get_state(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Option<EngagementStateRecord>>;

    /// Claim the in-progress flag for `action` if it is free. Atomic
    /// compare-and-set; never blocks.
    async fn begin_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ActionClaim>;

    /// Clear the flag and, on success, stamp completion, store the result,
    /// and advance the phase, in one atomic update.
    async fn finish_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord>;

    /// Phase compare-and-set for plain (unguarded) edges.
    async fn transition_phase(
        &self,
        engagement_id: &EngagementId,
        expected_from: WorkflowPhase,
        to: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord>;

    /// Merge one key into the engagement's free-form metadata object.
    async fn put_metadata(
        &self,
        engagement_id: &EngagementId,
        key: &str,
        value: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord>;
}

/// Unified storage bundle consumed by the atelier engines.
pub trait AtelierStorage:
    AccountStore + LedgerStore + EscrowStore + EngagementStateStore + Send + Sync
{
}

impl<T> AtelierStorage for T where
    T: AccountStore + LedgerStore + EscrowStore + EngagementStateStore + Send + Sync
{
}
