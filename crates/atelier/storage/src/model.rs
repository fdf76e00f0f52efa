use atelier_types::{
    AccountId, EngagementId, EscrowStatus, ExternalReference, MilestoneId, MilestoneStatus,
    TransactionId, TransactionKind, WorkflowPhase,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent credit account.
///
/// The balance is only ever written together with a transaction append;
/// see [`crate::LedgerStore::apply_entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: AccountId,
    pub balance_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable journal entry for one balance change.
///
/// `entry_hash` links each entry to its per-account predecessor so replay
/// can detect out-of-band mutation of the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub amount_minor: i64,
    pub balance_before_minor: i64,
    pub balance_after_minor: i64,
    pub external_reference: Option<ExternalReference>,
    pub correlation_id: Option<EngagementId>,
    pub metadata: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Request to apply one signed balance delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryAppend {
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub amount_minor: i64,
    pub external_reference: Option<ExternalReference>,
    pub correlation_id: Option<EngagementId>,
    #[serde(default)]
    pub metadata: Value,
}

impl EntryAppend {
    pub fn new(account_id: AccountId, kind: TransactionKind, amount_minor: i64) -> Self {
        Self {
            account_id,
            kind,
            amount_minor,
            external_reference: None,
            correlation_id: None,
            metadata: Value::Null,
        }
    }

    pub fn with_external_reference(mut self, reference: ExternalReference) -> Self {
        self.external_reference = Some(reference);
        self
    }

    pub fn with_correlation(mut self, engagement_id: EngagementId) -> Self {
        self.correlation_id = Some(engagement_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of [`crate::LedgerStore::apply_entry`].
///
/// `replayed` marks an idempotent no-op: the returned transaction is the
/// previously recorded one and the balance was not touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedEntry {
    pub transaction: TransactionRecord,
    pub account: AccountRecord,
    pub replayed: bool,
}

/// Persistent escrow record for one engagement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub engagement_id: EngagementId,
    pub initiator_id: AccountId,
    pub committed_minor: i64,
    pub released_minor: i64,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowRecord {
    pub fn remaining_minor(&self) -> i64 {
        self.committed_minor - self.released_minor
    }
}

/// Persistent milestone row. The amount is fixed at funding time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneRecord {
    pub milestone_id: MilestoneId,
    pub engagement_id: EngagementId,
    pub ordinal: u32,
    pub label: String,
    pub weight_pct: u32,
    pub amount_minor: i64,
    pub status: MilestoneStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a release: the updated escrow, and the milestone row when the
/// release was milestone-bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub escrow: EscrowRecord,
    pub milestone: Option<MilestoneRecord>,
}

/// Persistent per-engagement workflow state.
///
/// `busy_action` is the coarse-grained in-progress flag; `last_*` fields
/// feed the gate's cool-down replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementStateRecord {
    pub engagement_id: EngagementId,
    pub phase: WorkflowPhase,
    pub busy_action: Option<String>,
    pub last_completed_action: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_result: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

/// Result of attempting to claim the in-progress flag.
#[derive(Debug, Clone)]
pub enum ActionClaim {
    /// The flag was free and is now held by the caller.
    Claimed(EngagementStateRecord),
    /// Another action already holds the flag.
    Held { action: String },
}

/// How a guarded action finished.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// The action succeeded: stamp completion, store the result, and
    /// optionally advance the phase, all in the same update as the flag
    /// clear.
    Completed {
        result: Value,
        next_phase: Option<WorkflowPhase>,
    },
    /// The action failed: clear the flag, change nothing else.
    Failed,
}

/// Content hash of one journal entry, chained to its predecessor.
pub fn compute_entry_hash(
    account_id: &AccountId,
    kind: TransactionKind,
    amount_minor: i64,
    balance_before_minor: i64,
    balance_after_minor: i64,
    external_reference: Option<&ExternalReference>,
    created_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "account_id": account_id,
        "kind": kind,
        "amount_minor": amount_minor,
        "balance_before_minor": balance_before_minor,
        "balance_after_minor": balance_after_minor,
        "external_reference": external_reference,
        "created_at": created_at,
        "previous_hash": previous_hash,
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
