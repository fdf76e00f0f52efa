use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a ledger transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits bought through the payment provider.
    Purchase,
    /// Credits spent on a generation or other metered action.
    Usage,
    Refund,
    Bonus,
    AdminAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Usage => "usage",
            TransactionKind::Refund => "refund",
            TransactionKind::Bonus => "bonus",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "purchase" => Some(TransactionKind::Purchase),
            "usage" => Some(TransactionKind::Usage),
            "refund" => Some(TransactionKind::Refund),
            "bonus" => Some(TransactionKind::Bonus),
            "admin_adjustment" => Some(TransactionKind::AdminAdjustment),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an engagement's escrowed funds.
///
/// Transitions are forward-only, except `Disputed`, which is reachable
/// from `Funded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Completed,
    Disputed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Completed => "completed",
            EscrowStatus::Disputed => "disputed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EscrowStatus::Pending),
            "funded" => Some(EscrowStatus::Funded),
            "completed" => Some(EscrowStatus::Completed),
            "disputed" => Some(EscrowStatus::Disputed),
            _ => None,
        }
    }

    /// Terminal states admit no further funding or release.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Completed | EscrowStatus::Disputed)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    /// Work reported done; release awaits the counterparty's confirmation.
    Unlocked,
    Completed,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Unlocked => "unlocked",
            MilestoneStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MilestoneStatus::Pending),
            "unlocked" => Some(MilestoneStatus::Unlocked),
            "completed" => Some(MilestoneStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
