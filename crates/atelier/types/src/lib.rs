//! Shared value types for the atelier commerce core.
//!
//! This crate holds the identifiers, kinds, and workflow phases used by the
//! ledger, escrow, and gate crates. It does no I/O and carries no behavior
//! beyond construction, display, and serde.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod ids;
mod kinds;
mod phase;

pub use ids::{AccountId, EngagementId, ExternalReference, MilestoneId, TransactionId};
pub use kinds::{EscrowStatus, MilestoneStatus, TransactionKind};
pub use phase::{EngagementAction, WorkflowPhase};
