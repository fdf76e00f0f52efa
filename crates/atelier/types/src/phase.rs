//! Workflow phases and guarded actions.
//!
//! The phase enum is the persisted value; edge legality lives in the gate
//! crate's transition table so the two stay separately testable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of one engagement's workflow, from first contact to delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Welcome,
    GatheringInfo,
    PreviewingDesign,
    DesignApproved,
    JobInfoGathering,
    AwaitingPayment,
    Listed,
    ProposalReceived,
    EscrowFunded,
    InProduction,
    SampleReview,
    FinalReview,
    Delivery,
    Completed,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Welcome => "welcome",
            WorkflowPhase::GatheringInfo => "gathering_info",
            WorkflowPhase::PreviewingDesign => "previewing_design",
            WorkflowPhase::DesignApproved => "design_approved",
            WorkflowPhase::JobInfoGathering => "job_info_gathering",
            WorkflowPhase::AwaitingPayment => "awaiting_payment",
            WorkflowPhase::Listed => "listed",
            WorkflowPhase::ProposalReceived => "proposal_received",
            WorkflowPhase::EscrowFunded => "escrow_funded",
            WorkflowPhase::InProduction => "in_production",
            WorkflowPhase::SampleReview => "sample_review",
            WorkflowPhase::FinalReview => "final_review",
            WorkflowPhase::Delivery => "delivery",
            WorkflowPhase::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "welcome" => Some(WorkflowPhase::Welcome),
            "gathering_info" => Some(WorkflowPhase::GatheringInfo),
            "previewing_design" => Some(WorkflowPhase::PreviewingDesign),
            "design_approved" => Some(WorkflowPhase::DesignApproved),
            "job_info_gathering" => Some(WorkflowPhase::JobInfoGathering),
            "awaiting_payment" => Some(WorkflowPhase::AwaitingPayment),
            "listed" => Some(WorkflowPhase::Listed),
            "proposal_received" => Some(WorkflowPhase::ProposalReceived),
            "escrow_funded" => Some(WorkflowPhase::EscrowFunded),
            "in_production" => Some(WorkflowPhase::InProduction),
            "sample_review" => Some(WorkflowPhase::SampleReview),
            "final_review" => Some(WorkflowPhase::FinalReview),
            "delivery" => Some(WorkflowPhase::Delivery),
            "completed" => Some(WorkflowPhase::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-effecting actions serialized by the workflow gate.
///
/// Each action is legal only from a whitelisted set of source phases; the
/// whitelist and the post-success phase live in the gate crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementAction {
    /// Generate the design variations for preview.
    GenerateVariations,
    /// Initialize a charge with the payment provider.
    RequestPayment,
    /// Report milestone work done, pending release confirmation.
    UnlockMilestone,
}

impl EngagementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementAction::GenerateVariations => "generate_variations",
            EngagementAction::RequestPayment => "request_payment",
            EngagementAction::UnlockMilestone => "unlock_milestone",
        }
    }
}

impl fmt::Display for EngagementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_strings_round_trip() {
        let phases = [
            WorkflowPhase::Welcome,
            WorkflowPhase::GatheringInfo,
            WorkflowPhase::PreviewingDesign,
            WorkflowPhase::DesignApproved,
            WorkflowPhase::JobInfoGathering,
            WorkflowPhase::AwaitingPayment,
            WorkflowPhase::Listed,
            WorkflowPhase::ProposalReceived,
            WorkflowPhase::EscrowFunded,
            WorkflowPhase::InProduction,
            WorkflowPhase::SampleReview,
            WorkflowPhase::FinalReview,
            WorkflowPhase::Delivery,
            WorkflowPhase::Completed,
        ];
        for phase in phases {
            assert_eq!(WorkflowPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(WorkflowPhase::parse("minting"), None);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&WorkflowPhase::AwaitingPayment).unwrap();
        assert_eq!(json, "\"awaiting_payment\"");
    }
}
