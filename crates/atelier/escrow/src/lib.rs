//! Milestone escrow engine.
//!
//! One escrow per engagement tracks the committed amount, the amount
//! already released, and a forward-only status. Releases happen in strict
//! ordinal order through a data-driven milestone plan; the storage layer
//! performs each release atomically under the escrow row lock, so two
//! concurrent confirmations of the same milestone cannot double-release.

#![deny(unsafe_code)]

use atelier_notify::{dispatch, NotificationKind, Notifier};
use atelier_storage::{
    AtelierStorage, EscrowRecord, MilestoneRecord, ReleaseOutcome, StorageError,
};
use atelier_types::{AccountId, EngagementId, EscrowStatus, MilestoneId, MilestoneStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// One weighted release step of a plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MilestoneStep {
    pub label: String,
    pub weight_pct: u32,
}

impl MilestoneStep {
    pub fn new(label: impl Into<String>, weight_pct: u32) -> Self {
        Self {
            label: label.into(),
            weight_pct,
        }
    }
}

/// Ordered percentage-weighted release steps, validated to sum to 100.
///
/// The step count is data, not code: the sequencing invariant holds for any
/// plan, not just the reference four-step one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MilestonePlan {
    steps: Vec<MilestoneStep>,
}

impl MilestonePlan {
    pub fn new(steps: Vec<MilestoneStep>) -> Result<Self, EscrowError> {
        if steps.is_empty() {
            return Err(EscrowError::InvalidPlan(
                "plan must have at least one step".to_string(),
            ));
        }
        if steps.iter().any(|step| step.weight_pct == 0) {
            return Err(EscrowError::InvalidPlan(
                "every step must carry a positive weight".to_string(),
            ));
        }
        let total: u32 = steps.iter().map(|step| step.weight_pct).sum();
        if total != 100 {
            return Err(EscrowError::InvalidPlan(format!(
                "step weights must sum to 100, got {total}"
            )));
        }
        Ok(Self { steps })
    }

    /// The reference production plan for fabrication engagements.
    pub fn garment_production() -> Self {
        Self {
            steps: vec![
                MilestoneStep::new("fabric-received", 15),
                MilestoneStep::new("sample-approved", 15),
                MilestoneStep::new("final-approved", 40),
                MilestoneStep::new("delivery-confirmed", 30),
            ],
        }
    }

    pub fn steps(&self) -> &[MilestoneStep] {
        &self.steps
    }

    /// Milestone rows for a committed amount. Integer division rounds each
    /// step down; the final step absorbs the remainder so the amounts sum
    /// exactly to the commitment.
    fn build_records(
        &self,
        engagement_id: &EngagementId,
        committed_minor: i64,
    ) -> Vec<MilestoneRecord> {
        let mut records = Vec::with_capacity(self.steps.len());
        let mut allocated = 0_i64;
        for (ordinal, step) in self.steps.iter().enumerate() {
            let amount = if ordinal == self.steps.len() - 1 {
                committed_minor - allocated
            } else {
                committed_minor * i64::from(step.weight_pct) / 100
            };
            allocated += amount;
            records.push(MilestoneRecord {
                milestone_id: MilestoneId::generate(),
                engagement_id: engagement_id.clone(),
                ordinal: ordinal as u32,
                label: step.label.clone(),
                weight_pct: step.weight_pct,
                amount_minor: amount,
                status: MilestoneStatus::Pending,
                completed_at: None,
            });
        }
        records
    }
}

impl Default for MilestonePlan {
    fn default() -> Self {
        Self::garment_production()
    }
}

/// Escrow errors. Rejections mutate nothing and carry the authoritative
/// state (current status, remaining amount, next ordinal) for the caller.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("escrow not found for engagement {0}")]
    NotFound(String),

    #[error("invalid escrow amount: {0}")]
    InvalidAmount(i64),

    #[error("invalid milestone plan: {0}")]
    InvalidPlan(String),

    #[error("account {caller} is not the initiator of engagement {engagement_id}")]
    NotInitiator {
        engagement_id: String,
        caller: String,
    },

    #[error("escrow is {status}, operation not allowed")]
    EscrowStateConflict { status: EscrowStatus },

    #[error("milestone {milestone_id} is out of sequence, next releasable ordinal is {next_ordinal}")]
    OutOfSequenceRelease {
        milestone_id: String,
        next_ordinal: u32,
    },

    #[error("release of {requested_minor} exceeds remaining {remaining_minor}")]
    OverRelease {
        requested_minor: i64,
        remaining_minor: i64,
    },

    #[error("milestone not found: {0}")]
    MilestoneNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("busy, retry: {0}")]
    Busy(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for EscrowError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Busy(msg) => Self::Busy(msg),
            // Race-time rejections from the atomic backstop; the precise
            // variants are raised by the engine's own pre-checks.
            StorageError::Conflict(msg) | StorageError::InvariantViolation(msg) => {
                Self::Conflict(msg)
            }
            StorageError::InsufficientFunds {
                required_minor,
                available_minor,
            } => Self::OverRelease {
                requested_minor: required_minor,
                remaining_minor: available_minor,
            },
            StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}

/// The escrow engine facade.
pub struct EscrowEngine {
    storage: Arc<dyn AtelierStorage>,
    notifier: Arc<dyn Notifier>,
    plan: MilestonePlan,
}

impl EscrowEngine {
    pub fn new(storage: Arc<dyn AtelierStorage>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_plan(storage, notifier, MilestonePlan::default())
    }

    pub fn with_plan(
        storage: Arc<dyn AtelierStorage>,
        notifier: Arc<dyn Notifier>,
        plan: MilestonePlan,
    ) -> Self {
        Self {
            storage,
            notifier,
            plan,
        }
    }

    /// Create a pending escrow. Only the engagement's initiator may call,
    /// and the engagement must not already carry one.
    pub async fn create_escrow(
        &self,
        engagement_id: &EngagementId,
        committed_minor: i64,
        initiator_id: &AccountId,
    ) -> Result<EscrowRecord, EscrowError> {
        if committed_minor <= 0 {
            return Err(EscrowError::InvalidAmount(committed_minor));
        }

        let now = Utc::now();
        let record = EscrowRecord {
            engagement_id: engagement_id.clone(),
            initiator_id: initiator_id.clone(),
            committed_minor,
            released_minor: 0,
            status: EscrowStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        match self.storage.create_escrow(record.clone()).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                let existing = self.require_escrow(engagement_id).await?;
                return Err(EscrowError::EscrowStateConflict {
                    status: existing.status,
                });
            }
            Err(other) => return Err(other.into()),
        }

        tracing::info!(
            engagement_id = %engagement_id,
            committed = committed_minor,
            "escrow created"
        );
        Ok(record)
    }

    /// Mark the committed amount as funded and lay down the milestone set.
    pub async fn fund_escrow(
        &self,
        engagement_id: &EngagementId,
        funder_id: &AccountId,
    ) -> Result<(EscrowRecord, Vec<MilestoneRecord>), EscrowError> {
        let escrow = self.require_escrow(engagement_id).await?;
        if &escrow.initiator_id != funder_id {
            return Err(EscrowError::NotInitiator {
                engagement_id: engagement_id.0.clone(),
                caller: funder_id.0.clone(),
            });
        }
        if escrow.status != EscrowStatus::Pending {
            return Err(EscrowError::EscrowStateConflict {
                status: escrow.status,
            });
        }

        let milestones = self.plan.build_records(engagement_id, escrow.committed_minor);
        let funded = self
            .storage
            .fund_escrow(
                engagement_id,
                EscrowStatus::Pending,
                milestones.clone(),
                Utc::now(),
            )
            .await?;

        tracing::info!(
            engagement_id = %engagement_id,
            committed = funded.committed_minor,
            milestones = milestones.len(),
            "escrow funded"
        );
        dispatch(
            self.notifier.as_ref(),
            funder_id,
            NotificationKind::EscrowFunded,
            serde_json::json!({
                "engagement_id": engagement_id,
                "committed_minor": funded.committed_minor,
            }),
        )
        .await;

        Ok((funded, milestones))
    }

    /// Release the next milestone's share of the committed amount.
    pub async fn release_milestone(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let escrow = self.require_escrow(engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::EscrowStateConflict {
                status: escrow.status,
            });
        }

        self.check_next_in_sequence(engagement_id, milestone_id).await?;
        let outcome = self
            .storage
            .release_milestone(engagement_id, milestone_id, Utc::now())
            .await?;

        tracing::info!(
            engagement_id = %engagement_id,
            milestone_id = %milestone_id,
            released = outcome.escrow.released_minor,
            committed = outcome.escrow.committed_minor,
            "milestone released"
        );
        self.notify_release(&outcome).await;
        Ok(outcome)
    }

    /// Mark the next milestone's work as done, pending release.
    pub async fn unlock_milestone(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
    ) -> Result<MilestoneRecord, EscrowError> {
        let escrow = self.require_escrow(engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::EscrowStateConflict {
                status: escrow.status,
            });
        }

        self.check_next_in_sequence(engagement_id, milestone_id).await?;
        let milestone = self
            .storage
            .set_milestone_status(
                engagement_id,
                milestone_id,
                MilestoneStatus::Pending,
                MilestoneStatus::Unlocked,
                Utc::now(),
            )
            .await?;

        tracing::info!(
            engagement_id = %engagement_id,
            milestone_id = %milestone_id,
            "milestone unlocked"
        );
        Ok(milestone)
    }

    /// Freeform release of part of the remaining amount.
    pub async fn release_partial(
        &self,
        engagement_id: &EngagementId,
        amount_minor: i64,
    ) -> Result<ReleaseOutcome, EscrowError> {
        if amount_minor <= 0 {
            return Err(EscrowError::InvalidAmount(amount_minor));
        }
        let escrow = self.require_escrow(engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::EscrowStateConflict {
                status: escrow.status,
            });
        }
        if amount_minor > escrow.remaining_minor() {
            return Err(EscrowError::OverRelease {
                requested_minor: amount_minor,
                remaining_minor: escrow.remaining_minor(),
            });
        }

        let outcome = self
            .storage
            .release_amount(engagement_id, amount_minor, Utc::now())
            .await?;

        tracing::info!(
            engagement_id = %engagement_id,
            amount = amount_minor,
            released = outcome.escrow.released_minor,
            "partial release applied"
        );
        self.notify_release(&outcome).await;
        Ok(outcome)
    }

    /// Freeze a funded escrow for dispute resolution.
    pub async fn open_dispute(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<EscrowRecord, EscrowError> {
        let escrow = self.require_escrow(engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::EscrowStateConflict {
                status: escrow.status,
            });
        }

        let disputed = self
            .storage
            .transition_escrow(
                engagement_id,
                EscrowStatus::Funded,
                EscrowStatus::Disputed,
                Utc::now(),
            )
            .await?;

        tracing::warn!(engagement_id = %engagement_id, "escrow disputed");
        dispatch(
            self.notifier.as_ref(),
            &disputed.initiator_id,
            NotificationKind::EscrowDisputed,
            serde_json::json!({ "engagement_id": engagement_id }),
        )
        .await;
        Ok(disputed)
    }

    /// Escrow state, straight from stored fields.
    pub async fn escrow(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<Option<EscrowRecord>, EscrowError> {
        Ok(self.storage.get_escrow(engagement_id).await?)
    }

    /// Milestones in ordinal order.
    pub async fn milestones(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<Vec<MilestoneRecord>, EscrowError> {
        Ok(self.storage.list_milestones(engagement_id).await?)
    }

    async fn require_escrow(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<EscrowRecord, EscrowError> {
        self.storage
            .get_escrow(engagement_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(engagement_id.0.clone()))
    }

    /// The target must be the lowest ordinal not yet completed. This is the
    /// engine's precise pre-check; the storage release re-verifies it inside
    /// the atomic unit.
    async fn check_next_in_sequence(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
    ) -> Result<(), EscrowError> {
        let milestones = self.storage.list_milestones(engagement_id).await?;
        let target = milestones
            .iter()
            .find(|m| &m.milestone_id == milestone_id)
            .ok_or_else(|| EscrowError::MilestoneNotFound(milestone_id.0.clone()))?;
        let next_ordinal = milestones
            .iter()
            .find(|m| m.status != MilestoneStatus::Completed)
            .map(|m| m.ordinal)
            .unwrap_or(target.ordinal);
        if target.ordinal != next_ordinal || target.status == MilestoneStatus::Completed {
            return Err(EscrowError::OutOfSequenceRelease {
                milestone_id: milestone_id.0.clone(),
                next_ordinal,
            });
        }
        Ok(())
    }

    async fn notify_release(&self, outcome: &ReleaseOutcome) {
        let escrow = &outcome.escrow;
        if let Some(milestone) = &outcome.milestone {
            dispatch(
                self.notifier.as_ref(),
                &escrow.initiator_id,
                NotificationKind::MilestoneReleased,
                serde_json::json!({
                    "engagement_id": escrow.engagement_id,
                    "milestone": milestone.label,
                    "amount_minor": milestone.amount_minor,
                }),
            )
            .await;
        }
        if escrow.status == EscrowStatus::Completed {
            dispatch(
                self.notifier.as_ref(),
                &escrow.initiator_id,
                NotificationKind::EscrowCompleted,
                serde_json::json!({
                    "engagement_id": escrow.engagement_id,
                    "released_minor": escrow.released_minor,
                }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_notify::RecordingNotifier;
    use atelier_storage::memory::InMemoryAtelierStorage;
    use proptest::prelude::*;

    fn setup() -> (Arc<RecordingNotifier>, EscrowEngine) {
        let storage = Arc::new(InMemoryAtelierStorage::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = EscrowEngine::new(storage, notifier.clone());
        (notifier, engine)
    }

    fn buyer() -> AccountId {
        AccountId::new("buyer-1")
    }

    async fn funded_engagement(engine: &EscrowEngine, committed: i64) -> (EngagementId, Vec<MilestoneRecord>) {
        let engagement = EngagementId::generate();
        engine
            .create_escrow(&engagement, committed, &buyer())
            .await
            .unwrap();
        let (_, milestones) = engine.fund_escrow(&engagement, &buyer()).await.unwrap();
        (engagement, milestones)
    }

    #[tokio::test]
    async fn create_rejects_non_positive_amounts() {
        let (_, engine) = setup();
        let engagement = EngagementId::generate();
        assert!(matches!(
            engine.create_escrow(&engagement, 0, &buyer()).await,
            Err(EscrowError::InvalidAmount(0))
        ));
        assert!(matches!(
            engine.create_escrow(&engagement, -5, &buyer()).await,
            Err(EscrowError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn create_rejects_existing_escrow() {
        let (_, engine) = setup();
        let engagement = EngagementId::generate();
        engine
            .create_escrow(&engagement, 100, &buyer())
            .await
            .unwrap();
        assert!(matches!(
            engine.create_escrow(&engagement, 100, &buyer()).await,
            Err(EscrowError::EscrowStateConflict {
                status: EscrowStatus::Pending
            })
        ));
    }

    #[tokio::test]
    async fn funding_requires_the_initiator() {
        let (_, engine) = setup();
        let engagement = EngagementId::generate();
        engine
            .create_escrow(&engagement, 100, &buyer())
            .await
            .unwrap();

        let other = AccountId::new("someone-else");
        assert!(matches!(
            engine.fund_escrow(&engagement, &other).await,
            Err(EscrowError::NotInitiator { .. })
        ));
    }

    #[tokio::test]
    async fn funding_twice_is_a_state_conflict() {
        let (_, engine) = setup();
        let (engagement, _) = funded_engagement(&engine, 100).await;
        assert!(matches!(
            engine.fund_escrow(&engagement, &buyer()).await,
            Err(EscrowError::EscrowStateConflict {
                status: EscrowStatus::Funded
            })
        ));
    }

    #[tokio::test]
    async fn milestones_release_in_order_and_complete_the_escrow() {
        let (notifier, engine) = setup();
        let (engagement, milestones) = funded_engagement(&engine, 100).await;
        assert_eq!(
            milestones.iter().map(|m| m.amount_minor).collect::<Vec<_>>(),
            vec![15, 15, 40, 30]
        );

        let outcome = engine
            .release_milestone(&engagement, &milestones[0].milestone_id)
            .await
            .unwrap();
        assert_eq!(outcome.escrow.released_minor, 15);
        assert_eq!(outcome.escrow.status, EscrowStatus::Funded);

        // Ordinal 2 before ordinal 1.
        let out_of_order = engine
            .release_milestone(&engagement, &milestones[2].milestone_id)
            .await;
        assert!(matches!(
            out_of_order,
            Err(EscrowError::OutOfSequenceRelease { next_ordinal: 1, .. })
        ));

        for milestone in &milestones[1..] {
            engine
                .release_milestone(&engagement, &milestone.milestone_id)
                .await
                .unwrap();
        }
        let escrow = engine.escrow(&engagement).await.unwrap().unwrap();
        assert_eq!(escrow.released_minor, 100);
        assert_eq!(escrow.status, EscrowStatus::Completed);
        assert_eq!(
            notifier
                .sent_of_kind(NotificationKind::MilestoneReleased)
                .len(),
            4
        );
        assert_eq!(
            notifier.sent_of_kind(NotificationKind::EscrowCompleted).len(),
            1
        );
    }

    #[tokio::test]
    async fn releasing_a_completed_milestone_is_out_of_sequence() {
        let (_, engine) = setup();
        let (engagement, milestones) = funded_engagement(&engine, 100).await;

        engine
            .release_milestone(&engagement, &milestones[0].milestone_id)
            .await
            .unwrap();
        let again = engine
            .release_milestone(&engagement, &milestones[0].milestone_id)
            .await;
        assert!(matches!(
            again,
            Err(EscrowError::OutOfSequenceRelease { next_ordinal: 1, .. })
        ));
    }

    #[tokio::test]
    async fn final_milestone_absorbs_rounding_remainder() {
        let (_, engine) = setup();
        let (engagement, milestones) = funded_engagement(&engine, 101).await;
        assert_eq!(
            milestones.iter().map(|m| m.amount_minor).collect::<Vec<_>>(),
            vec![15, 15, 40, 31]
        );

        for milestone in &milestones {
            engine
                .release_milestone(&engagement, &milestone.milestone_id)
                .await
                .unwrap();
        }
        let escrow = engine.escrow(&engagement).await.unwrap().unwrap();
        assert_eq!(escrow.released_minor, 101);
        assert_eq!(escrow.status, EscrowStatus::Completed);
    }

    #[tokio::test]
    async fn partial_release_respects_the_remaining_amount() {
        let (_, engine) = setup();
        let (engagement, _) = funded_engagement(&engine, 100).await;

        engine.release_partial(&engagement, 60).await.unwrap();
        let over = engine.release_partial(&engagement, 50).await;
        assert!(matches!(
            over,
            Err(EscrowError::OverRelease {
                requested_minor: 50,
                remaining_minor: 40
            })
        ));

        let outcome = engine.release_partial(&engagement, 40).await.unwrap();
        assert_eq!(outcome.escrow.status, EscrowStatus::Completed);
    }

    #[tokio::test]
    async fn dispute_freezes_release() {
        let (_, engine) = setup();
        let (engagement, milestones) = funded_engagement(&engine, 100).await;

        engine.open_dispute(&engagement).await.unwrap();
        let blocked = engine
            .release_milestone(&engagement, &milestones[0].milestone_id)
            .await;
        assert!(matches!(
            blocked,
            Err(EscrowError::EscrowStateConflict {
                status: EscrowStatus::Disputed
            })
        ));
    }

    #[tokio::test]
    async fn dispute_requires_funded_status() {
        let (_, engine) = setup();
        let engagement = EngagementId::generate();
        engine
            .create_escrow(&engagement, 100, &buyer())
            .await
            .unwrap();
        assert!(matches!(
            engine.open_dispute(&engagement).await,
            Err(EscrowError::EscrowStateConflict {
                status: EscrowStatus::Pending
            })
        ));
    }

    #[tokio::test]
    async fn unlock_marks_work_done_and_release_still_applies() {
        let (_, engine) = setup();
        let (engagement, milestones) = funded_engagement(&engine, 100).await;

        let unlocked = engine
            .unlock_milestone(&engagement, &milestones[0].milestone_id)
            .await
            .unwrap();
        assert_eq!(unlocked.status, MilestoneStatus::Unlocked);

        // Unlocking twice trips the compare-and-set.
        assert!(matches!(
            engine
                .unlock_milestone(&engagement, &milestones[0].milestone_id)
                .await,
            Err(EscrowError::Conflict(_))
        ));

        let outcome = engine
            .release_milestone(&engagement, &milestones[0].milestone_id)
            .await
            .unwrap();
        assert_eq!(
            outcome.milestone.unwrap().status,
            MilestoneStatus::Completed
        );
    }

    #[tokio::test]
    async fn plan_weights_must_sum_to_one_hundred() {
        let result = MilestonePlan::new(vec![
            MilestoneStep::new("half", 50),
            MilestoneStep::new("short", 40),
        ]);
        assert!(matches!(result, Err(EscrowError::InvalidPlan(_))));
    }

    proptest! {
        #[test]
        fn property_plan_amounts_sum_to_commitment(committed in 1_i64..1_000_000) {
            let plan = MilestonePlan::garment_production();
            let records = plan.build_records(&EngagementId::new("prop"), committed);
            let total: i64 = records.iter().map(|m| m.amount_minor).sum();
            prop_assert_eq!(total, committed);
            prop_assert!(records.iter().all(|m| m.amount_minor >= 0));
        }
    }
}
