//! Workflow gate - serializes side-effecting actions per engagement.
//!
//! The gate keeps a persisted per-engagement in-progress flag and a
//! last-completed stamp, both updated through atomic compare-and-set storage
//! operations, so duplicate triggers (double submits, retried requests) for
//! the same engagement collapse into one execution. Losing a flag race only
//! risks a duplicate external call, never a financial inconsistency; money
//! movement stays behind the ledger's stricter locking underneath.
//!
//! Phase legality is a data table: every action names its allowed source
//! phases, and every plain forward edge is listed once. The
//! generation-triggering edge is the only one that moves through
//! [`WorkflowGate::run_guarded`] instead of [`WorkflowGate::advance`].

#![deny(unsafe_code)]

use atelier_storage::{
    ActionClaim, ActionOutcome, AtelierStorage, EngagementStateRecord, StorageError,
};
use atelier_types::{EngagementAction, EngagementId, WorkflowPhase};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors the gate raises. Rejections cause no state change.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("engagement not found: {0}")]
    EngagementNotFound(String),

    #[error("{attempted} is not allowed in phase {phase}")]
    PhaseViolation {
        attempted: String,
        phase: WorkflowPhase,
    },

    #[error("action {action} is already in progress")]
    Busy { action: String },

    #[error("guarded action failed: {0}")]
    ActionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("busy, retry: {0}")]
    Contention(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for GateError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::EngagementNotFound(msg),
            StorageError::Busy(msg) => Self::Contention(msg),
            StorageError::Conflict(msg) | StorageError::InvariantViolation(msg) => {
                Self::Conflict(msg)
            }
            StorageError::InsufficientFunds { .. } => {
                Self::Backend("unexpected funds error in gate path".to_string())
            }
            StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}

/// How a guarded call concluded.
#[derive(Clone, Debug, PartialEq)]
pub enum GateOutcome {
    /// The action ran to completion in this call.
    Executed(Value),
    /// A previous execution's result was returned; nothing ran.
    Reused(Value),
}

impl GateOutcome {
    pub fn value(&self) -> &Value {
        match self {
            GateOutcome::Executed(value) | GateOutcome::Reused(value) => value,
        }
    }

    pub fn reused(&self) -> bool {
        matches!(self, GateOutcome::Reused(_))
    }
}

/// Gate tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct GateConfig {
    /// Window in which a repeated trigger of the same action returns the
    /// stored result instead of re-executing.
    pub cooldown: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(2),
        }
    }
}

/// Source phases from which an action may start.
fn allowed_phases(action: EngagementAction) -> &'static [WorkflowPhase] {
    match action {
        EngagementAction::GenerateVariations => {
            &[WorkflowPhase::GatheringInfo, WorkflowPhase::PreviewingDesign]
        }
        EngagementAction::RequestPayment => &[WorkflowPhase::AwaitingPayment],
        EngagementAction::UnlockMilestone => &[
            WorkflowPhase::InProduction,
            WorkflowPhase::SampleReview,
            WorkflowPhase::FinalReview,
            WorkflowPhase::Delivery,
        ],
    }
}

/// Phase the engagement lands in after the action succeeds, if any.
fn completion_phase(action: EngagementAction, current: WorkflowPhase) -> Option<WorkflowPhase> {
    match action {
        EngagementAction::GenerateVariations => {
            if current == WorkflowPhase::PreviewingDesign {
                None
            } else {
                Some(WorkflowPhase::PreviewingDesign)
            }
        }
        EngagementAction::RequestPayment | EngagementAction::UnlockMilestone => None,
    }
}

/// The single forward successor of each phase.
fn next_phase(phase: WorkflowPhase) -> Option<WorkflowPhase> {
    match phase {
        WorkflowPhase::Welcome => Some(WorkflowPhase::GatheringInfo),
        WorkflowPhase::GatheringInfo => Some(WorkflowPhase::PreviewingDesign),
        WorkflowPhase::PreviewingDesign => Some(WorkflowPhase::DesignApproved),
        WorkflowPhase::DesignApproved => Some(WorkflowPhase::JobInfoGathering),
        WorkflowPhase::JobInfoGathering => Some(WorkflowPhase::AwaitingPayment),
        WorkflowPhase::AwaitingPayment => Some(WorkflowPhase::Listed),
        WorkflowPhase::Listed => Some(WorkflowPhase::ProposalReceived),
        WorkflowPhase::ProposalReceived => Some(WorkflowPhase::EscrowFunded),
        WorkflowPhase::EscrowFunded => Some(WorkflowPhase::InProduction),
        WorkflowPhase::InProduction => Some(WorkflowPhase::SampleReview),
        WorkflowPhase::SampleReview => Some(WorkflowPhase::FinalReview),
        WorkflowPhase::FinalReview => Some(WorkflowPhase::Delivery),
        WorkflowPhase::Delivery => Some(WorkflowPhase::Completed),
        WorkflowPhase::Completed => None,
    }
}

/// True for forward edges written by a plain phase update. The
/// generation-triggering edge only moves through the guarded path.
fn is_plain_edge(from: WorkflowPhase, to: WorkflowPhase) -> bool {
    if from == WorkflowPhase::GatheringInfo && to == WorkflowPhase::PreviewingDesign {
        return false;
    }
    next_phase(from) == Some(to)
}

/// The workflow gate facade.
pub struct WorkflowGate {
    storage: Arc<dyn AtelierStorage>,
    config: GateConfig,
}

impl WorkflowGate {
    pub fn new(storage: Arc<dyn AtelierStorage>) -> Self {
        Self::with_config(storage, GateConfig::default())
    }

    pub fn with_config(storage: Arc<dyn AtelierStorage>, config: GateConfig) -> Self {
        Self { storage, config }
    }

    /// Create the workflow state for a new engagement, starting at welcome.
    pub async fn register_engagement(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<EngagementStateRecord, GateError> {
        let record = self
            .storage
            .init_state(engagement_id, WorkflowPhase::Welcome, Utc::now())
            .await?;
        tracing::info!(engagement_id = %engagement_id, "engagement registered");
        Ok(record)
    }

    /// Current state record.
    pub async fn state(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<EngagementStateRecord, GateError> {
        self.require_state(engagement_id).await
    }

    /// Plain forward phase write. Rejects anything not in the transition
    /// table, including the guarded generation edge.
    pub async fn advance(
        &self,
        engagement_id: &EngagementId,
        to: WorkflowPhase,
    ) -> Result<EngagementStateRecord, GateError> {
        let state = self.require_state(engagement_id).await?;
        if !is_plain_edge(state.phase, to) {
            return Err(GateError::PhaseViolation {
                attempted: format!("advance to {to}"),
                phase: state.phase,
            });
        }
        let record = self
            .storage
            .transition_phase(engagement_id, state.phase, to, Utc::now())
            .await?;
        tracing::info!(
            engagement_id = %engagement_id,
            from = %state.phase,
            to = %to,
            "phase advanced"
        );
        Ok(record)
    }

    /// Run a guarded action once.
    ///
    /// A repeat trigger while the flag is held, or within the cool-down
    /// window of a completed run, returns the stored result instead of
    /// executing again. The flag is cleared on success and on failure; the
    /// completion stamp, the result, and the phase advance are written in
    /// the same atomic update as the clear.
    pub async fn run_guarded<F, Fut>(
        &self,
        engagement_id: &EngagementId,
        action: EngagementAction,
        work: F,
    ) -> Result<GateOutcome, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, Box<dyn std::error::Error + Send + Sync>>> + Send,
    {
        let state = self.require_state(engagement_id).await?;
        if !allowed_phases(action).contains(&state.phase) {
            return Err(GateError::PhaseViolation {
                attempted: action.to_string(),
                phase: state.phase,
            });
        }

        if let Some(result) = self.recent_result(&state, action) {
            tracing::debug!(
                engagement_id = %engagement_id,
                action = %action,
                "duplicate trigger absorbed by cool-down"
            );
            return Ok(GateOutcome::Reused(result));
        }

        match self
            .storage
            .begin_action(engagement_id, action.as_str(), Utc::now())
            .await?
        {
            ActionClaim::Claimed(_) => {}
            ActionClaim::Held { action: held } => {
                // Lost the race; hand back the latest completed result if
                // the same action produced one, otherwise report busy.
                let state = self.require_state(engagement_id).await?;
                if held == action.as_str() {
                    if let Some(result) = self.latest_result(&state, action) {
                        return Ok(GateOutcome::Reused(result));
                    }
                }
                return Err(GateError::Busy { action: held });
            }
        }

        match work().await {
            Ok(result) => {
                self.storage
                    .finish_action(
                        engagement_id,
                        action.as_str(),
                        ActionOutcome::Completed {
                            result: result.clone(),
                            next_phase: completion_phase(action, state.phase),
                        },
                        Utc::now(),
                    )
                    .await?;
                tracing::info!(
                    engagement_id = %engagement_id,
                    action = %action,
                    "guarded action completed"
                );
                Ok(GateOutcome::Executed(result))
            }
            Err(err) => {
                // The flag must not stay set after a failed run.
                if let Err(clear_err) = self
                    .storage
                    .finish_action(
                        engagement_id,
                        action.as_str(),
                        ActionOutcome::Failed,
                        Utc::now(),
                    )
                    .await
                {
                    tracing::warn!(
                        engagement_id = %engagement_id,
                        action = %action,
                        error = %clear_err,
                        "failed to clear in-progress flag"
                    );
                }
                Err(GateError::ActionFailed(err.to_string()))
            }
        }
    }

    /// Merge one free-form flag into the engagement's metadata.
    pub async fn annotate(
        &self,
        engagement_id: &EngagementId,
        key: &str,
        value: Value,
    ) -> Result<EngagementStateRecord, GateError> {
        Ok(self
            .storage
            .put_metadata(engagement_id, key, value, Utc::now())
            .await?)
    }

    async fn require_state(
        &self,
        engagement_id: &EngagementId,
    ) -> Result<EngagementStateRecord, GateError> {
        self.storage
            .get_state(engagement_id)
            .await?
            .ok_or_else(|| GateError::EngagementNotFound(engagement_id.0.clone()))
    }

    /// Stored result of the same action completed within the cool-down.
    fn recent_result(
        &self,
        state: &EngagementStateRecord,
        action: EngagementAction,
    ) -> Option<Value> {
        let completed_at = state.last_completed_at?;
        if Utc::now() - completed_at > self.config.cooldown {
            return None;
        }
        self.latest_result(state, action)
    }

    /// Stored result of the same action, regardless of age.
    fn latest_result(
        &self,
        state: &EngagementStateRecord,
        action: EngagementAction,
    ) -> Option<Value> {
        if state.last_completed_action.as_deref() != Some(action.as_str()) {
            return None;
        }
        state.last_result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_storage::memory::InMemoryAtelierStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> WorkflowGate {
        WorkflowGate::new(Arc::new(InMemoryAtelierStorage::new()))
    }

    async fn registered(gate: &WorkflowGate) -> EngagementId {
        let engagement = EngagementId::generate();
        gate.register_engagement(&engagement).await.unwrap();
        engagement
    }

    fn ok_result() -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        Ok(serde_json::json!({"variations": 3}))
    }

    #[tokio::test]
    async fn advance_follows_the_transition_table() {
        let gate = setup();
        let engagement = registered(&gate).await;

        let state = gate
            .advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();
        assert_eq!(state.phase, WorkflowPhase::GatheringInfo);

        // Skipping ahead is rejected and changes nothing.
        let skipped = gate.advance(&engagement, WorkflowPhase::Listed).await;
        assert!(matches!(skipped, Err(GateError::PhaseViolation { .. })));
        assert_eq!(
            gate.state(&engagement).await.unwrap().phase,
            WorkflowPhase::GatheringInfo
        );
    }

    #[tokio::test]
    async fn generation_edge_is_not_a_plain_advance() {
        let gate = setup();
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();

        let result = gate
            .advance(&engagement, WorkflowPhase::PreviewingDesign)
            .await;
        assert!(matches!(result, Err(GateError::PhaseViolation { .. })));
    }

    #[tokio::test]
    async fn guarded_action_requires_a_whitelisted_phase() {
        let gate = setup();
        let engagement = registered(&gate).await;

        // Still in welcome; generation is not legal yet.
        let result = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await;
        assert!(matches!(
            result,
            Err(GateError::PhaseViolation {
                phase: WorkflowPhase::Welcome,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn guarded_success_stores_result_and_advances_phase() {
        let gate = setup();
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();

        let outcome = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Executed(_)));

        let state = gate.state(&engagement).await.unwrap();
        assert_eq!(state.phase, WorkflowPhase::PreviewingDesign);
        assert!(state.busy_action.is_none());
        assert_eq!(
            state.last_completed_action.as_deref(),
            Some("generate_variations")
        );
        assert!(state.last_result.is_some());
    }

    #[tokio::test]
    async fn duplicate_trigger_during_flight_reports_busy() {
        let gate = Arc::new(setup());
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let first = {
            let gate = gate.clone();
            let engagement = engagement.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                gate.run_guarded(&engagement, EngagementAction::GenerateVariations, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    ok_result()
                })
                .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await;
        assert!(matches!(second, Err(GateError::Busy { .. })));

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, GateOutcome::Executed(_)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Within the cool-down the completed result is replayed.
        let third = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await
            .unwrap();
        assert!(third.reused());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_action_clears_the_flag_and_allows_retry() {
        let gate = setup();
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();

        let failed = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                Err::<Value, Box<dyn std::error::Error + Send + Sync>>(
                    "image provider timed out".into(),
                )
            })
            .await;
        assert!(matches!(failed, Err(GateError::ActionFailed(_))));

        let state = gate.state(&engagement).await.unwrap();
        assert!(state.busy_action.is_none());
        assert_eq!(state.phase, WorkflowPhase::GatheringInfo);
        assert!(state.last_result.is_none());

        // No result was stored, so the retry executes.
        let retry = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await
            .unwrap();
        assert!(matches!(retry, GateOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn expired_cooldown_executes_again() {
        let storage = Arc::new(InMemoryAtelierStorage::new());
        let gate = WorkflowGate::with_config(
            storage,
            GateConfig {
                cooldown: Duration::zero(),
            },
        );
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();

        let first = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await
            .unwrap();
        assert!(matches!(first, GateOutcome::Executed(_)));

        let second = gate
            .run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
                ok_result()
            })
            .await
            .unwrap();
        assert!(matches!(second, GateOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn request_payment_does_not_advance_the_phase() {
        let gate = setup();
        let engagement = registered(&gate).await;
        gate.advance(&engagement, WorkflowPhase::GatheringInfo)
            .await
            .unwrap();
        gate.run_guarded(&engagement, EngagementAction::GenerateVariations, || async {
            ok_result()
        })
        .await
        .unwrap();
        gate.advance(&engagement, WorkflowPhase::DesignApproved)
            .await
            .unwrap();
        gate.advance(&engagement, WorkflowPhase::JobInfoGathering)
            .await
            .unwrap();
        gate.advance(&engagement, WorkflowPhase::AwaitingPayment)
            .await
            .unwrap();

        let outcome = gate
            .run_guarded(&engagement, EngagementAction::RequestPayment, || async {
                Ok(serde_json::json!({"reference": "pay_0001"}))
            })
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Executed(_)));

        // Listing happens only once the charge is confirmed, via advance.
        let state = gate.state(&engagement).await.unwrap();
        assert_eq!(state.phase, WorkflowPhase::AwaitingPayment);
        gate.advance(&engagement, WorkflowPhase::Listed).await.unwrap();
    }

    #[test]
    fn unlock_is_legal_through_the_production_reviews() {
        for phase in [
            WorkflowPhase::InProduction,
            WorkflowPhase::SampleReview,
            WorkflowPhase::FinalReview,
            WorkflowPhase::Delivery,
        ] {
            assert!(allowed_phases(EngagementAction::UnlockMilestone).contains(&phase));
            assert_eq!(
                completion_phase(EngagementAction::UnlockMilestone, phase),
                None
            );
        }
        assert!(!allowed_phases(EngagementAction::UnlockMilestone)
            .contains(&WorkflowPhase::Completed));
    }

    #[tokio::test]
    async fn annotate_merges_metadata_flags() {
        let gate = setup();
        let engagement = registered(&gate).await;

        let state = gate
            .annotate(&engagement, "confirm_requested", Value::Bool(true))
            .await
            .unwrap();
        assert_eq!(
            state.metadata.get("confirm_requested"),
            Some(&Value::Bool(true))
        );
    }
}
