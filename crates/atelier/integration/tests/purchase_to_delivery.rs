//! Full engagement walk: onboarding, credit purchase, guarded generation,
//! listing, escrow funding, and milestone-gated release to completion.

use atelier_integration::Platform;
use atelier_notify::NotificationKind;
use atelier_types::{
    AccountId, EngagementAction, EngagementId, EscrowStatus, TransactionKind, WorkflowPhase,
};
use serde_json::{json, Value};

#[tokio::test]
async fn engagement_runs_from_welcome_to_completed() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let platform = Platform::in_memory();
    let requester = AccountId::new("requester-1");
    platform.ledger.open_account(&requester).await.unwrap();

    let engagement = EngagementId::generate();
    platform.gate.register_engagement(&engagement).await.unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::GatheringInfo)
        .await
        .unwrap();

    // Buy generation credits through the provider.
    let session = platform
        .payments
        .start_purchase(&requester, 10, Value::Null)
        .await
        .unwrap();
    let receipt = platform
        .payments
        .complete_purchase(&session.reference)
        .await
        .unwrap();
    assert_eq!(receipt.balance_minor, 10);

    // Guarded generation spends one credit and moves the phase forward.
    let ledger = platform.ledger.clone();
    let debit_account = requester.clone();
    let debit_engagement = engagement.clone();
    let outcome = platform
        .gate
        .run_guarded(&engagement, EngagementAction::GenerateVariations, || async move {
            ledger
                .debit(
                    &debit_account,
                    1,
                    TransactionKind::Usage,
                    Some(debit_engagement),
                    json!({"action": "generate_variations"}),
                )
                .await?;
            Ok(json!({"variations": ["v1", "v2", "v3"]}))
        })
        .await
        .unwrap();
    assert!(!outcome.reused());
    assert_eq!(platform.ledger.balance(&requester).await.unwrap(), 9);
    assert_eq!(
        platform.gate.state(&engagement).await.unwrap().phase,
        WorkflowPhase::PreviewingDesign
    );

    // Approval and job details are plain forward edges.
    platform
        .gate
        .advance(&engagement, WorkflowPhase::DesignApproved)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::JobInfoGathering)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::AwaitingPayment)
        .await
        .unwrap();

    // The listing fee goes through the same idempotent purchase path and
    // is spent as soon as the charge is confirmed.
    let listing = platform
        .payments
        .start_purchase(&requester, 50, json!({"item": "listing"}))
        .await
        .unwrap();
    platform
        .payments
        .complete_purchase(&listing.reference)
        .await
        .unwrap();
    platform
        .ledger
        .debit(
            &requester,
            50,
            TransactionKind::Usage,
            Some(engagement.clone()),
            json!({"item": "listing"}),
        )
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::Listed)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::ProposalReceived)
        .await
        .unwrap();

    // Escrow: create, fund, and follow the proposal acceptance.
    platform
        .escrow
        .create_escrow(&engagement, 1000, &requester)
        .await
        .unwrap();
    let (funded, milestones) = platform
        .escrow
        .fund_escrow(&engagement, &requester)
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
    assert_eq!(
        milestones.iter().map(|m| m.amount_minor).collect::<Vec<_>>(),
        vec![150, 150, 400, 300]
    );
    platform
        .gate
        .advance(&engagement, WorkflowPhase::EscrowFunded)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::InProduction)
        .await
        .unwrap();

    // Production: unlock-then-release each milestone, in order, while the
    // workflow walks its review phases.
    platform
        .escrow
        .unlock_milestone(&engagement, &milestones[0].milestone_id)
        .await
        .unwrap();
    platform
        .escrow
        .release_milestone(&engagement, &milestones[0].milestone_id)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::SampleReview)
        .await
        .unwrap();
    platform
        .escrow
        .release_milestone(&engagement, &milestones[1].milestone_id)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::FinalReview)
        .await
        .unwrap();
    platform
        .escrow
        .release_milestone(&engagement, &milestones[2].milestone_id)
        .await
        .unwrap();
    platform
        .gate
        .advance(&engagement, WorkflowPhase::Delivery)
        .await
        .unwrap();
    let last = platform
        .escrow
        .release_milestone(&engagement, &milestones[3].milestone_id)
        .await
        .unwrap();
    assert_eq!(last.escrow.status, EscrowStatus::Completed);
    assert_eq!(last.escrow.released_minor, 1000);
    platform
        .gate
        .advance(&engagement, WorkflowPhase::Completed)
        .await
        .unwrap();

    // The journal still replays cleanly after the whole story.
    let audit = platform.ledger.verify_account(&requester).await.unwrap();
    assert_eq!(audit.balance_minor, 9);
    assert_eq!(
        platform
            .notifier
            .sent_of_kind(NotificationKind::EscrowFunded)
            .len(),
        1
    );
    assert_eq!(
        platform
            .notifier
            .sent_of_kind(NotificationKind::MilestoneReleased)
            .len(),
        4
    );
    assert_eq!(
        platform
            .notifier
            .sent_of_kind(NotificationKind::EscrowCompleted)
            .len(),
        1
    );
}
