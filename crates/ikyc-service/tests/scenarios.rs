use ikyc_adapters::{
    fixed_registry, AlwaysFailAdapter, FixedRiskEvaluator, FixedScoreAdapter, FlakyAdapter,
    RecordingNotifier, SimulatedLedgerAnchor, SlowAdapter, StaticSanctionsList,
};
use ikyc_core::{
    AdapterRegistry, AnchorStatus, DocumentRefs, IKycConfig, IKycError, KycTier,
    ReviewSubmission, Stage, SubjectFields, Submission, TicketStatus,
    REASON_RISK_BELOW_THRESHOLD,
};
use ikyc_service::ServiceState;
use std::sync::Arc;
use std::time::Duration;

fn submission(name: &str, tier: KycTier) -> Submission {
    Submission::new(
        SubjectFields::new(name, "1991-03-02", "7 Quay Street", tier)
            .with_contact(Some("subject@example.com".to_string()), None),
        DocumentRefs::new(
            format!("s3://kyc/{name}/front"),
            format!("s3://kyc/{name}/back"),
            format!("s3://kyc/{name}/selfie"),
        ),
    )
}

async fn fixed_state(face: f64, liveness: f64, risk: f64) -> ServiceState {
    ServiceState::bootstrap_with(
        IKycConfig::default(),
        fixed_registry(0.95, face, liveness),
        Arc::new(FixedRiskEvaluator(risk)),
    )
    .await
    .unwrap()
}

fn registry_with(
    ocr: Arc<dyn ikyc_core::ScoringAdapter>,
    face: Arc<dyn ikyc_core::ScoringAdapter>,
    liveness: Arc<dyn ikyc_core::ScoringAdapter>,
    notifier: Arc<RecordingNotifier>,
) -> AdapterRegistry {
    AdapterRegistry::new()
        .with_scorer(ocr)
        .with_scorer(face)
        .with_scorer(liveness)
        .with_anchor(Arc::new(SimulatedLedgerAnchor::new()))
        .with_notifier(notifier)
}

#[tokio::test(start_paused = true)]
async fn scenario_a_high_scores_are_auto_approved() {
    let state = fixed_state(0.9, 0.9, 0.9).await;
    let orchestrator = state.orchestrator();
    let id = orchestrator
        .submit(submission("alice", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = orchestrator.get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Approved);
    assert_eq!(ticket.approved_tier(), Some(KycTier::Full));
    assert!(ticket.decision.as_ref().unwrap().auto_decided);
    assert!(ticket.decided_at.is_some());
    assert!(ticket.reviewed_at.is_none());
    assert!(matches!(ticket.anchor, Some(AnchorStatus::Anchored { .. })));
    for stage in Stage::PIPELINE {
        assert!(ticket.score(stage).is_some(), "{stage} missing");
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_b_low_risk_is_rejected_with_reason() {
    let state = fixed_state(0.9, 0.9, 0.5).await;
    let id = state
        .orchestrator()
        .submit(submission("bob", KycTier::Basic))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = state.orchestrator().get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Rejected);
    assert_eq!(ticket.rejection_reason(), Some(REASON_RISK_BELOW_THRESHOLD));
    assert!(ticket.anchor.is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_c_weak_face_match_goes_to_review() {
    let state = fixed_state(0.5, 0.9, 0.95).await;
    let id = state
        .orchestrator()
        .submit(submission("carol", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = state.orchestrator().get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::ManualReview);
    assert!(ticket.decision.is_none());
    assert_eq!(
        ticket.escalation_note.as_deref(),
        Some("biometric score below threshold")
    );
    let pending = state.orchestrator().list_pending_review().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].ticket_id, id);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_reviewer_rejects_and_second_review_fails() {
    let notifier = Arc::new(RecordingNotifier::new());
    let adapters = registry_with(
        Arc::new(FixedScoreAdapter::new(Stage::Ocr, 0.95)),
        Arc::new(FixedScoreAdapter::new(Stage::FaceMatch, 0.5)),
        Arc::new(FixedScoreAdapter::new(Stage::Liveness, 0.9)),
        notifier.clone(),
    );
    let state = ServiceState::bootstrap_with(
        IKycConfig::default(),
        adapters,
        Arc::new(FixedRiskEvaluator(0.95)),
    )
    .await
    .unwrap();
    let orchestrator = state.orchestrator();
    let id = orchestrator
        .submit(submission("dave", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = orchestrator
        .submit_review(
            ReviewSubmission::reject(id, "reviewer-7", "document mismatch")
                .with_note("photo does not match id"),
        )
        .await
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Rejected);
    assert_eq!(ticket.rejection_reason(), Some("document mismatch"));
    let decision = ticket.decision.as_ref().unwrap();
    assert_eq!(decision.reviewer_id.as_deref(), Some("reviewer-7"));
    assert!(!decision.auto_decided);
    assert!(ticket.reviewed_at.is_some());

    let second = orchestrator
        .submit_review(ReviewSubmission::approve(id, "reviewer-8", KycTier::Basic))
        .await;
    assert!(matches!(second, Err(IKycError::InvalidState { .. })));

    state.pool().drain().await.unwrap();
    let sent = notifier.sent_for(id).await;
    let statuses = sent.iter().map(|n| n.status).collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![TicketStatus::ManualReview, TicketStatus::Rejected]
    );
    assert_eq!(sent[1].reason.as_deref(), Some("document mismatch"));
}

#[tokio::test(start_paused = true)]
async fn transient_ocr_failures_recover_within_budget() {
    let notifier = Arc::new(RecordingNotifier::new());
    let flaky = Arc::new(FlakyAdapter::new(
        Arc::new(FixedScoreAdapter::new(Stage::Ocr, 0.95)),
        2,
    ));
    let adapters = registry_with(
        flaky.clone(),
        Arc::new(FixedScoreAdapter::new(Stage::FaceMatch, 0.9)),
        Arc::new(FixedScoreAdapter::new(Stage::Liveness, 0.9)),
        notifier,
    );
    let state = ServiceState::bootstrap_with(
        IKycConfig::default(),
        adapters,
        Arc::new(FixedRiskEvaluator(0.9)),
    )
    .await
    .unwrap();
    let id = state
        .orchestrator()
        .submit(submission("erin", KycTier::Basic))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = state.orchestrator().get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Approved);
    assert_eq!(ticket.attempts(Stage::Ocr), 3);
    assert_eq!(flaky.calls(), 3);
    assert!(state.orchestrator().queue().dead_letters().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_liveness_budget_escalates_with_system_note() {
    let failing = Arc::new(AlwaysFailAdapter::new(Stage::Liveness, "model unavailable"));
    let adapters = registry_with(
        Arc::new(FixedScoreAdapter::new(Stage::Ocr, 0.95)),
        Arc::new(FixedScoreAdapter::new(Stage::FaceMatch, 0.9)),
        failing.clone(),
        Arc::new(RecordingNotifier::new()),
    );
    let state = ServiceState::bootstrap_with(
        IKycConfig::default(),
        adapters,
        Arc::new(FixedRiskEvaluator(0.9)),
    )
    .await
    .unwrap();
    let id = state
        .orchestrator()
        .submit(submission("frank", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = state.orchestrator().get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::ManualReview);
    let note = ticket.escalation_note.clone().unwrap_or_default();
    assert!(note.starts_with("liveness failed after 3 attempt(s)"), "{note}");
    assert_eq!(failing.calls(), 3);
    assert!(ticket.score(Stage::Risk).is_none());

    let dead = state.orchestrator().queue().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task.stage, Stage::Liveness);
}

#[tokio::test(start_paused = true)]
async fn hung_face_matcher_times_out_and_escalates() {
    let slow = Arc::new(SlowAdapter::new(
        Arc::new(FixedScoreAdapter::new(Stage::FaceMatch, 0.99)),
        Duration::from_secs(120),
    ));
    let adapters = registry_with(
        Arc::new(FixedScoreAdapter::new(Stage::Ocr, 0.95)),
        slow,
        Arc::new(FixedScoreAdapter::new(Stage::Liveness, 0.9)),
        Arc::new(RecordingNotifier::new()),
    );
    let state = ServiceState::bootstrap_with(
        IKycConfig::default(),
        adapters,
        Arc::new(FixedRiskEvaluator(0.9)),
    )
    .await
    .unwrap();
    let id = state
        .orchestrator()
        .submit(submission("grace", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let ticket = state.orchestrator().get_status(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::ManualReview);
    assert!(ticket.score(Stage::FaceMatch).is_none());
    let dead = state.orchestrator().queue().dead_letters().await.unwrap();
    assert!(dead[0].reason.contains("timed out"), "{}", dead[0].reason);
}

#[tokio::test(start_paused = true)]
async fn sanctions_hit_rejects_through_composite_risk() {
    let adapters = fixed_registry(0.95, 0.95, 0.95)
        .with_sanctions(Arc::new(StaticSanctionsList::new(["Mallory Knox"])));
    let state = ServiceState::bootstrap(IKycConfig::default(), adapters)
        .await
        .unwrap();
    let flagged = state
        .orchestrator()
        .submit(submission("Mallory Knox", KycTier::Full))
        .await
        .unwrap();
    let clean = state
        .orchestrator()
        .submit(submission("Heidi Park", KycTier::Full))
        .await
        .unwrap();
    state.pool().drain().await.unwrap();

    let flagged = state.orchestrator().get_status(flagged).await.unwrap();
    assert_eq!(flagged.status, TicketStatus::Rejected);
    assert_eq!(flagged.score_value(Stage::Risk), Some(0.0));
    assert!(flagged.sanctions.as_ref().unwrap().hit);

    let clean = state.orchestrator().get_status(clean).await.unwrap();
    assert_eq!(clean.status, TicketStatus::Approved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_resolve_every_ticket_once() {
    let state = fixed_state(0.9, 0.9, 0.92).await;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = {
        let state = state.clone();
        tokio::spawn(async move {
            state
                .run_until(async move {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    let mut ids = Vec::new();
    for i in 0..30 {
        let id = state
            .orchestrator()
            .submit(submission(&format!("user-{i}"), KycTier::Full))
            .await
            .unwrap();
        ids.push(id);
    }

    let settled = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let approved = state.count(TicketStatus::Approved).await.unwrap();
            let mut anchored = 0;
            for id in &ids {
                let ticket = state.orchestrator().get_status(*id).await.unwrap();
                if matches!(ticket.anchor, Some(AnchorStatus::Anchored { .. })) {
                    anchored += 1;
                }
            }
            if approved == ids.len() && anchored == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "pipeline did not settle in time");

    let _ = stop_tx.send(());
    runner.await.unwrap().unwrap();

    for id in &ids {
        let ticket = state.orchestrator().get_status(*id).await.unwrap();
        for stage in Stage::PIPELINE {
            assert_eq!(ticket.attempts(stage), 1, "{stage} ran twice for {id}");
        }
    }
    let audit = state.orchestrator().audit_log();
    assert!(audit.lock().await.verify_chain());
}
