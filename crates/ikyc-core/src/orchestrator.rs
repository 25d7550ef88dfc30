//! Pipeline orchestrator: the single transition authority for tickets.
//!
//! Every status change, automated or human, goes through the store's
//! compare-and-set. Follow-up stages are claimed with `mark_dispatched`
//! before they are enqueued, so duplicate or concurrent completion events
//! can re-run the advance logic without double dispatch.

use crate::connectors::{AnchorReceipt, Notification};
use crate::error::IKycError;
use crate::flow::Transition;
use crate::ledger::{AuditEvent, AuditKind, RotationReport};
use crate::storage::PersistentAuditLog;
use crate::policy::{decide, DecisionThresholds, PolicyDecision};
use crate::queue::{Priority, StageTask, TaskQueue};
use crate::stage::Stage;
use crate::store::{ScoreWrite, TicketStore};
use crate::types::{
    AnchorStatus, DecisionOutcome, KycStats, KycTier, ReviewSubmission, ReviewVerdict,
    SanctionsResult, StageScore, Submission, Ticket, TicketDecision, TicketFilter, TicketId,
    TicketStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Retention and sweep settings consumed by the maintenance operations.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub anchoring_enabled: bool,
    pub ticket_retention: Duration,
    pub audit_retention: Duration,
    pub purge_batch_size: usize,
    /// Processing tickets idle for longer than this are escalated.
    pub stall_after: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            anchoring_enabled: true,
            ticket_retention: Duration::days(1825),
            audit_retention: Duration::days(2555),
            purge_batch_size: 500,
            stall_after: Duration::hours(1),
        }
    }
}

/// Result payload of a successfully executed ticket stage.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Score(StageScore),
    Risk {
        score: StageScore,
        sanctions: SanctionsResult,
    },
    Anchored(AnchorReceipt),
    Notified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub examined: usize,
    pub purged: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn TicketStore>,
    queue: Arc<dyn TaskQueue>,
    audit: Arc<Mutex<PersistentAuditLog>>,
    thresholds: DecisionThresholds,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TicketStore>,
        queue: Arc<dyn TaskQueue>,
        thresholds: DecisionThresholds,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            audit: Arc::new(Mutex::new(PersistentAuditLog::in_memory())),
            thresholds,
            settings,
        }
    }

    pub fn store(&self) -> Arc<dyn TicketStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        self.queue.clone()
    }

    /// Replace the default in-memory audit log, typically with one restored
    /// by [`PersistentAuditLog::bootstrap`].
    pub fn with_audit_log(mut self, audit: PersistentAuditLog) -> Self {
        self.audit = Arc::new(Mutex::new(audit));
        self
    }

    pub fn audit_log(&self) -> Arc<Mutex<PersistentAuditLog>> {
        self.audit.clone()
    }

    pub fn thresholds(&self) -> &DecisionThresholds {
        &self.thresholds
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn audit(
        &self,
        ticket_id: Option<TicketId>,
        kind: AuditKind,
        action: &str,
        detail: impl Into<String>,
    ) -> Result<(), IKycError> {
        self.audit
            .lock()
            .await
            .append_event(ticket_id, kind, AuditEvent::new(action, detail))
            .await?;
        Ok(())
    }

    /// Claim and enqueue `stage` for the ticket. Returns `false` if another
    /// caller already dispatched it.
    async fn dispatch(
        &self,
        ticket_id: TicketId,
        stage: Stage,
        priority: Priority,
    ) -> Result<bool, IKycError> {
        if !self.store.mark_dispatched(ticket_id, stage).await? {
            tracing::debug!(ticket_id = %ticket_id, stage = %stage, "Stage already dispatched");
            return Ok(false);
        }
        if let Err(err) = self
            .queue
            .enqueue(StageTask::new(ticket_id, stage), priority)
            .await
        {
            // Release the claim so a later advance or sweep can dispatch again.
            if let Err(release) = self.store.clear_dispatched(ticket_id, stage).await {
                tracing::error!(
                    ticket_id = %ticket_id,
                    stage = %stage,
                    error = %release,
                    "Failed to release dispatch claim"
                );
            }
            tracing::warn!(ticket_id = %ticket_id, stage = %stage, error = %err, "Enqueue failed");
            return Err(err);
        }
        self.audit(
            Some(ticket_id),
            AuditKind::Dispatch,
            "dispatch",
            stage.name(),
        )
        .await?;
        tracing::debug!(ticket_id = %ticket_id, stage = %stage, "Stage dispatched");
        Ok(true)
    }

    /// Notifications follow a won transition, so they need no dispatch claim.
    async fn enqueue_notify(&self, ticket_id: TicketId) -> Result<(), IKycError> {
        self.queue
            .enqueue(StageTask::new(ticket_id, Stage::Notify), Priority::Normal)
            .await
    }

    // ---- submission boundary ----

    pub async fn submit(&self, submission: Submission) -> Result<TicketId, IKycError> {
        submission.validate()?;
        let key = submission.resolved_idempotency_key()?;
        let ticket = Ticket::new(key, submission, Utc::now());
        let tier = ticket.subject.requested_tier;

        let ticket_id = self.store.create(ticket).await?;
        self.audit(
            Some(ticket_id),
            AuditKind::Submission,
            "submitted",
            format!("requested_tier={}", tier.level()),
        )
        .await?;
        tracing::info!(ticket_id = %ticket_id, requested_tier = tier.level(), "Ticket submitted");

        self.dispatch(ticket_id, Stage::Ocr, Priority::Normal)
            .await?;
        Ok(ticket_id)
    }

    pub async fn get_status(&self, ticket_id: TicketId) -> Result<Ticket, IKycError> {
        self.store.get(ticket_id).await
    }

    pub async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, IKycError> {
        self.store.list(filter).await
    }

    // ---- review boundary ----

    pub async fn list_pending_review(&self) -> Result<Vec<Ticket>, IKycError> {
        self.store
            .list(&TicketFilter::with_status(TicketStatus::ManualReview))
            .await
    }

    pub async fn submit_review(&self, review: ReviewSubmission) -> Result<Ticket, IKycError> {
        let ticket_id = review.ticket_id;
        if review.reviewer_id.trim().is_empty() {
            return Err(IKycError::Validation("reviewer_id must not be empty".to_string()));
        }
        let outcome = match review.verdict {
            ReviewVerdict::Approve { tier } if tier == KycTier::ViewOnly => {
                return Err(IKycError::Validation(
                    "approved tier must be basic or full".to_string(),
                ));
            }
            ReviewVerdict::Approve { tier } => DecisionOutcome::Approved { tier },
            ReviewVerdict::Reject { reason } if reason.trim().is_empty() => {
                return Err(IKycError::Validation(
                    "rejection_reason must not be empty".to_string(),
                ));
            }
            ReviewVerdict::Reject { reason } => DecisionOutcome::Rejected { reason },
        };

        let current = self.store.get(ticket_id).await?;
        if current.status != TicketStatus::ManualReview {
            return Err(IKycError::invalid_state(
                ticket_id,
                format!("review requires 'manual_review', ticket is '{}'", current.status),
            ));
        }

        let decision = TicketDecision {
            outcome,
            reviewer_id: Some(review.reviewer_id.clone()),
            note: review.note,
            auto_decided: false,
        };
        let transition = Transition::decide(TicketStatus::ManualReview, decision);
        let ticket = match self.store.transition(ticket_id, &transition).await {
            Ok(ticket) => ticket,
            Err(IKycError::StaleTransition { actual, .. }) => {
                return Err(IKycError::invalid_state(
                    ticket_id,
                    format!("review lost to a concurrent decision, ticket is '{actual}'"),
                ));
            }
            Err(err) => return Err(err),
        };

        self.audit(
            Some(ticket_id),
            AuditKind::Review,
            "reviewed",
            format!("reviewer={} status={}", review.reviewer_id, ticket.status),
        )
        .await?;
        tracing::info!(
            ticket_id = %ticket_id,
            reviewer_id = %review.reviewer_id,
            status = %ticket.status,
            "Manual review recorded"
        );
        self.after_decision(&ticket).await?;
        Ok(ticket)
    }

    // ---- worker callbacks ----

    /// Called by a worker before it executes a ticket stage. Returns `false`
    /// when the stage result could no longer be used.
    pub async fn on_stage_started(&self, task: &StageTask) -> Result<bool, IKycError> {
        let Some(ticket_id) = task.ticket_id else {
            return Ok(true);
        };
        self.store
            .record_attempt(ticket_id, task.stage, task.attempt)
            .await?;
        let ticket = self.store.get(ticket_id).await?;

        if task.stage.is_pipeline() {
            if ticket.status.is_terminal() || ticket.purged_at.is_some() {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    stage = %task.stage,
                    status = %ticket.status,
                    "Skipping stage for closed ticket"
                );
                return Ok(false);
            }
            if ticket.status == TicketStatus::Pending {
                self.start_processing(ticket_id).await?;
            }
        }
        Ok(true)
    }

    async fn start_processing(&self, ticket_id: TicketId) -> Result<(), IKycError> {
        match self
            .store
            .transition(ticket_id, &Transition::start(TicketStatus::Pending))
            .await
        {
            Ok(_) => {
                self.audit(
                    Some(ticket_id),
                    AuditKind::Transition,
                    "transition",
                    "pending -> processing",
                )
                .await?;
                tracing::info!(ticket_id = %ticket_id, "Ticket processing started");
                Ok(())
            }
            Err(err) if err.is_stale() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn on_stage_completed(
        &self,
        ticket_id: TicketId,
        stage: Stage,
        output: StageOutput,
    ) -> Result<(), IKycError> {
        match output {
            StageOutput::Score(score) => {
                self.record(ticket_id, stage, score).await?;
                self.advance(ticket_id).await
            }
            StageOutput::Risk { score, sanctions } => {
                if sanctions.hit {
                    tracing::warn!(ticket_id = %ticket_id, "Sanctions list hit");
                }
                self.store.set_sanctions(ticket_id, sanctions).await?;
                self.record(ticket_id, Stage::Risk, score).await?;
                self.advance(ticket_id).await
            }
            StageOutput::Anchored(receipt) => {
                self.store
                    .set_anchor(
                        ticket_id,
                        AnchorStatus::Anchored {
                            tx_ref: receipt.tx_ref.clone(),
                            anchored_at: Utc::now(),
                        },
                    )
                    .await?;
                self.audit(
                    Some(ticket_id),
                    AuditKind::Anchor,
                    "anchored",
                    receipt.tx_ref.clone(),
                )
                .await?;
                tracing::info!(ticket_id = %ticket_id, tx_ref = %receipt.tx_ref, "Decision anchored");
                Ok(())
            }
            StageOutput::Notified => {
                tracing::debug!(ticket_id = %ticket_id, "Notification delivered");
                Ok(())
            }
        }
    }

    async fn record(
        &self,
        ticket_id: TicketId,
        stage: Stage,
        score: StageScore,
    ) -> Result<(), IKycError> {
        let value = score.value;
        match self.store.record_score(ticket_id, stage, score).await? {
            ScoreWrite::Recorded => {
                self.audit(
                    Some(ticket_id),
                    AuditKind::Score,
                    "score",
                    format!("{stage}={value:.4}"),
                )
                .await?;
                tracing::info!(ticket_id = %ticket_id, stage = %stage, score = value, "Stage score recorded");
            }
            ScoreWrite::AlreadyRecorded => {
                tracing::debug!(ticket_id = %ticket_id, stage = %stage, "Duplicate stage result ignored");
            }
            ScoreWrite::TicketClosed => {
                tracing::debug!(ticket_id = %ticket_id, stage = %stage, "Late stage result for closed ticket");
            }
        }
        Ok(())
    }

    /// Re-derive the next step from recorded scores. Safe to call repeatedly.
    async fn advance(&self, ticket_id: TicketId) -> Result<(), IKycError> {
        let ticket = self.store.get(ticket_id).await?;
        match ticket.status {
            TicketStatus::Pending => self.start_processing(ticket_id).await?,
            TicketStatus::Processing => {}
            _ => return Ok(()),
        }

        let has = |stage: Stage| ticket.score(stage).is_some();
        if has(Stage::Risk) {
            return self.finalize(&ticket).await;
        }
        if has(Stage::FaceMatch) && has(Stage::Liveness) {
            self.dispatch(ticket_id, Stage::Risk, Priority::Normal)
                .await?;
            return Ok(());
        }
        if has(Stage::Ocr) {
            // Fan out; each claim is independent.
            self.dispatch(ticket_id, Stage::FaceMatch, Priority::Normal)
                .await?;
            self.dispatch(ticket_id, Stage::Liveness, Priority::Normal)
                .await?;
        }
        Ok(())
    }

    async fn finalize(&self, ticket: &Ticket) -> Result<(), IKycError> {
        let ticket_id = ticket.ticket_id;
        let score = |stage: Stage| ticket.score_value(stage).unwrap_or(0.0);
        let (risk, face, liveness) = (
            score(Stage::Risk),
            score(Stage::FaceMatch),
            score(Stage::Liveness),
        );

        let transition = match decide(risk, face, liveness, &self.thresholds) {
            PolicyDecision::Approve => {
                let tier = self
                    .thresholds
                    .auto_approved_tier(ticket.subject.requested_tier);
                Transition::decide(
                    TicketStatus::Processing,
                    TicketDecision::automatic(DecisionOutcome::Approved { tier }),
                )
            }
            PolicyDecision::Reject { reason } => Transition::decide(
                TicketStatus::Processing,
                TicketDecision::automatic(DecisionOutcome::Rejected { reason }),
            ),
            PolicyDecision::ManualReview(reason) => {
                Transition::escalate(TicketStatus::Processing, reason.note())
            }
        };

        let decided = match self.store.transition(ticket_id, &transition).await {
            Ok(ticket) => ticket,
            Err(err) if err.is_stale() => {
                tracing::debug!(ticket_id = %ticket_id, error = %err, "Decision already applied");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.audit(
            Some(ticket_id),
            AuditKind::Transition,
            "decision",
            format!(
                "processing -> {} risk={risk:.4} face={face:.4} liveness={liveness:.4}",
                decided.status
            ),
        )
        .await?;
        tracing::info!(
            ticket_id = %ticket_id,
            status = %decided.status,
            risk_score = risk,
            face_score = face,
            liveness_score = liveness,
            "Ticket decided"
        );
        self.after_decision(&decided).await
    }

    /// Side effects of a won transition: anchor approvals, notify always.
    async fn after_decision(&self, ticket: &Ticket) -> Result<(), IKycError> {
        if ticket.status == TicketStatus::Approved && self.settings.anchoring_enabled {
            self.store
                .set_anchor(ticket.ticket_id, AnchorStatus::Pending)
                .await?;
            self.dispatch(ticket.ticket_id, Stage::Anchor, Priority::Low)
                .await?;
        }
        self.enqueue_notify(ticket.ticket_id).await
    }

    /// Retry budget exhausted or a non-retryable failure: resolve the ticket
    /// to a human-visible state instead of leaving it stuck.
    pub async fn on_stage_failed_permanently(
        &self,
        task: &StageTask,
        error: &IKycError,
    ) -> Result<(), IKycError> {
        self.audit(
            task.ticket_id,
            AuditKind::DeadLetter,
            "dead_letter",
            format!("{} attempt={} error={error}", task.stage, task.attempt),
        )
        .await?;

        let Some(ticket_id) = task.ticket_id else {
            tracing::error!(stage = %task.stage, error = %error, "Maintenance task failed permanently");
            return Ok(());
        };

        match task.stage {
            Stage::Anchor => {
                self.store
                    .set_anchor(
                        ticket_id,
                        AnchorStatus::Failed {
                            reason: error.to_string(),
                        },
                    )
                    .await?;
                tracing::warn!(ticket_id = %ticket_id, error = %error, "Anchoring failed, decision stands");
                Ok(())
            }
            Stage::Notify => {
                tracing::warn!(ticket_id = %ticket_id, error = %error, "Notification dropped");
                Ok(())
            }
            stage => {
                let note = format!(
                    "{stage} failed after {} attempt(s): {error}",
                    task.attempt
                );
                self.escalate(ticket_id, note).await
            }
        }
    }

    /// Move a pending or processing ticket to manual review with a system note.
    async fn escalate(&self, ticket_id: TicketId, note: String) -> Result<(), IKycError> {
        let ticket = self.store.get(ticket_id).await?;
        if ticket.status == TicketStatus::Pending {
            self.start_processing(ticket_id).await?;
        } else if ticket.status != TicketStatus::Processing {
            tracing::debug!(ticket_id = %ticket_id, status = %ticket.status, "Escalation not needed");
            return Ok(());
        }

        match self
            .store
            .transition(
                ticket_id,
                &Transition::escalate(TicketStatus::Processing, note.clone()),
            )
            .await
        {
            Ok(escalated) => {
                self.audit(Some(ticket_id), AuditKind::Transition, "escalated", note.clone())
                    .await?;
                tracing::error!(ticket_id = %ticket_id, note = %note, "Ticket escalated to manual review");
                self.after_decision(&escalated).await
            }
            Err(err) if err.is_stale() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Operator re-anchor of an approved ticket whose anchoring failed.
    pub async fn reanchor(&self, ticket_id: TicketId) -> Result<(), IKycError> {
        let ticket = self.store.get(ticket_id).await?;
        if ticket.status != TicketStatus::Approved {
            return Err(IKycError::invalid_state(
                ticket_id,
                "only approved tickets are anchored",
            ));
        }
        if !matches!(ticket.anchor, Some(AnchorStatus::Failed { .. }) | None) {
            return Err(IKycError::invalid_state(
                ticket_id,
                "anchoring is pending or already complete",
            ));
        }

        self.store.clear_dispatched(ticket_id, Stage::Anchor).await?;
        self.store
            .set_anchor(ticket_id, AnchorStatus::Pending)
            .await?;
        self.dispatch(ticket_id, Stage::Anchor, Priority::Normal)
            .await?;
        self.audit(Some(ticket_id), AuditKind::Anchor, "reanchor", "requested")
            .await?;
        tracing::info!(ticket_id = %ticket_id, "Re-anchoring requested");
        Ok(())
    }

    /// Snapshot used by the notify stage.
    pub fn notification_for(ticket: &Ticket) -> Notification {
        Notification {
            ticket_id: ticket.ticket_id,
            status: ticket.status,
            tier: ticket.approved_tier(),
            reason: ticket.rejection_reason().map(str::to_string),
            note: ticket
                .decision
                .as_ref()
                .and_then(|decision| decision.note.clone())
                .or_else(|| ticket.escalation_note.clone()),
            scores: ticket
                .scores
                .iter()
                .map(|(stage, score)| (*stage, score.value))
                .collect(),
            email: ticket.subject.email.clone(),
            phone: ticket.subject.phone.clone(),
            issued_at: Utc::now(),
        }
    }

    // ---- maintenance ----

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, IKycError> {
        let cutoff = now - self.settings.ticket_retention;
        let candidates = self
            .store
            .list_purgeable(cutoff, self.settings.purge_batch_size)
            .await?;

        let mut report = PurgeReport {
            examined: candidates.len(),
            purged: 0,
        };
        for ticket_id in candidates {
            if self.store.purge(ticket_id, now).await? {
                report.purged += 1;
                self.audit(Some(ticket_id), AuditKind::Maintenance, "purged", "retention window elapsed")
                    .await?;
            }
        }

        self.audit(
            None,
            AuditKind::Maintenance,
            "retention_purge",
            format!("examined={} purged={}", report.examined, report.purged),
        )
        .await?;
        tracing::info!(examined = report.examined, purged = report.purged, "Retention purge finished");
        Ok(report)
    }

    pub async fn rotate_audit_log(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationReport>, IKycError> {
        let cutoff = now - self.settings.audit_retention;
        let mut audit = self.audit.lock().await;
        let report = audit.rotate(cutoff).await?.map(|segment| segment.report());
        let detail = match &report {
            Some(r) => format!(
                "segment={} entries={} range={}..={}",
                r.segment_id, r.archived_entries, r.first_index, r.last_index
            ),
            None => "nothing to rotate".to_string(),
        };
        audit
            .append_event(
                None,
                AuditKind::Maintenance,
                AuditEvent::new("audit_rotation", detail),
            )
            .await?;
        tracing::info!(
            archived = report.as_ref().map(|r| r.archived_entries).unwrap_or(0),
            "Audit log rotation finished"
        );
        Ok(report)
    }

    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> Result<usize, IKycError> {
        let idle_since = now - self.settings.stall_after;
        let stalled = self.store.list_stalled(idle_since).await?;
        let mut escalated = 0;
        for ticket_id in stalled {
            let before = self.store.get(ticket_id).await?.status;
            self.escalate(
                ticket_id,
                format!("no pipeline progress since {}", idle_since.to_rfc3339()),
            )
            .await?;
            if matches!(before, TicketStatus::Pending | TicketStatus::Processing)
                && self.store.get(ticket_id).await?.status == TicketStatus::ManualReview
            {
                escalated += 1;
            }
        }
        self.audit(
            None,
            AuditKind::Maintenance,
            "stalled_sweep",
            format!("escalated={escalated}"),
        )
        .await?;
        if escalated > 0 {
            tracing::warn!(escalated, "Stalled tickets escalated");
        }
        Ok(escalated)
    }

    // ---- reporting ----

    pub async fn stats(&self, window_days: i64) -> Result<KycStats, IKycError> {
        let since = Utc::now() - Duration::days(window_days);
        let tickets = self.store.list(&TicketFilter::default()).await?;
        Ok(compute_stats(
            window_days,
            tickets.iter().filter(|t| t.submitted_at >= since),
        ))
    }
}

fn compute_stats<'a>(window_days: i64, tickets: impl Iterator<Item = &'a Ticket>) -> KycStats {
    let mut stats = KycStats {
        window_days,
        ..KycStats::default()
    };
    let (mut face, mut liveness, mut risk) = (Vec::new(), Vec::new(), Vec::new());
    let (mut approved, mut decided) = (0usize, 0usize);

    for ticket in tickets {
        stats.total_submissions += 1;
        *stats.by_status.entry(ticket.status).or_insert(0) += 1;

        if let Some(decision) = &ticket.decision {
            decided += 1;
            if decision.auto_decided {
                if ticket.status == TicketStatus::Approved {
                    stats.auto_approved += 1;
                }
            } else {
                stats.manually_reviewed += 1;
            }
        }
        if let Some(tier) = ticket.approved_tier() {
            approved += 1;
            *stats.by_tier.entry(tier).or_insert(0) += 1;
        }

        face.extend(ticket.score_value(Stage::FaceMatch));
        liveness.extend(ticket.score_value(Stage::Liveness));
        risk.extend(ticket.score_value(Stage::Risk));
    }

    let mean = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };
    stats.avg_face_score = mean(&face);
    stats.avg_liveness_score = mean(&liveness);
    stats.avg_risk_score = mean(&risk);
    stats.approval_rate = if decided == 0 {
        0.0
    } else {
        approved as f64 / decided as f64
    };
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DeadLetter, Delivery, InMemoryTaskQueue, QueueDepth, Requeue};
    use crate::stage::WorkerGroup;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tokio::sync::watch;
    use crate::store::InMemoryTicketStore;
    use crate::types::{DocumentRefs, SubjectFields};

    fn submission(name: &str) -> Submission {
        Submission::new(
            SubjectFields::new(name, "1990-01-01", "1 Main St", KycTier::Full),
            DocumentRefs::new("front", "back", "selfie"),
        )
    }

    fn orchestrator() -> (Orchestrator, Arc<InMemoryTaskQueue>) {
        let queue = Arc::new(InMemoryTaskQueue::default());
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryTicketStore::new()),
            queue.clone(),
            DecisionThresholds::default(),
            OrchestratorSettings::default(),
        );
        (orchestrator, queue)
    }

    async fn complete(orchestrator: &Orchestrator, id: TicketId, stage: Stage, value: f64) {
        orchestrator
            .on_stage_started(&StageTask::new(id, stage))
            .await
            .unwrap();
        let output = if stage == Stage::Risk {
            StageOutput::Risk {
                score: StageScore::new(value, 1.0),
                sanctions: SanctionsResult::clear(),
            }
        } else {
            StageOutput::Score(StageScore::new(value, 0.9))
        };
        orchestrator
            .on_stage_completed(id, stage, output)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn submit_enqueues_ocr_and_stays_pending() {
        let (orchestrator, queue) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();

        assert_eq!(
            orchestrator.get_status(id).await.unwrap().status,
            TicketStatus::Pending
        );
        let delivery = queue.try_dequeue(WorkerGroup::Ocr).await.unwrap().unwrap();
        assert_eq!(delivery.task.ticket_id, Some(id));
        assert_eq!(delivery.task.stage, Stage::Ocr);
    }

    #[tokio::test]
    async fn replayed_submission_is_rejected() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        match orchestrator.submit(submission("Jane")).await {
            Err(IKycError::DuplicateSubmission { existing }) => assert_eq!(existing, id),
            other => panic!("expected duplicate submission, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fan_in_waits_for_both_biometrics() {
        let (orchestrator, queue) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        complete(&orchestrator, id, Stage::Ocr, 0.9).await;

        assert_eq!(queue.depth(WorkerGroup::Biometrics).await.unwrap().ready, 2);
        complete(&orchestrator, id, Stage::FaceMatch, 0.9).await;
        assert_eq!(queue.depth(WorkerGroup::Risk).await.unwrap().ready, 0);
        complete(&orchestrator, id, Stage::Liveness, 0.9).await;
        assert_eq!(queue.depth(WorkerGroup::Risk).await.unwrap().ready, 1);

        // Replaying a completion must not dispatch risk twice.
        complete(&orchestrator, id, Stage::Liveness, 0.1).await;
        assert_eq!(queue.depth(WorkerGroup::Risk).await.unwrap().ready, 1);
        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.score_value(Stage::Liveness), Some(0.9));
    }

    #[tokio::test]
    async fn approval_enqueues_anchor_and_notify() {
        let (orchestrator, queue) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        for stage in Stage::PIPELINE {
            complete(&orchestrator, id, stage, 0.9).await;
        }

        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Approved);
        assert_eq!(ticket.approved_tier(), Some(KycTier::Full));
        assert_eq!(ticket.anchor, Some(AnchorStatus::Pending));
        assert_eq!(queue.depth(WorkerGroup::Blockchain).await.unwrap().ready, 1);
        assert_eq!(queue.depth(WorkerGroup::Notification).await.unwrap().ready, 1);
        assert!(orchestrator.audit_log().lock().await.verify_chain());
    }

    #[tokio::test]
    async fn rotation_evicts_sealed_entries_from_the_live_log() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        let before = orchestrator.audit_log().lock().await.len();
        assert!(before > 0);

        let later = Utc::now() + orchestrator.settings().audit_retention + Duration::seconds(1);
        let report = orchestrator
            .rotate_audit_log(later)
            .await
            .unwrap()
            .expect("entries sealed");
        assert_eq!(report.archived_entries, before);
        assert_eq!(report.first_index, 0);

        let audit = orchestrator.audit_log();
        let audit = audit.lock().await;
        assert_eq!(audit.entries_for(id).count(), 0);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit.entries()[0].index, report.last_index + 1);
        assert_eq!(
            audit.checkpoint().map(|c| c.segment_id.as_str()),
            Some(report.segment_id.as_str())
        );
        assert!(audit.verify_chain());
    }

    #[tokio::test]
    async fn review_is_only_valid_from_manual_review() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        let err = orchestrator
            .submit_review(ReviewSubmission::approve(id, "rev-1", KycTier::Basic))
            .await
            .unwrap_err();
        assert!(matches!(err, IKycError::InvalidState { .. }));

        let err = orchestrator
            .submit_review(ReviewSubmission::approve(TicketId::new(), "rev-1", KycTier::Basic))
            .await
            .unwrap_err();
        assert!(matches!(err, IKycError::NotFound(_)));
    }

    #[tokio::test]
    async fn permanent_failure_escalates_pending_ticket() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        let mut task = StageTask::new(id, Stage::Ocr);
        task.attempt = 3;
        orchestrator
            .on_stage_failed_permanently(&task, &IKycError::adapter(Stage::Ocr, "model offline"))
            .await
            .unwrap();

        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::ManualReview);
        let note = ticket.escalation_note.unwrap();
        assert!(note.contains("ocr failed after 3 attempt(s)"), "{note}");
    }

    #[tokio::test]
    async fn anchor_failure_keeps_decision() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        for stage in Stage::PIPELINE {
            complete(&orchestrator, id, stage, 0.95).await;
        }
        orchestrator
            .on_stage_failed_permanently(
                &StageTask::new(id, Stage::Anchor),
                &IKycError::AnchorRejected("nonce too low".to_string()),
            )
            .await
            .unwrap();

        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Approved);
        assert!(matches!(ticket.anchor, Some(AnchorStatus::Failed { .. })));

        orchestrator.reanchor(id).await.unwrap();
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().anchor,
            Some(AnchorStatus::Pending)
        );
        assert!(orchestrator.reanchor(id).await.is_err());
    }

    #[tokio::test]
    async fn purge_skips_open_tickets() {
        let (orchestrator, _) = orchestrator();
        let done = orchestrator.submit(submission("Jane")).await.unwrap();
        for stage in Stage::PIPELINE {
            let value = if stage == Stage::Risk { 0.2 } else { 0.9 };
            complete(&orchestrator, done, stage, value).await;
        }
        assert_eq!(
            orchestrator.get_status(done).await.unwrap().status,
            TicketStatus::Rejected
        );
        let open = orchestrator.submit(submission("John")).await.unwrap();

        let far_future = Utc::now() + Duration::days(4000);
        let report = orchestrator.purge_expired(far_future).await.unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(
            orchestrator.get_status(done).await.unwrap().subject.full_name,
            crate::store::PURGED_MARKER
        );
        assert_eq!(orchestrator.get_status(open).await.unwrap().subject.full_name, "John");
    }

    #[tokio::test]
    async fn stalled_processing_ticket_is_escalated() {
        let (orchestrator, _) = orchestrator();
        let id = orchestrator.submit(submission("Jane")).await.unwrap();
        complete(&orchestrator, id, Stage::Ocr, 0.9).await;

        assert_eq!(orchestrator.sweep_stalled(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(orchestrator.sweep_stalled(later).await.unwrap(), 1);
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().status,
            TicketStatus::ManualReview
        );
    }

    /// Queue whose broker can be switched off.
    struct SwitchableQueue {
        inner: InMemoryTaskQueue,
        down: AtomicBool,
    }

    impl SwitchableQueue {
        fn check(&self) -> Result<(), IKycError> {
            if self.down.load(AtomicOrdering::SeqCst) {
                return Err(IKycError::Queue("broker unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TaskQueue for SwitchableQueue {
        async fn enqueue(&self, task: StageTask, priority: Priority) -> Result<(), IKycError> {
            self.check()?;
            self.inner.enqueue(task, priority).await
        }

        async fn dequeue(
            &self,
            group: WorkerGroup,
            shutdown: &mut watch::Receiver<bool>,
        ) -> Result<Option<Delivery>, IKycError> {
            self.inner.dequeue(group, shutdown).await
        }

        async fn try_dequeue(&self, group: WorkerGroup) -> Result<Option<Delivery>, IKycError> {
            self.inner.try_dequeue(group).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<bool, IKycError> {
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: &Delivery, requeue: Requeue) -> Result<bool, IKycError> {
            self.inner.nack(delivery, requeue).await
        }

        async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<bool, IKycError> {
            self.inner.dead_letter(delivery, reason).await
        }

        async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IKycError> {
            self.inner.dead_letters().await
        }

        async fn take_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, IKycError> {
            self.inner.take_dead_letters(limit).await
        }

        async fn depth(&self, group: WorkerGroup) -> Result<QueueDepth, IKycError> {
            self.inner.depth(group).await
        }

        async fn next_due(&self, group: WorkerGroup) -> Result<Option<std::time::Duration>, IKycError> {
            self.inner.next_due(group).await
        }
    }

    #[tokio::test]
    async fn failed_enqueue_releases_claim_and_sweep_recovers_pending_ticket() {
        let queue = Arc::new(SwitchableQueue {
            inner: InMemoryTaskQueue::default(),
            down: AtomicBool::new(true),
        });
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryTicketStore::new()),
            queue.clone(),
            DecisionThresholds::default(),
            OrchestratorSettings::default(),
        );

        let first = orchestrator.submit(submission("Jane")).await;
        assert!(matches!(first, Err(IKycError::Queue(_))));
        let id = match orchestrator.submit(submission("Jane")).await {
            Err(IKycError::DuplicateSubmission { existing }) => existing,
            other => panic!("expected duplicate submission, got {other:?}"),
        };
        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert!(ticket.dispatched.is_empty());

        queue.down.store(false, AtomicOrdering::SeqCst);
        assert_eq!(orchestrator.sweep_stalled(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(orchestrator.sweep_stalled(later).await.unwrap(), 1);

        let ticket = orchestrator.get_status(id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::ManualReview);
        assert!(ticket
            .escalation_note
            .unwrap_or_default()
            .starts_with("no pipeline progress"));
        let notify = queue
            .try_dequeue(WorkerGroup::Notification)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notify.task.ticket_id, Some(id));
    }

    #[tokio::test]
    async fn stats_summarize_outcomes() {
        let (orchestrator, _) = orchestrator();
        let approved = orchestrator.submit(submission("A")).await.unwrap();
        let rejected = orchestrator.submit(submission("B")).await.unwrap();
        for stage in Stage::PIPELINE {
            complete(&orchestrator, approved, stage, 0.9).await;
        }
        for (stage, value) in [
            (Stage::Ocr, 0.9),
            (Stage::FaceMatch, 0.9),
            (Stage::Liveness, 0.9),
            (Stage::Risk, 0.3),
        ] {
            complete(&orchestrator, rejected, stage, value).await;
        }
        orchestrator.submit(submission("C")).await.unwrap();

        let stats = orchestrator.stats(30).await.unwrap();
        assert_eq!(stats.total_submissions, 3);
        assert_eq!(stats.auto_approved, 1);
        assert_eq!(stats.by_status.get(&TicketStatus::Rejected), Some(&1));
        assert_eq!(stats.by_tier.get(&KycTier::Full), Some(&1));
        assert!((stats.approval_rate - 0.5).abs() < 1e-9);
        assert!((stats.avg_face_score - 0.9).abs() < 1e-9);
    }
}
