//! Ticket store contract and the in-memory implementation.

use crate::error::IKycError;
use crate::flow::Transition;
use crate::stage::Stage;
use crate::types::{
    AnchorStatus, SanctionsResult, StageScore, Ticket, TicketFilter, TicketId, TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Placeholder written over personal fields by the retention purge.
pub const PURGED_MARKER: &str = "DELETED";

pub type StoreResult<T> = Result<T, IKycError>;

/// Outcome of an append-only score write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreWrite {
    Recorded,
    /// The stage already has a score; the stored value was kept.
    AlreadyRecorded,
    /// The ticket is terminal; late results are dropped.
    TicketClosed,
}

/// Single source of truth for tickets. Every write is atomic per ticket.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a new ticket. Replaying an idempotency key fails with
    /// `DuplicateSubmission` carrying the original ticket id.
    async fn create(&self, ticket: Ticket) -> StoreResult<TicketId>;

    async fn get(&self, id: TicketId) -> StoreResult<Ticket>;

    /// Write a stage score exactly once. Never overwrites, never fails on replay.
    async fn record_score(
        &self,
        id: TicketId,
        stage: Stage,
        score: StageScore,
    ) -> StoreResult<ScoreWrite>;

    /// Raise the stage attempt counter to `attempt` (monotonic).
    async fn record_attempt(&self, id: TicketId, stage: Stage, attempt: u32) -> StoreResult<()>;

    /// Compare-and-set on status. Losers get `StaleTransition`.
    async fn transition(&self, id: TicketId, transition: &Transition) -> StoreResult<Ticket>;

    /// Claim the right to enqueue `stage` for this ticket. Returns `true` for
    /// exactly one caller per (ticket, stage).
    async fn mark_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<bool>;

    /// Release a dispatch claim so the stage can be enqueued again.
    async fn clear_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<()>;

    /// First sanctions result wins.
    async fn set_sanctions(&self, id: TicketId, sanctions: SanctionsResult) -> StoreResult<()>;

    async fn set_anchor(&self, id: TicketId, anchor: AnchorStatus) -> StoreResult<()>;

    /// Tickets matching the filter, newest submission first.
    async fn list(&self, filter: &TicketFilter) -> StoreResult<Vec<Ticket>>;

    /// Terminal, not yet purged tickets decided before `decided_before`.
    async fn list_purgeable(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TicketId>>;

    /// Anonymise a terminal ticket. Returns `false` if it was not eligible.
    async fn purge(&self, id: TicketId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Pending or processing tickets with no recorded progress since
    /// `idle_since`.
    async fn list_stalled(&self, idle_since: DateTime<Utc>) -> StoreResult<Vec<TicketId>>;
}

/// Score write rule shared by every backend.
pub(crate) fn apply_score(
    ticket: &mut Ticket,
    stage: Stage,
    score: StageScore,
    now: DateTime<Utc>,
) -> ScoreWrite {
    if ticket.status.is_terminal() || ticket.purged_at.is_some() {
        return ScoreWrite::TicketClosed;
    }
    if ticket.scores.contains_key(&stage) {
        return ScoreWrite::AlreadyRecorded;
    }
    ticket.scores.insert(stage, score);
    ticket.updated_at = now;
    ScoreWrite::Recorded
}

/// Overwrite personal data in place, keeping the decision and scores.
pub(crate) fn anonymize(ticket: &mut Ticket, now: DateTime<Utc>) -> bool {
    if !ticket.status.is_terminal() || ticket.purged_at.is_some() {
        return false;
    }
    let subject = &mut ticket.subject;
    subject.full_name = PURGED_MARKER.to_string();
    subject.date_of_birth = PURGED_MARKER.to_string();
    subject.address = PURGED_MARKER.to_string();
    subject.email = None;
    subject.phone = None;

    ticket.documents.front_id.clear();
    ticket.documents.back_id.clear();
    ticket.documents.selfie.clear();

    for score in ticket.scores.values_mut() {
        score.extracted_fields = None;
    }
    ticket.purged_at = Some(now);
    ticket.updated_at = now;
    true
}

pub(crate) fn newest_first(tickets: &mut [Ticket]) {
    tickets.sort_by(|a, b| {
        b.submitted_at
            .cmp(&a.submitted_at)
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    });
}

pub(crate) fn page(tickets: Vec<Ticket>, filter: &TicketFilter) -> Vec<Ticket> {
    let iter = tickets.into_iter().skip(filter.offset);
    match filter.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

#[derive(Debug, Default)]
struct StoreState {
    tickets: HashMap<TicketId, Ticket>,
    by_key: HashMap<String, TicketId>,
}

impl StoreState {
    fn ticket_mut(&mut self, id: TicketId) -> StoreResult<&mut Ticket> {
        self.tickets.get_mut(&id).ok_or(IKycError::NotFound(id))
    }
}

/// In-memory ticket store for development and testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTicketStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tickets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn create(&self, ticket: Ticket) -> StoreResult<TicketId> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.by_key.get(&ticket.idempotency_key) {
            return Err(IKycError::DuplicateSubmission {
                existing: *existing,
            });
        }
        let id = ticket.ticket_id;
        state.by_key.insert(ticket.idempotency_key.clone(), id);
        state.tickets.insert(id, ticket);
        Ok(id)
    }

    async fn get(&self, id: TicketId) -> StoreResult<Ticket> {
        let state = self.state.read().await;
        state.tickets.get(&id).cloned().ok_or(IKycError::NotFound(id))
    }

    async fn record_score(
        &self,
        id: TicketId,
        stage: Stage,
        score: StageScore,
    ) -> StoreResult<ScoreWrite> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        Ok(apply_score(ticket, stage, score, Utc::now()))
    }

    async fn record_attempt(&self, id: TicketId, stage: Stage, attempt: u32) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        let counter = ticket.attempt_counts.entry(stage).or_insert(0);
        *counter = (*counter).max(attempt);
        Ok(())
    }

    async fn transition(&self, id: TicketId, transition: &Transition) -> StoreResult<Ticket> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        transition.apply(ticket, Utc::now())?;
        Ok(ticket.clone())
    }

    async fn mark_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        let claimed = ticket.dispatched.insert(stage);
        if claimed {
            ticket.updated_at = Utc::now();
        }
        Ok(claimed)
    }

    async fn clear_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.ticket_mut(id)?.dispatched.remove(&stage);
        Ok(())
    }

    async fn set_sanctions(&self, id: TicketId, sanctions: SanctionsResult) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        if ticket.sanctions.is_none() {
            ticket.sanctions = Some(sanctions);
        }
        Ok(())
    }

    async fn set_anchor(&self, id: TicketId, anchor: AnchorStatus) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        ticket.anchor = Some(anchor);
        Ok(())
    }

    async fn list(&self, filter: &TicketFilter) -> StoreResult<Vec<Ticket>> {
        let state = self.state.read().await;
        let mut tickets = state
            .tickets
            .values()
            .filter(|ticket| filter.matches(ticket))
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut tickets);
        Ok(page(tickets, filter))
    }

    async fn list_purgeable(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TicketId>> {
        let state = self.state.read().await;
        let mut eligible = state
            .tickets
            .values()
            .filter(|t| t.status.is_terminal() && t.purged_at.is_none())
            .filter_map(|t| {
                t.decided_at
                    .filter(|at| *at < decided_before)
                    .map(|at| (at, t.ticket_id))
            })
            .collect::<Vec<_>>();
        eligible.sort();
        Ok(eligible.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn purge(&self, id: TicketId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let ticket = state.ticket_mut(id)?;
        Ok(anonymize(ticket, now))
    }

    async fn list_stalled(&self, idle_since: DateTime<Utc>) -> StoreResult<Vec<TicketId>> {
        let state = self.state.read().await;
        Ok(state
            .tickets
            .values()
            .filter(|t| matches!(t.status, TicketStatus::Pending | TicketStatus::Processing))
            .filter(|t| t.updated_at < idle_since)
            .map(|t| t.ticket_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DecisionOutcome, DocumentRefs, KycTier, SubjectFields, Submission, TicketDecision,
    };
    use chrono::Duration;

    fn ticket(key: &str) -> Ticket {
        let submission = Submission::new(
            SubjectFields::new("Grace Hopper", "1906-12-09", "Arlington", KycTier::Full)
                .with_contact(Some("grace@example.com".to_string()), None),
            DocumentRefs::new("front", "back", "selfie"),
        );
        Ticket::new(key.to_string(), submission, Utc::now())
    }

    async fn approved(store: &InMemoryTicketStore, key: &str) -> TicketId {
        let id = store.create(ticket(key)).await.unwrap();
        store
            .transition(id, &Transition::start(TicketStatus::Pending))
            .await
            .unwrap();
        store
            .transition(
                id,
                &Transition::decide(
                    TicketStatus::Processing,
                    TicketDecision::automatic(DecisionOutcome::Approved {
                        tier: KycTier::Full,
                    }),
                ),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn duplicate_key_returns_original_id() {
        let store = InMemoryTicketStore::new();
        let first = store.create(ticket("k1")).await.unwrap();
        match store.create(ticket("k1")).await {
            Err(IKycError::DuplicateSubmission { existing }) => assert_eq!(existing, first),
            other => panic!("expected duplicate submission, got {other:?}"),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn scores_are_written_once() {
        let store = InMemoryTicketStore::new();
        let id = store.create(ticket("k1")).await.unwrap();

        let first = store
            .record_score(id, Stage::Ocr, StageScore::new(0.9, 0.8))
            .await
            .unwrap();
        let replay = store
            .record_score(id, Stage::Ocr, StageScore::new(0.1, 0.1))
            .await
            .unwrap();

        assert_eq!(first, ScoreWrite::Recorded);
        assert_eq!(replay, ScoreWrite::AlreadyRecorded);
        assert_eq!(store.get(id).await.unwrap().score_value(Stage::Ocr), Some(0.9));
    }

    #[tokio::test]
    async fn concurrent_transitions_have_one_winner() {
        let store = InMemoryTicketStore::new();
        let id = store.create(ticket("k1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(id, &Transition::start(TicketStatus::Pending))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(err) => assert!(err.is_stale()),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn dispatch_claim_is_exclusive() {
        let store = InMemoryTicketStore::new();
        let id = store.create(ticket("k1")).await.unwrap();
        assert!(store.mark_dispatched(id, Stage::Risk).await.unwrap());
        assert!(!store.mark_dispatched(id, Stage::Risk).await.unwrap());
        store.clear_dispatched(id, Stage::Risk).await.unwrap();
        assert!(store.mark_dispatched(id, Stage::Risk).await.unwrap());
    }

    #[tokio::test]
    async fn late_scores_on_terminal_tickets_are_dropped() {
        let store = InMemoryTicketStore::new();
        let id = approved(&store, "k1").await;
        let write = store
            .record_score(id, Stage::Liveness, StageScore::new(0.2, 0.2))
            .await
            .unwrap();
        assert_eq!(write, ScoreWrite::TicketClosed);
    }

    #[tokio::test]
    async fn purge_only_touches_aged_terminal_tickets() {
        let store = InMemoryTicketStore::new();
        let done = approved(&store, "k1").await;
        let open = store.create(ticket("k2")).await.unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let eligible = store.list_purgeable(cutoff, 10).await.unwrap();
        assert_eq!(eligible, vec![done]);

        assert!(store.purge(done, Utc::now()).await.unwrap());
        assert!(!store.purge(done, Utc::now()).await.unwrap());
        assert!(!store.purge(open, Utc::now()).await.unwrap());

        let purged = store.get(done).await.unwrap();
        assert_eq!(purged.subject.full_name, PURGED_MARKER);
        assert!(purged.subject.email.is_none());
        assert!(purged.documents.selfie.is_empty());
        assert_eq!(purged.status, TicketStatus::Approved);
        assert!(store.list_purgeable(cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_newest_first_with_paging() {
        let store = InMemoryTicketStore::new();
        let mut older = ticket("k1");
        older.submitted_at = Utc::now() - Duration::hours(1);
        let older_id = store.create(older).await.unwrap();
        let newer_id = store.create(ticket("k2")).await.unwrap();

        let all = store.list(&TicketFilter::default()).await.unwrap();
        let ids = all.iter().map(|t| t.ticket_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![newer_id, older_id]);

        let second = store
            .list(&TicketFilter {
                offset: 1,
                limit: Some(1),
                ..TicketFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].ticket_id, older_id);
    }
}
