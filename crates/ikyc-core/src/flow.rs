use crate::error::IKycError;
use crate::types::{Ticket, TicketDecision, TicketStatus};
use chrono::{DateTime, Utc};

impl TicketStatus {
    /// Edges of the ticket lifecycle:
    /// pending -> processing -> {manual_review, approved, rejected},
    /// manual_review -> {approved, rejected}.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, ManualReview)
                | (Processing, Approved)
                | (Processing, Rejected)
                | (ManualReview, Approved)
                | (ManualReview, Rejected)
        )
    }
}

/// A requested status change, applied under compare-and-set on `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub expected: TicketStatus,
    pub next: TicketStatus,
    pub decision: Option<TicketDecision>,
    pub escalation_note: Option<String>,
}

impl Transition {
    pub fn start(expected: TicketStatus) -> Self {
        Self {
            expected,
            next: TicketStatus::Processing,
            decision: None,
            escalation_note: None,
        }
    }

    pub fn escalate(expected: TicketStatus, note: impl Into<String>) -> Self {
        Self {
            expected,
            next: TicketStatus::ManualReview,
            decision: None,
            escalation_note: Some(note.into()),
        }
    }

    pub fn decide(expected: TicketStatus, decision: TicketDecision) -> Self {
        Self {
            expected,
            next: decision.status(),
            decision: Some(decision),
            escalation_note: None,
        }
    }

    /// Checks the edge and the decision payload, independent of any ticket.
    pub fn validate(&self, ticket: &Ticket) -> Result<(), IKycError> {
        if !self.expected.can_transition_to(self.next) {
            return Err(IKycError::invalid_state(
                ticket.ticket_id,
                format!("no transition from '{}' to '{}'", self.expected, self.next),
            ));
        }
        match (&self.decision, self.next.is_terminal()) {
            (Some(decision), true) if decision.status() == self.next => Ok(()),
            (None, false) => Ok(()),
            _ => Err(IKycError::invalid_state(
                ticket.ticket_id,
                format!("decision payload does not match target '{}'", self.next),
            )),
        }
    }

    /// Compare-and-set against the ticket's current status, then mutate it.
    ///
    /// Stores call this while holding the single-ticket write lock (or inside
    /// the row-level transaction), so the check and the write are atomic.
    pub fn apply(&self, ticket: &mut Ticket, now: DateTime<Utc>) -> Result<(), IKycError> {
        if ticket.status != self.expected {
            return Err(IKycError::StaleTransition {
                ticket_id: ticket.ticket_id,
                expected: self.expected,
                actual: ticket.status,
            });
        }
        self.validate(ticket)?;

        ticket.status = self.next;
        ticket.updated_at = now;
        if let Some(note) = &self.escalation_note {
            ticket.escalation_note = Some(note.clone());
        }
        if let Some(decision) = &self.decision {
            if !decision.auto_decided {
                ticket.reviewed_at = Some(now);
            }
            ticket.decision = Some(decision.clone());
            ticket.decided_at = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionOutcome, DocumentRefs, KycTier, SubjectFields, Submission};
    use proptest::prelude::*;

    fn ticket() -> Ticket {
        let submission = Submission::new(
            SubjectFields::new("Ada", "1815-12-10", "London", KycTier::Basic),
            DocumentRefs::new("front", "back", "selfie"),
        );
        Ticket::new("key".to_string(), submission, Utc::now())
    }

    fn approve() -> TicketDecision {
        TicketDecision::automatic(DecisionOutcome::Approved {
            tier: KycTier::Basic,
        })
    }

    #[test]
    fn walks_pipeline_to_approval() {
        let mut t = ticket();
        Transition::start(TicketStatus::Pending)
            .apply(&mut t, Utc::now())
            .unwrap();
        Transition::decide(TicketStatus::Processing, approve())
            .apply(&mut t, Utc::now())
            .unwrap();
        assert_eq!(t.status, TicketStatus::Approved);
        assert_eq!(t.approved_tier(), Some(KycTier::Basic));
        assert!(t.decided_at.is_some());
        assert!(t.reviewed_at.is_none());
    }

    #[test]
    fn pending_cannot_jump_to_approved() {
        let mut t = ticket();
        let err = Transition::decide(TicketStatus::Pending, approve())
            .apply(&mut t, Utc::now())
            .unwrap_err();
        assert!(matches!(err, IKycError::InvalidState { .. }));
        assert_eq!(t.status, TicketStatus::Pending);
    }

    #[test]
    fn losing_cas_reports_stale() {
        let mut t = ticket();
        Transition::start(TicketStatus::Pending)
            .apply(&mut t, Utc::now())
            .unwrap();
        let err = Transition::start(TicketStatus::Pending)
            .apply(&mut t, Utc::now())
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn terminal_requires_matching_decision() {
        let mut t = ticket();
        t.status = TicketStatus::ManualReview;
        let bogus = Transition {
            expected: TicketStatus::ManualReview,
            next: TicketStatus::Rejected,
            decision: Some(approve()),
            escalation_note: None,
        };
        assert!(matches!(
            bogus.apply(&mut t, Utc::now()),
            Err(IKycError::InvalidState { .. })
        ));
    }

    proptest! {
        #[test]
        fn terminal_states_have_no_exits(from in 0usize..5, to in 0usize..5) {
            let from = TicketStatus::ALL[from];
            let to = TicketStatus::ALL[to];
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            if to == TicketStatus::Pending {
                prop_assert!(!from.can_transition_to(to));
            }
            if from == TicketStatus::Pending && to.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }
    }
}
