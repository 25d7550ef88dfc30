use crate::error::IKycError;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned to a verification request at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, IKycError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| IKycError::Validation(format!("invalid ticket id '{raw}': {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ticket lifecycle status. See [`crate::flow`] for the permitted edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Processing,
    ManualReview,
    Approved,
    Rejected,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::ManualReview,
        Self::Approved,
        Self::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::ManualReview => "manual_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IKycError> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| IKycError::Validation(format!("unknown ticket status '{raw}'")))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access tier granted by a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycTier {
    /// Tier 0: balance and history only, no withdrawals.
    ViewOnly,
    /// Tier 1: limited withdrawals.
    Basic,
    /// Tier 2: full platform access.
    Full,
}

impl KycTier {
    pub fn level(self) -> u8 {
        match self {
            Self::ViewOnly => 0,
            Self::Basic => 1,
            Self::Full => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::ViewOnly),
            1 => Some(Self::Basic),
            2 => Some(Self::Full),
            _ => None,
        }
    }
}

/// Personal data captured at submission. Immutable until the retention purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFields {
    pub full_name: String,
    pub date_of_birth: String,
    pub address: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub requested_tier: KycTier,
}

impl SubjectFields {
    pub fn new(
        full_name: impl Into<String>,
        date_of_birth: impl Into<String>,
        address: impl Into<String>,
        requested_tier: KycTier,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            date_of_birth: date_of_birth.into(),
            address: address.into(),
            email: None,
            phone: None,
            requested_tier,
        }
    }

    pub fn with_contact(mut self, email: Option<String>, phone: Option<String>) -> Self {
        self.email = email;
        self.phone = phone;
        self
    }
}

/// Object-storage references to the uploaded images (never the blobs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRefs {
    pub front_id: String,
    pub back_id: String,
    pub selfie: String,
}

impl DocumentRefs {
    pub fn new(
        front_id: impl Into<String>,
        back_id: impl Into<String>,
        selfie: impl Into<String>,
    ) -> Self {
        Self {
            front_id: front_id.into(),
            back_id: back_id.into(),
            selfie: selfie.into(),
        }
    }
}

/// Submission boundary input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub subject: SubjectFields,
    pub documents: DocumentRefs,
    /// Caller-supplied replay guard. Derived from the payload when absent.
    pub idempotency_key: Option<String>,
}

impl Submission {
    pub fn new(subject: SubjectFields, documents: DocumentRefs) -> Self {
        Self {
            subject,
            documents,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<(), IKycError> {
        let required = [
            ("full_name", &self.subject.full_name),
            ("date_of_birth", &self.subject.date_of_birth),
            ("address", &self.subject.address),
            ("front_id", &self.documents.front_id),
            ("back_id", &self.documents.back_id),
            ("selfie", &self.documents.selfie),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(IKycError::Validation(format!("{field} must not be empty")));
        }

        if self.subject.requested_tier == KycTier::ViewOnly {
            return Err(IKycError::Validation(
                "requested tier must be basic or full".to_string(),
            ));
        }

        if matches!(&self.idempotency_key, Some(key) if key.trim().is_empty()) {
            return Err(IKycError::Validation(
                "idempotency key must not be blank".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective idempotency key: the caller's key, or a digest of the payload.
    pub fn resolved_idempotency_key(&self) -> Result<String, IKycError> {
        if let Some(key) = &self.idempotency_key {
            return Ok(key.clone());
        }
        let material = serde_json::json!({
            "subject": self.subject,
            "documents": self.documents,
        });
        let bytes = serde_json::to_vec(&material)?;
        Ok(format!("sub-{}", blake3::hash(&bytes).to_hex()))
    }
}

/// Output of one scoring stage. Written once, never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageScore {
    pub value: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<BTreeMap<String, String>>,
    pub recorded_at: DateTime<Utc>,
}

impl StageScore {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            extracted_fields: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.extracted_fields = Some(fields);
        self
    }
}

/// External sanctions-list lookup outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionsResult {
    pub hit: bool,
    pub detail: Option<String>,
}

impl SanctionsResult {
    pub fn clear() -> Self {
        Self {
            hit: false,
            detail: None,
        }
    }

    pub fn hit(detail: impl Into<String>) -> Self {
        Self {
            hit: true,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved { tier: KycTier },
    Rejected { reason: String },
}

/// Final decision, set only on a terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDecision {
    #[serde(flatten)]
    pub outcome: DecisionOutcome,
    pub reviewer_id: Option<String>,
    pub note: Option<String>,
    pub auto_decided: bool,
}

impl TicketDecision {
    pub fn automatic(outcome: DecisionOutcome) -> Self {
        Self {
            outcome,
            reviewer_id: None,
            note: None,
            auto_decided: true,
        }
    }

    pub fn status(&self) -> TicketStatus {
        match self.outcome {
            DecisionOutcome::Approved { .. } => TicketStatus::Approved,
            DecisionOutcome::Rejected { .. } => TicketStatus::Rejected,
        }
    }
}

/// Ledger anchoring progress for approved tickets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnchorStatus {
    Pending,
    Anchored {
        tx_ref: String,
        anchored_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

/// One identity-verification request and its accumulated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub idempotency_key: String,
    pub subject: SubjectFields,
    pub documents: DocumentRefs,
    pub status: TicketStatus,
    pub scores: BTreeMap<Stage, StageScore>,
    pub sanctions: Option<SanctionsResult>,
    pub decision: Option<TicketDecision>,
    /// System- or policy-generated reason for a manual-review escalation.
    pub escalation_note: Option<String>,
    pub anchor: Option<AnchorStatus>,
    pub attempt_counts: BTreeMap<Stage, u32>,
    /// Stages already enqueued for this ticket; guards fan-out and fan-in.
    pub dispatched: BTreeSet<Stage>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn new(idempotency_key: String, submission: Submission, now: DateTime<Utc>) -> Self {
        Self {
            ticket_id: TicketId::new(),
            idempotency_key,
            subject: submission.subject,
            documents: submission.documents,
            status: TicketStatus::Pending,
            scores: BTreeMap::new(),
            sanctions: None,
            decision: None,
            escalation_note: None,
            anchor: None,
            attempt_counts: BTreeMap::new(),
            dispatched: BTreeSet::new(),
            submitted_at: now,
            updated_at: now,
            reviewed_at: None,
            decided_at: None,
            purged_at: None,
        }
    }

    pub fn score(&self, stage: Stage) -> Option<&StageScore> {
        self.scores.get(&stage)
    }

    pub fn score_value(&self, stage: Stage) -> Option<f64> {
        self.score(stage).map(|score| score.value)
    }

    pub fn approved_tier(&self) -> Option<KycTier> {
        match self.decision.as_ref().map(|decision| &decision.outcome) {
            Some(DecisionOutcome::Approved { tier }) => Some(*tier),
            _ => None,
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self.decision.as_ref().map(|decision| &decision.outcome) {
            Some(DecisionOutcome::Rejected { reason }) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_counts.get(&stage).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve { tier: KycTier },
    Reject { reason: String },
}

/// Human decision for a ticket parked in manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub ticket_id: TicketId,
    pub reviewer_id: String,
    pub verdict: ReviewVerdict,
    pub note: Option<String>,
}

impl ReviewSubmission {
    pub fn approve(ticket_id: TicketId, reviewer_id: impl Into<String>, tier: KycTier) -> Self {
        Self {
            ticket_id,
            reviewer_id: reviewer_id.into(),
            verdict: ReviewVerdict::Approve { tier },
            note: None,
        }
    }

    pub fn reject(
        ticket_id: TicketId,
        reviewer_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id,
            reviewer_id: reviewer_id.into(),
            verdict: ReviewVerdict::Reject {
                reason: reason.into(),
            },
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Listing filter, newest submissions first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub tier: Option<KycTier>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TicketFilter {
    pub fn with_status(status: TicketStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        if let Some(status) = self.status {
            if ticket.status != status {
                return false;
            }
        }
        if let Some(tier) = self.tier {
            if ticket.approved_tier() != Some(tier) {
                return false;
            }
        }
        true
    }
}

/// Aggregate dashboard figures over a submission window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KycStats {
    pub window_days: i64,
    pub total_submissions: usize,
    pub by_status: BTreeMap<TicketStatus, usize>,
    pub auto_approved: usize,
    pub manually_reviewed: usize,
    pub by_tier: BTreeMap<KycTier, usize>,
    pub avg_face_score: f64,
    pub avg_liveness_score: f64,
    pub avg_risk_score: f64,
    pub approval_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Submission {
        Submission::new(
            SubjectFields::new("Jane Roe", "1990-01-01", "1 Main St", KycTier::Full),
            DocumentRefs::new("s3://kyc/front.jpg", "s3://kyc/back.jpg", "s3://kyc/selfie.jpg"),
        )
    }

    #[test]
    fn derived_idempotency_key_is_stable() {
        let a = submission().resolved_idempotency_key().unwrap();
        let b = submission().resolved_idempotency_key().unwrap();
        assert_eq!(a, b);

        let mut other = submission();
        other.documents.selfie = "s3://kyc/selfie-2.jpg".to_string();
        assert_ne!(a, other.resolved_idempotency_key().unwrap());

        let explicit = submission().with_idempotency_key("client-42");
        assert_eq!(explicit.resolved_idempotency_key().unwrap(), "client-42");
    }

    #[test]
    fn rejects_view_only_and_blank_fields() {
        let mut view_only = submission();
        view_only.subject.requested_tier = KycTier::ViewOnly;
        assert!(matches!(
            view_only.validate(),
            Err(IKycError::Validation(msg)) if msg.contains("tier")
        ));

        let mut blank = submission();
        blank.documents.back_id = "  ".to_string();
        assert!(matches!(
            blank.validate(),
            Err(IKycError::Validation(msg)) if msg.contains("back_id")
        ));

        assert!(submission().validate().is_ok());
    }

    #[test]
    fn status_strings_parse_back() {
        for status in TicketStatus::ALL {
            assert_eq!(TicketStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TicketStatus::parse("passed").is_err());
    }

    #[test]
    fn decision_serializes_flat() {
        let decision = TicketDecision::automatic(DecisionOutcome::Rejected {
            reason: "risk_score_below_threshold".to_string(),
        });
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["outcome"], "rejected");
        assert_eq!(value["reason"], "risk_score_below_threshold");
        assert_eq!(value["auto_decided"], true);
    }
}
