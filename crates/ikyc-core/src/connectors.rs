use crate::error::IKycError;
use crate::stage::Stage;
use crate::types::{
    DocumentRefs, KycTier, SanctionsResult, StageScore, SubjectFields, TicketId, TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Raw adapter output before it is stamped and recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterScore {
    pub value: f64,
    pub confidence: f64,
    pub fields: Option<BTreeMap<String, String>>,
}

impl AdapterScore {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value,
            confidence,
            fields: None,
        }
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn into_stage_score(self) -> StageScore {
        let score = StageScore::new(self.value, self.confidence);
        match self.fields {
            Some(fields) => score.with_fields(fields),
            None => score,
        }
    }
}

/// OCR, face-match or liveness scoring model behind a uniform call.
///
/// Implementations should be pure functions of the document references;
/// the worker pool bounds every call with the stage timeout.
#[async_trait]
pub trait ScoringAdapter: Send + Sync {
    fn stage(&self) -> Stage;

    async fn score(&self, documents: &DocumentRefs) -> Result<AdapterScore, IKycError>;
}

#[async_trait]
pub trait SanctionsSource: Send + Sync {
    async fn lookup(&self, subject: &SubjectFields) -> Result<SanctionsResult, IKycError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub tx_ref: String,
}

/// Public-ledger anchoring service.
///
/// Fails with `AnchorTimeout` (retried) or `AnchorRejected` (final).
#[async_trait]
pub trait LedgerAnchor: Send + Sync {
    async fn anchor(
        &self,
        ticket_id: TicketId,
        decision_hash: &str,
    ) -> Result<AnchorReceipt, IKycError>;
}

/// Decision notice handed to the notification transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub ticket_id: TicketId,
    pub status: TicketStatus,
    pub tier: Option<KycTier>,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub scores: BTreeMap<Stage, f64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), IKycError>;
}

/// External collaborators wired into the worker pool.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    scorers: HashMap<Stage, Arc<dyn ScoringAdapter>>,
    sanctions: Option<Arc<dyn SanctionsSource>>,
    anchor: Option<Arc<dyn LedgerAnchor>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scorer(&mut self, adapter: Arc<dyn ScoringAdapter>) {
        self.scorers.insert(adapter.stage(), adapter);
    }

    pub fn with_scorer(mut self, adapter: Arc<dyn ScoringAdapter>) -> Self {
        self.register_scorer(adapter);
        self
    }

    pub fn with_sanctions(mut self, source: Arc<dyn SanctionsSource>) -> Self {
        self.sanctions = Some(source);
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn LedgerAnchor>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn scorer(&self, stage: Stage) -> Result<Arc<dyn ScoringAdapter>, IKycError> {
        self.scorers
            .get(&stage)
            .cloned()
            .ok_or_else(|| IKycError::Config(format!("no scoring adapter registered for {stage}")))
    }

    pub fn has_scorer(&self, stage: Stage) -> bool {
        self.scorers.contains_key(&stage)
    }

    /// Without a configured source every lookup is clear.
    pub async fn lookup_sanctions(
        &self,
        subject: &SubjectFields,
    ) -> Result<SanctionsResult, IKycError> {
        match &self.sanctions {
            Some(source) => source.lookup(subject).await,
            None => Ok(SanctionsResult::clear()),
        }
    }

    pub fn anchor(&self) -> Option<Arc<dyn LedgerAnchor>> {
        self.anchor.clone()
    }

    pub fn has_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn notifier(&self) -> Option<Arc<dyn Notifier>> {
        self.notifier.clone()
    }
}
