//! Simulated and fault-injection adapters for iKYC.

#![deny(unsafe_code)]

use async_trait::async_trait;
use ikyc_core::connectors::{
    AdapterRegistry, AdapterScore, AnchorReceipt, LedgerAnchor, Notification, Notifier,
    SanctionsSource, ScoringAdapter,
};
use ikyc_core::error::IKycError;
use ikyc_core::policy::{RiskEvaluator, RiskInputs};
use ikyc_core::stage::Stage;
use ikyc_core::types::{DocumentRefs, SanctionsResult, SubjectFields, TicketId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Maps a BLAKE3 digest of `parts` onto `[floor, 1.0]`.
fn digest_unit(parts: &[&str], floor: f64) -> f64 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    let bytes = hasher.finalize();
    let mut head = [0_u8; 8];
    head.copy_from_slice(&bytes.as_bytes()[..8]);
    let unit = u64::from_le_bytes(head) as f64 / u64::MAX as f64;
    floor + (1.0 - floor) * unit
}

/// Deterministic scorer: the same documents always get the same score.
#[derive(Debug, Clone)]
pub struct HashedScoreAdapter {
    stage: Stage,
    floor: f64,
}

impl HashedScoreAdapter {
    pub fn new(stage: Stage, floor: f64) -> Self {
        Self {
            stage,
            floor: floor.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl ScoringAdapter for HashedScoreAdapter {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn score(&self, documents: &DocumentRefs) -> Result<AdapterScore, IKycError> {
        let refs = [
            self.stage.name(),
            documents.front_id.as_str(),
            documents.back_id.as_str(),
            documents.selfie.as_str(),
        ];
        let value = digest_unit(&refs, self.floor);
        let mut salted = refs.to_vec();
        salted.push("confidence");
        let confidence = digest_unit(&salted, self.floor);
        let score = AdapterScore::new(value, confidence);

        if self.stage != Stage::Ocr {
            return Ok(score);
        }
        let document_number = blake3::hash(documents.front_id.as_bytes()).to_hex();
        let mut fields = BTreeMap::new();
        fields.insert(
            "document_number".to_string(),
            document_number.as_str()[..12].to_uppercase(),
        );
        fields.insert("document_type".to_string(), "national_id".to_string());
        Ok(score.with_fields(fields))
    }
}

/// Returns the same score for every call.
#[derive(Debug, Clone)]
pub struct FixedScoreAdapter {
    stage: Stage,
    value: f64,
    confidence: f64,
}

impl FixedScoreAdapter {
    pub fn new(stage: Stage, value: f64) -> Self {
        Self {
            stage,
            value,
            confidence: 0.95,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

#[async_trait]
impl ScoringAdapter for FixedScoreAdapter {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn score(&self, _documents: &DocumentRefs) -> Result<AdapterScore, IKycError> {
        Ok(AdapterScore::new(self.value, self.confidence))
    }
}

/// Fails the first `failures` calls with a retryable error, then delegates.
pub struct FlakyAdapter {
    inner: Arc<dyn ScoringAdapter>,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyAdapter {
    pub fn new(inner: Arc<dyn ScoringAdapter>, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringAdapter for FlakyAdapter {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    async fn score(&self, documents: &DocumentRefs) -> Result<AdapterScore, IKycError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(IKycError::adapter(
                self.stage(),
                format!("injected failure {call}/{}", self.failures),
            ));
        }
        self.inner.score(documents).await
    }
}

/// Deterministic failing adapter useful for retry-exhaustion testing.
#[derive(Debug)]
pub struct AlwaysFailAdapter {
    stage: Stage,
    reason: String,
    calls: AtomicU32,
}

impl AlwaysFailAdapter {
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringAdapter for AlwaysFailAdapter {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn score(&self, _documents: &DocumentRefs) -> Result<AdapterScore, IKycError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IKycError::adapter(self.stage, self.reason.clone()))
    }
}

/// Sleeps before delegating; pairs with short stage timeouts.
pub struct SlowAdapter {
    inner: Arc<dyn ScoringAdapter>,
    delay: Duration,
}

impl SlowAdapter {
    pub fn new(inner: Arc<dyn ScoringAdapter>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ScoringAdapter for SlowAdapter {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    async fn score(&self, documents: &DocumentRefs) -> Result<AdapterScore, IKycError> {
        tokio::time::sleep(self.delay).await;
        self.inner.score(documents).await
    }
}

/// Case-insensitive exact-name watch list.
#[derive(Debug, Clone, Default)]
pub struct StaticSanctionsList {
    names: BTreeSet<String>,
}

impl StaticSanctionsList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names.into_iter().map(|n| normalize(n.as_ref())).collect(),
        }
    }
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl SanctionsSource for StaticSanctionsList {
    async fn lookup(&self, subject: &SubjectFields) -> Result<SanctionsResult, IKycError> {
        let name = normalize(&subject.full_name);
        if self.names.contains(&name) {
            tracing::warn!(list_size = self.names.len(), "Subject matched sanctions list");
            Ok(SanctionsResult::hit(format!("name match on static list: {name}")))
        } else {
            Ok(SanctionsResult::clear())
        }
    }
}

/// In-process stand-in for the public-ledger anchor.
#[derive(Debug, Default)]
pub struct SimulatedLedgerAnchor {
    anchored: Mutex<Vec<(TicketId, String)>>,
}

impl SimulatedLedgerAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn anchored(&self) -> Vec<(TicketId, String)> {
        self.anchored.lock().await.clone()
    }
}

#[async_trait]
impl LedgerAnchor for SimulatedLedgerAnchor {
    async fn anchor(
        &self,
        ticket_id: TicketId,
        decision_hash: &str,
    ) -> Result<AnchorReceipt, IKycError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ticket_id.to_string().as_bytes());
        hasher.update(decision_hash.as_bytes());
        let tx_ref = format!("0x{}", &hasher.finalize().to_hex()[..40]);

        self.anchored
            .lock()
            .await
            .push((ticket_id, decision_hash.to_string()));
        tracing::info!(ticket_id = %ticket_id, tx_ref = %tx_ref, "Simulated anchor confirmed");
        Ok(AnchorReceipt { tx_ref })
    }
}

/// Anchor that refuses every submission (final, not retried).
#[derive(Debug, Clone)]
pub struct RejectingLedgerAnchor {
    reason: String,
}

impl RejectingLedgerAnchor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LedgerAnchor for RejectingLedgerAnchor {
    async fn anchor(
        &self,
        _ticket_id: TicketId,
        _decision_hash: &str,
    ) -> Result<AnchorReceipt, IKycError> {
        Err(IKycError::AnchorRejected(self.reason.clone()))
    }
}

/// Times out the first `failures` submissions, then confirms.
pub struct FlakyLedgerAnchor {
    inner: SimulatedLedgerAnchor,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyLedgerAnchor {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: SimulatedLedgerAnchor::new(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerAnchor for FlakyLedgerAnchor {
    async fn anchor(
        &self,
        ticket_id: TicketId,
        decision_hash: &str,
    ) -> Result<AnchorReceipt, IKycError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(IKycError::AnchorTimeout(format!(
                "confirmation not seen (attempt {call})"
            )));
        }
        self.inner.anchor(ticket_id, decision_hash).await
    }
}

/// Writes every notification to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), IKycError> {
        tracing::info!(
            ticket_id = %notification.ticket_id,
            status = %notification.status,
            tier = ?notification.tier,
            reason = ?notification.reason,
            has_email = notification.email.is_some(),
            "KYC decision notification"
        );
        Ok(())
    }
}

/// Keeps notifications in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_for(&self, ticket_id: TicketId) -> Vec<Notification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.ticket_id == ticket_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), IKycError> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Risk evaluator returning a constant score.
#[derive(Debug, Clone, Copy)]
pub struct FixedRiskEvaluator(pub f64);

impl RiskEvaluator for FixedRiskEvaluator {
    fn evaluate(&self, inputs: &RiskInputs) -> f64 {
        if inputs.sanctions.hit {
            0.0
        } else {
            self.0
        }
    }
}

/// Registry wired entirely with simulated collaborators.
pub fn simulated_registry(score_floor: f64, watch_list: &[&str]) -> AdapterRegistry {
    AdapterRegistry::new()
        .with_scorer(Arc::new(HashedScoreAdapter::new(Stage::Ocr, score_floor)))
        .with_scorer(Arc::new(HashedScoreAdapter::new(Stage::FaceMatch, score_floor)))
        .with_scorer(Arc::new(HashedScoreAdapter::new(Stage::Liveness, score_floor)))
        .with_sanctions(Arc::new(StaticSanctionsList::new(watch_list.iter().copied())))
        .with_anchor(Arc::new(SimulatedLedgerAnchor::new()))
        .with_notifier(Arc::new(TracingNotifier))
}

/// Registry with fixed biometric scores, for scripted scenarios.
pub fn fixed_registry(ocr: f64, face: f64, liveness: f64) -> AdapterRegistry {
    AdapterRegistry::new()
        .with_scorer(Arc::new(FixedScoreAdapter::new(Stage::Ocr, ocr)))
        .with_scorer(Arc::new(FixedScoreAdapter::new(Stage::FaceMatch, face)))
        .with_scorer(Arc::new(FixedScoreAdapter::new(Stage::Liveness, liveness)))
        .with_anchor(Arc::new(SimulatedLedgerAnchor::new()))
        .with_notifier(Arc::new(TracingNotifier))
}
