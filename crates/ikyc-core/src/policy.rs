use crate::error::IKycError;
use crate::types::{KycTier, SanctionsResult};
use serde::{Deserialize, Serialize};

/// Rejection reason recorded when the risk score misses both thresholds.
pub const REASON_RISK_BELOW_THRESHOLD: &str = "risk_score_below_threshold";

/// Process-wide decision thresholds. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    pub auto_approval_threshold: f64,
    pub manual_review_threshold: f64,
    pub face_match_threshold: f64,
    pub liveness_threshold: f64,
    /// Auto-approval never grants more than this tier; reviewers may.
    pub max_auto_approval_tier: KycTier,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            auto_approval_threshold: 0.85,
            manual_review_threshold: 0.65,
            face_match_threshold: 0.7,
            liveness_threshold: 0.8,
            max_auto_approval_tier: KycTier::Full,
        }
    }
}

impl DecisionThresholds {
    pub fn validate(&self) -> Result<(), IKycError> {
        let named = [
            ("auto_approval_threshold", self.auto_approval_threshold),
            ("manual_review_threshold", self.manual_review_threshold),
            ("face_match_threshold", self.face_match_threshold),
            ("liveness_threshold", self.liveness_threshold),
        ];
        for (name, value) in named {
            if !(0.0..=1.0).contains(&value) {
                return Err(IKycError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.manual_review_threshold > self.auto_approval_threshold {
            return Err(IKycError::Config(format!(
                "manual_review_threshold {} exceeds auto_approval_threshold {}",
                self.manual_review_threshold, self.auto_approval_threshold
            )));
        }
        if self.max_auto_approval_tier == KycTier::ViewOnly {
            return Err(IKycError::Config(
                "max_auto_approval_tier must be basic or full".to_string(),
            ));
        }
        Ok(())
    }

    pub fn auto_approved_tier(&self, requested: KycTier) -> KycTier {
        requested.min(self.max_auto_approval_tier)
    }

    pub fn face_passes(&self, face_score: f64) -> bool {
        // NaN never passes a gate.
        face_score >= self.face_match_threshold
    }

    pub fn liveness_passes(&self, liveness_score: f64) -> bool {
        liveness_score >= self.liveness_threshold
    }
}

/// Why a ticket was parked for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    BiometricBelowThreshold,
    RiskInReviewBand,
}

impl EscalationReason {
    pub fn note(self) -> &'static str {
        match self {
            Self::BiometricBelowThreshold => "biometric score below threshold",
            Self::RiskInReviewBand => "risk score within manual review band",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Approve,
    ManualReview(EscalationReason),
    Reject { reason: String },
}

/// Maps scores to a decision.
///
/// The biometric gate is evaluated first: a risk score computed on an
/// unreliable face match carries no weight. All boundaries are inclusive.
pub fn decide(
    risk_score: f64,
    face_score: f64,
    liveness_score: f64,
    thresholds: &DecisionThresholds,
) -> PolicyDecision {
    if !thresholds.face_passes(face_score) || !thresholds.liveness_passes(liveness_score) {
        return PolicyDecision::ManualReview(EscalationReason::BiometricBelowThreshold);
    }
    if risk_score >= thresholds.auto_approval_threshold {
        return PolicyDecision::Approve;
    }
    if risk_score >= thresholds.manual_review_threshold {
        return PolicyDecision::ManualReview(EscalationReason::RiskInReviewBand);
    }
    PolicyDecision::Reject {
        reason: REASON_RISK_BELOW_THRESHOLD.to_string(),
    }
}

/// Everything the risk stage knows when it runs.
#[derive(Debug, Clone)]
pub struct RiskInputs {
    pub ocr_value: f64,
    pub ocr_confidence: f64,
    pub face_score: f64,
    pub liveness_score: f64,
    pub sanctions: SanctionsResult,
}

/// Folds component scores and the sanctions lookup into one risk score in [0, 1].
/// Higher means more trustworthy.
pub trait RiskEvaluator: Send + Sync {
    fn evaluate(&self, inputs: &RiskInputs) -> f64;
}

/// Penalty weights for the composite evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub face_mismatch_penalty: f64,
    pub not_live_penalty: f64,
    pub low_ocr_confidence_penalty: f64,
    pub ocr_confidence_floor: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            face_mismatch_penalty: 0.5,
            not_live_penalty: 0.3,
            low_ocr_confidence_penalty: 0.2,
            ocr_confidence_floor: 0.5,
        }
    }
}

/// Mean of the positive components minus red-flag penalties.
#[derive(Debug, Clone)]
pub struct CompositeRiskEvaluator {
    thresholds: DecisionThresholds,
    weights: RiskWeights,
}

impl CompositeRiskEvaluator {
    pub fn new(thresholds: DecisionThresholds) -> Self {
        Self::with_weights(thresholds, RiskWeights::default())
    }

    pub fn with_weights(thresholds: DecisionThresholds, weights: RiskWeights) -> Self {
        Self {
            thresholds,
            weights,
        }
    }
}

impl RiskEvaluator for CompositeRiskEvaluator {
    fn evaluate(&self, inputs: &RiskInputs) -> f64 {
        if inputs.sanctions.hit {
            return 0.0;
        }

        let components = [
            inputs.ocr_value,
            inputs.face_score,
            inputs.liveness_score,
            inputs.ocr_confidence,
        ];
        let positive = components
            .iter()
            .copied()
            .filter(|score| *score > 0.0)
            .collect::<Vec<_>>();
        if positive.is_empty() {
            return 0.0;
        }
        let mean = positive.iter().sum::<f64>() / positive.len() as f64;

        let mut penalties = 0.0;
        if !self.thresholds.face_passes(inputs.face_score) {
            penalties += self.weights.face_mismatch_penalty;
        }
        if !self.thresholds.liveness_passes(inputs.liveness_score) {
            penalties += self.weights.not_live_penalty;
        }
        if inputs.ocr_confidence < self.weights.ocr_confidence_floor {
            penalties += self.weights.low_ocr_confidence_penalty;
        }

        (mean - penalties).clamp(0.0, 1.0)
    }
}
