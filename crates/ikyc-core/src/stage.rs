//! Pipeline stages, their worker-group routing, and per-stage retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One unit of pipeline or maintenance work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ocr,
    FaceMatch,
    Liveness,
    Risk,
    Anchor,
    Notify,
    RetentionPurge,
    AuditRotation,
    StalledSweep,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Self::Ocr,
        Self::FaceMatch,
        Self::Liveness,
        Self::Risk,
        Self::Anchor,
        Self::Notify,
        Self::RetentionPurge,
        Self::AuditRotation,
        Self::StalledSweep,
    ];

    /// Stages whose completion drives the ticket state machine.
    pub const PIPELINE: [Stage; 4] = [Self::Ocr, Self::FaceMatch, Self::Liveness, Self::Risk];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::FaceMatch => "face_match",
            Self::Liveness => "liveness",
            Self::Risk => "risk",
            Self::Anchor => "anchor",
            Self::Notify => "notify",
            Self::RetentionPurge => "retention_purge",
            Self::AuditRotation => "audit_rotation",
            Self::StalledSweep => "stalled_sweep",
        }
    }

    pub fn group(self) -> WorkerGroup {
        match self {
            Self::Ocr => WorkerGroup::Ocr,
            Self::FaceMatch | Self::Liveness => WorkerGroup::Biometrics,
            Self::Risk => WorkerGroup::Risk,
            Self::Anchor => WorkerGroup::Blockchain,
            Self::Notify => WorkerGroup::Notification,
            Self::RetentionPurge | Self::AuditRotation | Self::StalledSweep => {
                WorkerGroup::Maintenance
            }
        }
    }

    pub fn is_pipeline(self) -> bool {
        Self::PIPELINE.contains(&self)
    }

    /// Maintenance stages operate on batches and carry no ticket.
    pub fn is_maintenance(self) -> bool {
        self.group() == WorkerGroup::Maintenance
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Isolated worker pools. A saturated group never starves another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerGroup {
    Ocr,
    Biometrics,
    Risk,
    Blockchain,
    Notification,
    Maintenance,
}

impl WorkerGroup {
    pub const ALL: [WorkerGroup; 6] = [
        Self::Ocr,
        Self::Biometrics,
        Self::Risk,
        Self::Blockchain,
        Self::Notification,
        Self::Maintenance,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Biometrics => "biometrics",
            Self::Risk => "risk",
            Self::Blockchain => "blockchain",
            Self::Notification => "notification",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of the computed delay that is randomized, in [0, 1].
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base_ms: 0,
            max_ms: 0,
            jitter: 0.0,
        }
    }

    /// Delay before the given (1-based) attempt is retried.
    ///
    /// `jitter_sample` is a uniform draw in [0, 1); the caller owns the RNG so
    /// the computation stays deterministic under test.
    pub fn delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let raw = self.base_ms.saturating_mul(1_u64 << exponent).min(self.max_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let sample = jitter_sample.clamp(0.0, 1.0);
        // Spread over [raw * (1 - jitter), raw].
        let scaled = raw as f64 * (1.0 - jitter * sample);
        Duration::from_millis(scaled.round() as u64)
    }
}

/// Retry and timeout budget attached to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub backoff: BackoffPolicy,
}

impl StagePolicy {
    pub fn new(max_attempts: u32, timeout: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            timeout_ms: timeout.as_millis() as u64,
            backoff,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Worst-case wall time one task of this stage can consume before it is
    /// dead-lettered.
    pub fn budget(&self) -> Duration {
        let mut total = self.timeout_ms.saturating_mul(self.max_attempts as u64);
        for attempt in 1..self.max_attempts {
            total = total.saturating_add(self.backoff.delay(attempt, 0.0).as_millis() as u64);
        }
        Duration::from_millis(total)
    }

    pub fn default_for(stage: Stage) -> Self {
        let backoff = |base_ms, max_ms| BackoffPolicy {
            base_ms,
            max_ms,
            jitter: 0.2,
        };
        match stage {
            // Interactive latency targets.
            Stage::Ocr => Self::new(3, Duration::from_secs(30), backoff(500, 8_000)),
            Stage::FaceMatch | Stage::Liveness => {
                Self::new(3, Duration::from_secs(15), backoff(500, 8_000))
            }
            Stage::Risk => Self::new(3, Duration::from_secs(10), backoff(250, 4_000)),
            // Network confirmation delay.
            Stage::Anchor => Self::new(5, Duration::from_secs(120), backoff(5_000, 300_000)),
            Stage::Notify => Self::new(4, Duration::from_secs(10), backoff(1_000, 30_000)),
            Stage::RetentionPurge | Stage::AuditRotation | Stage::StalledSweep => {
                Self::new(2, Duration::from_secs(300), backoff(10_000, 60_000))
            }
        }
    }
}
