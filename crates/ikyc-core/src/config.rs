//! Configuration for the iKYC pipeline

use crate::error::IKycError;
use crate::orchestrator::OrchestratorSettings;
use crate::policy::{DecisionThresholds, RiskWeights};
use crate::stage::{Stage, StagePolicy, WorkerGroup};
use crate::storage::TicketStorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IKycConfig {
    /// Decision thresholds
    #[serde(default)]
    pub thresholds: DecisionThresholds,

    /// Composite risk evaluator weights
    #[serde(default)]
    pub risk: RiskWeights,

    /// Per-stage retry/timeout overrides; unset stages use built-in defaults
    #[serde(default)]
    pub stages: BTreeMap<Stage, StagePolicy>,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Retention and maintenance configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Ticket storage configuration
    #[serde(default)]
    pub storage: TicketStorageConfig,

    /// Ledger anchoring configuration
    #[serde(default)]
    pub anchoring: AnchoringConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub ocr: usize,

    #[serde(default = "default_biometric_workers")]
    pub biometrics: usize,

    #[serde(default = "default_workers")]
    pub risk: usize,

    #[serde(default = "default_workers")]
    pub blockchain: usize,

    #[serde(default = "default_workers")]
    pub notification: usize,

    #[serde(default = "default_maintenance_workers")]
    pub maintenance: usize,

    /// Seconds a leased task stays invisible before it is redelivered
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Dead letters retained for operators before the oldest are evicted
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ocr: default_workers(),
            biometrics: default_biometric_workers(),
            risk: default_workers(),
            blockchain: default_workers(),
            notification: default_workers(),
            maintenance: default_maintenance_workers(),
            visibility_timeout_secs: default_visibility_timeout(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl WorkerConfig {
    pub fn concurrency(&self, group: WorkerGroup) -> usize {
        match group {
            WorkerGroup::Ocr => self.ocr,
            WorkerGroup::Biometrics => self.biometrics,
            WorkerGroup::Risk => self.risk,
            WorkerGroup::Blockchain => self.blockchain,
            WorkerGroup::Notification => self.notification,
            WorkerGroup::Maintenance => self.maintenance,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Retention and maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days a decided ticket keeps its personal data
    #[serde(default = "default_ticket_days")]
    pub ticket_days: i64,

    /// Days audit entries stay in the live chain
    #[serde(default = "default_audit_days")]
    pub audit_days: i64,

    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,

    #[serde(default = "default_stall_sweep_interval")]
    pub stall_sweep_interval_secs: u64,

    /// Tickets anonymised per purge run
    #[serde(default = "default_purge_batch")]
    pub purge_batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ticket_days: default_ticket_days(),
            audit_days: default_audit_days(),
            purge_interval_secs: default_purge_interval(),
            rotation_interval_secs: default_rotation_interval(),
            stall_sweep_interval_secs: default_stall_sweep_interval(),
            purge_batch_size: default_purge_batch(),
        }
    }
}

/// Ledger anchoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    2
}

fn default_biometric_workers() -> usize {
    4
}

fn default_maintenance_workers() -> usize {
    1
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_dead_letter_capacity() -> usize {
    crate::queue::DEFAULT_DEAD_LETTER_CAPACITY
}

fn default_ticket_days() -> i64 {
    1825
}

fn default_audit_days() -> i64 {
    2555
}

fn default_purge_interval() -> u64 {
    24 * 60 * 60
}

fn default_rotation_interval() -> u64 {
    24 * 60 * 60
}

fn default_stall_sweep_interval() -> u64 {
    5 * 60
}

fn default_purge_batch() -> usize {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl IKycConfig {
    /// Load configuration: defaults, then the optional file, then `IKYC__*`
    /// environment variables (e.g. `IKYC__THRESHOLDS__AUTO_APPROVAL_THRESHOLD`).
    pub fn load(path: Option<&str>) -> Result<Self, IKycError> {
        let config_error = |e: config::ConfigError| IKycError::Config(e.to_string());
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&IKycConfig::default()).map_err(config_error)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("IKYC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), IKycError> {
        self.thresholds.validate()?;

        for (stage, policy) in &self.stages {
            if policy.max_attempts == 0 {
                return Err(IKycError::Config(format!(
                    "stages.{stage}.max_attempts must be at least 1"
                )));
            }
            if policy.timeout_ms == 0 {
                return Err(IKycError::Config(format!(
                    "stages.{stage}.timeout_ms must be positive"
                )));
            }
            if !(0.0..=1.0).contains(&policy.backoff.jitter) {
                return Err(IKycError::Config(format!(
                    "stages.{stage}.backoff.jitter must be within [0, 1]"
                )));
            }
        }

        if self.workers.visibility_timeout_secs == 0 {
            return Err(IKycError::Config(
                "workers.visibility_timeout_secs must be positive".to_string(),
            ));
        }
        if self.workers.dead_letter_capacity == 0 {
            return Err(IKycError::Config(
                "workers.dead_letter_capacity must be at least 1".to_string(),
            ));
        }
        // A lease must outlive any single attempt or the task is redelivered
        // while it is still running.
        let visibility = self.workers.visibility_timeout();
        for (stage, policy) in self.stage_policies() {
            if policy.timeout() >= visibility {
                return Err(IKycError::Config(format!(
                    "stages.{stage}.timeout_ms ({}ms) must be shorter than workers.visibility_timeout_secs ({}s)",
                    policy.timeout_ms,
                    self.workers.visibility_timeout_secs
                )));
            }
        }

        for group in WorkerGroup::ALL {
            if self.workers.concurrency(group) == 0 {
                return Err(IKycError::Config(format!(
                    "workers.{group} must be at least 1"
                )));
            }
        }

        let retention = &self.retention;
        if retention.ticket_days <= 0 || retention.audit_days <= 0 {
            return Err(IKycError::Config(
                "retention windows must be positive".to_string(),
            ));
        }
        if retention.purge_interval_secs == 0
            || retention.rotation_interval_secs == 0
            || retention.stall_sweep_interval_secs == 0
            || retention.purge_batch_size == 0
        {
            return Err(IKycError::Config(
                "maintenance intervals and batch size must be positive".to_string(),
            ));
        }

        if let TicketStorageConfig::Postgres { database_url, .. } = &self.storage {
            if database_url.trim().is_empty() {
                return Err(IKycError::Config(
                    "storage.database_url must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Effective policy for every stage: configured override or default.
    pub fn stage_policies(&self) -> BTreeMap<Stage, StagePolicy> {
        Stage::ALL
            .into_iter()
            .map(|stage| {
                let policy = self
                    .stages
                    .get(&stage)
                    .copied()
                    .unwrap_or_else(|| StagePolicy::default_for(stage));
                (stage, policy)
            })
            .collect()
    }

    /// A processing ticket is stalled once it has been idle for longer than
    /// every pipeline stage's worst case combined.
    pub fn stall_after(&self) -> Duration {
        let policies = self.stage_policies();
        Stage::PIPELINE
            .iter()
            .filter_map(|stage| policies.get(stage))
            .map(StagePolicy::budget)
            .sum()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let stall_after = chrono::Duration::from_std(self.stall_after())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        OrchestratorSettings {
            anchoring_enabled: self.anchoring.enabled,
            ticket_retention: chrono::Duration::days(self.retention.ticket_days),
            audit_retention: chrono::Duration::days(self.retention.audit_days),
            purge_batch_size: self.retention.purge_batch_size,
            stall_after,
        }
    }

    /// Create a development configuration
    pub fn development() -> Self {
        Self {
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
            ..Default::default()
        }
    }
}
