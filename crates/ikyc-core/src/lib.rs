//! iKYC core: identity-verification tickets driven through a staged,
//! asynchronous pipeline.
//!
//! Tickets move `pending -> processing -> {approved, rejected, manual_review}`
//! only through compare-and-set transitions; stage scores are write-once;
//! every stage runs under a bounded retry budget and ends either recorded or
//! dead-lettered with the ticket escalated to a human.

#![deny(unsafe_code)]

pub mod config;
pub mod connectors;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod stage;
pub mod storage;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{AnchoringConfig, IKycConfig, LoggingConfig, RetentionConfig, WorkerConfig};
pub use connectors::{
    AdapterRegistry, AdapterScore, AnchorReceipt, LedgerAnchor, Notification, Notifier,
    SanctionsSource, ScoringAdapter,
};
pub use error::IKycError;
pub use flow::Transition;
pub use ledger::{
    decision_hash, AuditCheckpoint, AuditEntry, AuditEvent, AuditKind, AuditLog, AuditSegment,
    RotationReport,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings, PurgeReport, StageOutput};
pub use policy::{
    decide, CompositeRiskEvaluator, DecisionThresholds, EscalationReason, PolicyDecision,
    RiskEvaluator, RiskInputs, RiskWeights, REASON_RISK_BELOW_THRESHOLD,
};
pub use queue::{
    DeadLetter, Delivery, InMemoryTaskQueue, Priority, QueueDepth, Requeue, StageTask, TaskQueue,
    DEFAULT_DEAD_LETTER_CAPACITY,
};
pub use scheduler::{MaintenanceSchedule, MaintenanceScheduler};
pub use stage::{BackoffPolicy, Stage, StagePolicy, WorkerGroup};
pub use storage::{
    bootstrap_ticket_store, PersistentAuditLog, PostgresAuditStore, PostgresTicketStore,
    TicketStorageConfig,
};
pub use store::{InMemoryTicketStore, ScoreWrite, TicketStore, PURGED_MARKER};
pub use types::{
    AnchorStatus, DecisionOutcome, DocumentRefs, KycStats, KycTier, ReviewSubmission,
    ReviewVerdict, SanctionsResult, StageScore, SubjectFields, Submission, Ticket, TicketDecision,
    TicketFilter, TicketId, TicketStatus,
};
pub use worker::{StageExecutor, TaskOutcome, WorkerPool};
