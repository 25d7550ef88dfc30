use crate::stage::Stage;
use crate::types::{TicketId, TicketStatus};
use thiserror::Error;

/// iKYC runtime errors.
#[derive(Debug, Clone, Error)]
pub enum IKycError {
    #[error("{stage} adapter timed out after {timeout_ms}ms")]
    AdapterTimeout { stage: Stage, timeout_ms: u64 },

    #[error("{stage} adapter failed: {message}")]
    Adapter { stage: Stage, message: String },

    #[error("ledger anchor rejected: {0}")]
    AnchorRejected(String),

    #[error("ledger anchor timed out: {0}")]
    AnchorTimeout(String),

    #[error("stale transition for ticket {ticket_id}: expected '{expected}', found '{actual}'")]
    StaleTransition {
        ticket_id: TicketId,
        expected: TicketStatus,
        actual: TicketStatus,
    },

    #[error("invalid state for ticket {ticket_id}: {detail}")]
    InvalidState { ticket_id: TicketId, detail: String },

    #[error("duplicate submission: already recorded as ticket {existing}")]
    DuplicateSubmission { existing: TicketId },

    #[error("{stage} retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    #[error("ticket {0} not found")]
    NotFound(TicketId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("audit ledger error: {0}")]
    Ledger(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IKycError {
    pub fn adapter(stage: Stage, message: impl Into<String>) -> Self {
        Self::Adapter {
            stage,
            message: message.into(),
        }
    }

    pub fn invalid_state(ticket_id: TicketId, detail: impl Into<String>) -> Self {
        Self::InvalidState {
            ticket_id,
            detail: detail.into(),
        }
    }

    /// Adapter failures and anchor timeouts are retried by the worker pool;
    /// everything else is final for the attempt that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdapterTimeout { .. } | Self::Adapter { .. } | Self::AnchorTimeout(_)
        )
    }

    /// Losing a compare-and-set race is an expected outcome, not a fault.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleTransition { .. })
    }
}

impl From<serde_json::Error> for IKycError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
