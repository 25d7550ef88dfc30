use crate::error::IKycError;
use crate::types::{Ticket, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audit entry categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Submission,
    Dispatch,
    Score,
    Transition,
    Review,
    Anchor,
    DeadLetter,
    Maintenance,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "submission",
            Self::Dispatch => "dispatch",
            Self::Score => "score",
            Self::Transition => "transition",
            Self::Review => "review",
            Self::Anchor => "anchor",
            Self::DeadLetter => "dead_letter",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IKycError> {
        match raw {
            "submission" => Ok(Self::Submission),
            "dispatch" => Ok(Self::Dispatch),
            "score" => Ok(Self::Score),
            "transition" => Ok(Self::Transition),
            "review" => Ok(Self::Review),
            "anchor" => Ok(Self::Anchor),
            "dead_letter" => Ok(Self::DeadLetter),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(IKycError::Ledger(format!("unknown audit kind '{other}'"))),
        }
    }
}

/// Hash-chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub ticket_id: Option<TicketId>,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Free-form audit payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            detail: detail.into(),
        }
    }
}

/// Entries rotated out of the live chain, ready for export. The segment
/// carries its own entries so archived history stays verifiable offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSegment {
    pub segment_id: String,
    pub first_index: u64,
    pub last_index: u64,
    /// Hash the first entry links to; `None` for the genesis segment.
    pub opening_hash: Option<String>,
    pub closing_hash: String,
    pub sealed_at: DateTime<Utc>,
    pub entries: Vec<AuditEntry>,
}

impl AuditSegment {
    pub fn verify(&self) -> bool {
        verify_run(&self.entries, self.opening_hash.as_deref()).as_deref()
            == Some(self.closing_hash.as_str())
    }

    pub fn checkpoint(&self) -> AuditCheckpoint {
        AuditCheckpoint {
            segment_id: self.segment_id.clone(),
            last_index: self.last_index,
            closing_hash: self.closing_hash.clone(),
            sealed_at: self.sealed_at,
        }
    }

    pub fn report(&self) -> RotationReport {
        RotationReport {
            segment_id: self.segment_id.clone(),
            archived_entries: self.entries.len(),
            first_index: self.first_index,
            last_index: self.last_index,
        }
    }
}

/// Where the live chain resumes after the most recent rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCheckpoint {
    pub segment_id: String,
    pub last_index: u64,
    pub closing_hash: String,
    pub sealed_at: DateTime<Utc>,
}

/// Summary of one rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub segment_id: String,
    pub archived_entries: usize,
    pub first_index: u64,
    pub last_index: u64,
}

/// Append-only audit log with hash-chain proofs.
///
/// Entries are never edited. Rotation seals a chronological prefix into an
/// [`AuditSegment`] and drops it from memory; the live chain then starts from
/// the segment's closing hash, recorded as the checkpoint.
#[derive(Debug, Default, Clone)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    checkpoint: Option<AuditCheckpoint>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted state, rejecting index gaps and broken
    /// hash links.
    pub fn from_entries(
        checkpoint: Option<AuditCheckpoint>,
        entries: Vec<AuditEntry>,
    ) -> Result<Self, IKycError> {
        let log = Self {
            entries,
            checkpoint,
        };

        let first = log.checkpoint.as_ref().map_or(0, |c| c.last_index + 1);
        for (offset, entry) in log.entries.iter().enumerate() {
            let expected = first + offset as u64;
            if entry.index != expected {
                return Err(IKycError::Ledger(format!(
                    "audit index gap detected at {expected} (found {})",
                    entry.index
                )));
            }
        }

        if !log.verify_chain() {
            return Err(IKycError::Ledger(
                "persisted audit hash-chain verification failed".to_string(),
            ));
        }
        Ok(log)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn checkpoint(&self) -> Option<&AuditCheckpoint> {
        self.checkpoint.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, ticket_id: TicketId) -> impl Iterator<Item = &AuditEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.ticket_id == Some(ticket_id))
    }

    fn next_index(&self) -> u64 {
        match (self.entries.last(), &self.checkpoint) {
            (Some(entry), _) => entry.index + 1,
            (None, Some(checkpoint)) => checkpoint.last_index + 1,
            (None, None) => 0,
        }
    }

    fn head_hash(&self) -> Option<String> {
        match (self.entries.last(), &self.checkpoint) {
            (Some(entry), _) => Some(entry.entry_hash.clone()),
            (None, Some(checkpoint)) => Some(checkpoint.closing_hash.clone()),
            (None, None) => None,
        }
    }

    /// Hash the next entry against the current head without committing it.
    pub fn build_entry(
        &self,
        ticket_id: Option<TicketId>,
        kind: AuditKind,
        payload: Value,
    ) -> Result<AuditEntry, IKycError> {
        let index = self.next_index();
        let timestamp = Utc::now();
        let previous_hash = self.head_hash();
        let entry_hash = compute_entry_hash(
            index,
            ticket_id,
            kind,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        )?;

        Ok(AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            ticket_id,
            kind,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        })
    }

    /// Commit an entry produced by [`AuditLog::build_entry`].
    pub fn commit_entry(&mut self, entry: AuditEntry) -> Result<(), IKycError> {
        if entry.index != self.next_index() || entry.previous_hash != self.head_hash() {
            return Err(IKycError::Ledger(format!(
                "audit entry {} does not extend the chain head",
                entry.index
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn append(
        &mut self,
        ticket_id: Option<TicketId>,
        kind: AuditKind,
        payload: Value,
    ) -> Result<AuditEntry, IKycError> {
        let entry = self.build_entry(ticket_id, kind, payload)?;
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    pub fn append_event(
        &mut self,
        ticket_id: Option<TicketId>,
        kind: AuditKind,
        event: AuditEvent,
    ) -> Result<AuditEntry, IKycError> {
        let payload = serde_json::to_value(event)?;
        self.append(ticket_id, kind, payload)
    }

    /// Verify the live chain from the last checkpoint.
    pub fn verify_chain(&self) -> bool {
        let start = self
            .checkpoint
            .as_ref()
            .map(|checkpoint| checkpoint.closing_hash.as_str());
        match verify_run(&self.entries, start) {
            Some(_) => true,
            None => self.entries.is_empty(),
        }
    }

    /// Build the segment holding every entry older than `cutoff`, leaving the
    /// log untouched.
    pub fn seal(&self, cutoff: DateTime<Utc>) -> Option<AuditSegment> {
        let split = self
            .entries
            .iter()
            .position(|entry| entry.timestamp >= cutoff)
            .unwrap_or(self.entries.len());
        let sealed = &self.entries[..split];
        let first = sealed.first()?;
        let last = sealed.last()?;
        Some(AuditSegment {
            segment_id: Uuid::new_v4().to_string(),
            first_index: first.index,
            last_index: last.index,
            opening_hash: first.previous_hash.clone(),
            closing_hash: last.entry_hash.clone(),
            sealed_at: Utc::now(),
            entries: sealed.to_vec(),
        })
    }

    /// Drop a sealed prefix from memory and resume the chain from it.
    pub fn evict(&mut self, segment: &AuditSegment) -> Result<(), IKycError> {
        let count = segment.entries.len();
        let matches = count > 0
            && self.entries.len() >= count
            && self.entries[0].index == segment.first_index
            && self.entries[count - 1].entry_hash == segment.closing_hash;
        if !matches {
            return Err(IKycError::Ledger(format!(
                "segment {} is not a prefix of the live chain",
                segment.segment_id
            )));
        }
        self.entries.drain(..count);
        self.checkpoint = Some(segment.checkpoint());
        Ok(())
    }

    /// Seal and evict in one step.
    pub fn rotate(&mut self, cutoff: DateTime<Utc>) -> Result<Option<AuditSegment>, IKycError> {
        let Some(segment) = self.seal(cutoff) else {
            return Ok(None);
        };
        self.evict(&segment)?;
        Ok(Some(segment))
    }
}

/// Returns the hash of the last entry when the run links up from `start`.
/// An empty run verifies to `start` itself.
fn verify_run(entries: &[AuditEntry], start: Option<&str>) -> Option<String> {
    let mut previous = start.map(str::to_string);
    for entry in entries {
        if entry.previous_hash != previous {
            return None;
        }
        let expected = compute_entry_hash(
            entry.index,
            entry.ticket_id,
            entry.kind,
            entry.timestamp,
            &entry.payload,
            entry.previous_hash.as_deref(),
        )
        .ok()?;
        if entry.entry_hash != expected {
            return None;
        }
        previous = Some(entry.entry_hash.clone());
    }
    previous
}

fn compute_entry_hash(
    index: u64,
    ticket_id: Option<TicketId>,
    kind: AuditKind,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> Result<String, IKycError> {
    let material = serde_json::json!({
        "index": index,
        "ticket_id": ticket_id,
        "kind": kind,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Digest of a terminal decision, submitted to the ledger anchor.
///
/// Covers the ticket id, decision and scores; never personal fields.
pub fn decision_hash(ticket: &Ticket) -> Result<String, IKycError> {
    let decision = ticket.decision.as_ref().ok_or_else(|| {
        IKycError::invalid_state(ticket.ticket_id, "no decision recorded to anchor")
    })?;
    let scores = ticket
        .scores
        .iter()
        .map(|(stage, score)| (stage.name(), score.value))
        .collect::<Vec<_>>();
    let material = serde_json::json!({
        "ticket_id": ticket.ticket_id,
        "status": ticket.status,
        "decision": decision,
        "scores": scores,
        "decided_at": ticket.decided_at,
    });
    let bytes = serde_json::to_vec(&material)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
