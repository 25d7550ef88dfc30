use crate::error::IKycError;
use crate::flow::Transition;
use crate::ledger::{AuditCheckpoint, AuditEntry, AuditEvent, AuditKind, AuditLog, AuditSegment};
use crate::stage::Stage;
use crate::store::{
    anonymize, apply_score, InMemoryTicketStore, ScoreWrite, StoreResult, TicketStore,
};
use crate::types::{
    AnchorStatus, KycTier, SanctionsResult, StageScore, Ticket, TicketFilter, TicketId,
    TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

/// Ticket persistence backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum TicketStorageConfig {
    /// Keep tickets in process memory only.
    Memory,
    /// Persist tickets in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl TicketStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for TicketStorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Open the configured backend, creating the schema when needed.
pub async fn bootstrap_ticket_store(
    config: &TicketStorageConfig,
) -> Result<Arc<dyn TicketStore>, IKycError> {
    match config {
        TicketStorageConfig::Memory => Ok(Arc::new(InMemoryTicketStore::new())),
        TicketStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresTicketStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// PostgreSQL ticket store.
///
/// The full ticket lives in a JSONB document; status, idempotency key and the
/// timestamps used for sweeps are mirrored into indexed columns. Status
/// changes are guarded by `WHERE status = $expected`, score writes by the
/// absence of the stage key in `document->'scores'`.
#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: PgPool,
}

impl PostgresTicketStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, IKycError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| IKycError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), IKycError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ikyc_tickets (
                ticket_id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                decided_at TIMESTAMPTZ NULL,
                purged_at TIMESTAMPTZ NULL,
                document JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres schema create failed: {e}")))?;

        for statement in [
            "ALTER TABLE ikyc_tickets ADD COLUMN IF NOT EXISTS approved_tier SMALLINT NULL",
            "CREATE INDEX IF NOT EXISTS idx_ikyc_tickets_status ON ikyc_tickets (status, updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_ikyc_tickets_submitted_at ON ikyc_tickets (submitted_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ikyc_tickets_decided_at ON ikyc_tickets (decided_at) WHERE purged_at IS NULL",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| IKycError::Storage(format!("postgres index create failed: {e}")))?;
        }

        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| IKycError::Storage(format!("postgres begin failed: {e}")))
    }

    async fn lock_ticket(
        tx: &mut Transaction<'_, Postgres>,
        id: TicketId,
    ) -> StoreResult<Ticket> {
        let row = sqlx::query("SELECT document FROM ikyc_tickets WHERE ticket_id = $1 FOR UPDATE")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| IKycError::Storage(format!("postgres lock failed: {e}")))?;
        match row {
            Some(row) => decode_ticket(&row),
            None => Err(IKycError::NotFound(id)),
        }
    }

    async fn write_ticket(
        tx: &mut Transaction<'_, Postgres>,
        ticket: &Ticket,
        expected: Option<TicketStatus>,
    ) -> StoreResult<u64> {
        let document = serde_json::to_value(ticket)?;
        let result = sqlx::query(
            r#"
            UPDATE ikyc_tickets
            SET status = $2,
                updated_at = $3,
                decided_at = $4,
                purged_at = $5,
                document = $6,
                approved_tier = $8
            WHERE ticket_id = $1
              AND ($7::TEXT IS NULL OR status = $7)
            "#,
        )
        .bind(ticket.ticket_id.to_string())
        .bind(ticket.status.as_str())
        .bind(ticket.updated_at)
        .bind(ticket.decided_at)
        .bind(ticket.purged_at)
        .bind(document)
        .bind(expected.map(|status| status.as_str()))
        .bind(ticket.approved_tier().map(tier_column))
        .execute(&mut **tx)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres update failed: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn commit(tx: Transaction<'_, Postgres>) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|e| IKycError::Storage(format!("postgres commit failed: {e}")))
    }

    /// Run `mutate` on the row-locked ticket and persist the result.
    async fn mutate<R, F>(&self, id: TicketId, mutate: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Ticket) -> StoreResult<R> + Send,
        R: Send,
    {
        let mut tx = self.begin().await?;
        let mut ticket = Self::lock_ticket(&mut tx, id).await?;
        let out = mutate(&mut ticket)?;
        Self::write_ticket(&mut tx, &ticket, None).await?;
        Self::commit(tx).await?;
        Ok(out)
    }
}

fn decode_ids(rows: &[PgRow]) -> StoreResult<Vec<TicketId>> {
    rows.iter()
        .map(|row| {
            let raw: String = row.try_get("ticket_id").map_err(|e| {
                IKycError::Storage(format!("postgres decode ticket_id failed: {e}"))
            })?;
            TicketId::parse(&raw)
        })
        .collect()
}

fn tier_column(tier: KycTier) -> i16 {
    i16::from(tier.level())
}

fn to_bigint(value: usize, what: &str) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| IKycError::Storage(format!("{what} exceeds postgres BIGINT range")))
}

fn decode_ticket(row: &PgRow) -> StoreResult<Ticket> {
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| IKycError::Storage(format!("postgres decode document failed: {e}")))?;
    Ok(serde_json::from_value(document)?)
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    async fn create(&self, ticket: Ticket) -> StoreResult<TicketId> {
        let document = serde_json::to_value(&ticket)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ikyc_tickets (
                ticket_id,
                idempotency_key,
                status,
                submitted_at,
                updated_at,
                decided_at,
                purged_at,
                document
            )
            VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(ticket.ticket_id.to_string())
        .bind(&ticket.idempotency_key)
        .bind(ticket.status.as_str())
        .bind(ticket.submitted_at)
        .bind(ticket.updated_at)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres insert failed: {e}")))?;

        if result.rows_affected() == 1 {
            return Ok(ticket.ticket_id);
        }

        let existing: String =
            sqlx::query_scalar("SELECT ticket_id FROM ikyc_tickets WHERE idempotency_key = $1")
                .bind(&ticket.idempotency_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| IKycError::Storage(format!("postgres lookup failed: {e}")))?;
        Err(IKycError::DuplicateSubmission {
            existing: TicketId::parse(&existing)?,
        })
    }

    async fn get(&self, id: TicketId) -> StoreResult<Ticket> {
        let row = sqlx::query("SELECT document FROM ikyc_tickets WHERE ticket_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IKycError::Storage(format!("postgres get failed: {e}")))?;
        match row {
            Some(row) => decode_ticket(&row),
            None => Err(IKycError::NotFound(id)),
        }
    }

    async fn record_score(
        &self,
        id: TicketId,
        stage: Stage,
        score: StageScore,
    ) -> StoreResult<ScoreWrite> {
        let now = Utc::now();
        let value = serde_json::to_value(&score)?;
        let result = sqlx::query(
            r#"
            UPDATE ikyc_tickets
            SET document = jsonb_set(
                    jsonb_set(document, ARRAY['scores', $2], $3),
                    '{updated_at}',
                    to_jsonb($4::TIMESTAMPTZ)
                ),
                updated_at = $4
            WHERE ticket_id = $1
              AND status NOT IN ('approved', 'rejected')
              AND purged_at IS NULL
              AND NOT (document->'scores' ? $2)
            "#,
        )
        .bind(id.to_string())
        .bind(stage.name())
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres score write failed: {e}")))?;

        if result.rows_affected() == 1 {
            return Ok(ScoreWrite::Recorded);
        }

        // Guard rejected the write; classify with the shared rule.
        let mut ticket = self.get(id).await?;
        Ok(match apply_score(&mut ticket, stage, score, now) {
            ScoreWrite::Recorded => ScoreWrite::AlreadyRecorded,
            other => other,
        })
    }

    async fn record_attempt(&self, id: TicketId, stage: Stage, attempt: u32) -> StoreResult<()> {
        self.mutate(id, |ticket| {
            let counter = ticket.attempt_counts.entry(stage).or_insert(0);
            *counter = (*counter).max(attempt);
            Ok(())
        })
        .await
    }

    async fn transition(&self, id: TicketId, transition: &Transition) -> StoreResult<Ticket> {
        let mut tx = self.begin().await?;
        let mut ticket = Self::lock_ticket(&mut tx, id).await?;
        transition.apply(&mut ticket, Utc::now())?;
        let updated = Self::write_ticket(&mut tx, &ticket, Some(transition.expected)).await?;
        if updated == 0 {
            let actual = ticket.status;
            return Err(IKycError::StaleTransition {
                ticket_id: id,
                expected: transition.expected,
                actual,
            });
        }
        Self::commit(tx).await?;
        Ok(ticket)
    }

    async fn mark_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<bool> {
        self.mutate(id, |ticket| {
            let claimed = ticket.dispatched.insert(stage);
            if claimed {
                ticket.updated_at = Utc::now();
            }
            Ok(claimed)
        })
        .await
    }

    async fn clear_dispatched(&self, id: TicketId, stage: Stage) -> StoreResult<()> {
        self.mutate(id, |ticket| {
            ticket.dispatched.remove(&stage);
            Ok(())
        })
        .await
    }

    async fn set_sanctions(&self, id: TicketId, sanctions: SanctionsResult) -> StoreResult<()> {
        self.mutate(id, |ticket| {
            if ticket.sanctions.is_none() {
                ticket.sanctions = Some(sanctions);
            }
            Ok(())
        })
        .await
    }

    async fn set_anchor(&self, id: TicketId, anchor: AnchorStatus) -> StoreResult<()> {
        self.mutate(id, |ticket| {
            ticket.anchor = Some(anchor);
            Ok(())
        })
        .await
    }

    async fn list(&self, filter: &TicketFilter) -> StoreResult<Vec<Ticket>> {
        let limit = filter
            .limit
            .map(|limit| to_bigint(limit, "list limit"))
            .transpose()?;
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM ikyc_tickets
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::SMALLINT IS NULL OR approved_tier = $2)
            ORDER BY submitted_at DESC, ticket_id COLLATE "C" ASC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.tier.map(tier_column))
        .bind(to_bigint(filter.offset, "list offset")?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres list failed: {e}")))?;

        rows.iter().map(decode_ticket).collect()
    }

    async fn list_purgeable(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TicketId>> {
        let rows = sqlx::query(
            r#"
            SELECT ticket_id
            FROM ikyc_tickets
            WHERE status IN ('approved', 'rejected')
              AND purged_at IS NULL
              AND decided_at < $1
            ORDER BY decided_at ASC
            LIMIT $2
            "#,
        )
        .bind(decided_before)
        .bind(to_bigint(limit, "purge batch size")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres purge scan failed: {e}")))?;
        decode_ids(&rows)
    }

    async fn purge(&self, id: TicketId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.mutate(id, |ticket| Ok(anonymize(ticket, now))).await
    }

    async fn list_stalled(&self, idle_since: DateTime<Utc>) -> StoreResult<Vec<TicketId>> {
        let rows = sqlx::query(
            r#"
            SELECT ticket_id
            FROM ikyc_tickets
            WHERE status IN ('pending', 'processing')
              AND updated_at < $1
            "#,
        )
        .bind(idle_since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres stall scan failed: {e}")))?;
        decode_ids(&rows)
    }
}

#[derive(Debug, Clone)]
enum AuditStorageBackend {
    Memory,
    Postgres(PostgresAuditStore),
}

/// Audit log wrapper that persists every entry before it joins the chain.
///
/// On bootstrap the live entries and the latest rotation checkpoint are read
/// back and the chain is verified before the process accepts work.
#[derive(Debug, Clone)]
pub struct PersistentAuditLog {
    log: AuditLog,
    backend: AuditStorageBackend,
}

impl PersistentAuditLog {
    pub fn in_memory() -> Self {
        Self {
            log: AuditLog::new(),
            backend: AuditStorageBackend::Memory,
        }
    }

    pub async fn bootstrap(config: &TicketStorageConfig) -> Result<Self, IKycError> {
        match config {
            TicketStorageConfig::Memory => Ok(Self::in_memory()),
            TicketStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresAuditStore::connect(database_url, *max_connections).await?;
                store.ensure_schema().await?;
                let checkpoint = store.load_checkpoint().await?;
                let entries = store.load_entries().await?;
                let log = AuditLog::from_entries(checkpoint, entries)?;
                tracing::info!(
                    live_entries = log.len(),
                    resumed_after = log.checkpoint().map(|c| c.last_index),
                    "Audit chain restored and verified"
                );
                Ok(Self {
                    log,
                    backend: AuditStorageBackend::Postgres(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            AuditStorageBackend::Memory => "memory",
            AuditStorageBackend::Postgres(_) => "postgres",
        }
    }

    pub fn entries(&self) -> &[AuditEntry] {
        self.log.entries()
    }

    pub fn entries_for(&self, ticket_id: TicketId) -> impl Iterator<Item = &AuditEntry> {
        self.log.entries_for(ticket_id)
    }

    pub fn checkpoint(&self) -> Option<&AuditCheckpoint> {
        self.log.checkpoint()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn verify_chain(&self) -> bool {
        self.log.verify_chain()
    }

    pub async fn append_event(
        &mut self,
        ticket_id: Option<TicketId>,
        kind: AuditKind,
        event: AuditEvent,
    ) -> Result<AuditEntry, IKycError> {
        let payload = serde_json::to_value(event)?;
        let entry = self.log.build_entry(ticket_id, kind, payload)?;
        if let AuditStorageBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }
        self.log.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Seal every entry older than `cutoff` and drop it from the live chain.
    ///
    /// Postgres moves the sealed entries into `ikyc_audit_segments` in the
    /// same transaction that deletes them from the live table. The memory
    /// backend hands the segment back to the caller and keeps nothing.
    pub async fn rotate(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<AuditSegment>, IKycError> {
        let Some(segment) = self.log.seal(cutoff) else {
            return Ok(None);
        };
        if let AuditStorageBackend::Postgres(store) = &self.backend {
            store.archive_segment(&segment).await?;
        }
        self.log.evict(&segment)?;
        tracing::info!(
            segment_id = %segment.segment_id,
            entries = segment.entries.len(),
            backend = self.backend_label(),
            "Audit segment sealed and evicted"
        );
        Ok(Some(segment))
    }
}

/// PostgreSQL audit store: one row per live entry plus one row per sealed
/// segment.
#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, IKycError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| IKycError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), IKycError> {
        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS ikyc_audit_entries (
                entry_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                ticket_id TEXT NULL,
                kind TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ikyc_audit_segments (
                segment_id TEXT PRIMARY KEY,
                first_index BIGINT NOT NULL,
                last_index BIGINT NOT NULL UNIQUE,
                opening_hash TEXT NULL,
                closing_hash TEXT NOT NULL,
                sealed_at TIMESTAMPTZ NOT NULL,
                entries JSONB NOT NULL
            )
            "#,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| IKycError::Storage(format!("postgres audit schema failed: {e}")))?;
        }
        Ok(())
    }

    pub async fn load_checkpoint(&self) -> Result<Option<AuditCheckpoint>, IKycError> {
        let row = sqlx::query(
            r#"
            SELECT segment_id, last_index, closing_hash, sealed_at
            FROM ikyc_audit_segments
            ORDER BY last_index DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres load checkpoint failed: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_index: i64 = audit_column(&row, "last_index")?;
        Ok(Some(AuditCheckpoint {
            segment_id: audit_column(&row, "segment_id")?,
            last_index: from_bigint(last_index)?,
            closing_hash: audit_column(&row, "closing_hash")?,
            sealed_at: audit_column(&row, "sealed_at")?,
        }))
    }

    pub async fn load_entries(&self) -> Result<Vec<AuditEntry>, IKycError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_index, entry_id, ticket_id, kind, entry_timestamp,
                   payload, previous_hash, entry_hash
            FROM ikyc_audit_entries
            ORDER BY entry_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres load audit entries failed: {e}")))?;

        rows.iter().map(decode_audit_entry).collect()
    }

    pub async fn insert_entry(&self, entry: &AuditEntry) -> Result<(), IKycError> {
        sqlx::query(
            r#"
            INSERT INTO ikyc_audit_entries (
                entry_index, entry_id, ticket_id, kind, entry_timestamp,
                payload, previous_hash, entry_hash
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(to_bigint_u64(entry.index)?)
        .bind(&entry.entry_id)
        .bind(entry.ticket_id.map(|id| id.to_string()))
        .bind(entry.kind.as_str())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres insert audit entry failed: {e}")))?;
        Ok(())
    }

    pub async fn archive_segment(&self, segment: &AuditSegment) -> Result<(), IKycError> {
        let entries = serde_json::to_value(&segment.entries)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IKycError::Storage(format!("postgres begin failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO ikyc_audit_segments (
                segment_id, first_index, last_index, opening_hash,
                closing_hash, sealed_at, entries
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&segment.segment_id)
        .bind(to_bigint_u64(segment.first_index)?)
        .bind(to_bigint_u64(segment.last_index)?)
        .bind(&segment.opening_hash)
        .bind(&segment.closing_hash)
        .bind(segment.sealed_at)
        .bind(entries)
        .execute(&mut *tx)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres insert audit segment failed: {e}")))?;

        sqlx::query("DELETE FROM ikyc_audit_entries WHERE entry_index <= $1")
            .bind(to_bigint_u64(segment.last_index)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| IKycError::Storage(format!("postgres evict audit entries failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| IKycError::Storage(format!("postgres commit failed: {e}")))
    }

    /// Sealed segments, oldest first.
    pub async fn load_segments(&self) -> Result<Vec<AuditSegment>, IKycError> {
        let rows = sqlx::query(
            r#"
            SELECT segment_id, first_index, last_index, opening_hash,
                   closing_hash, sealed_at, entries
            FROM ikyc_audit_segments
            ORDER BY last_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IKycError::Storage(format!("postgres load audit segments failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let first_index: i64 = audit_column(row, "first_index")?;
                let last_index: i64 = audit_column(row, "last_index")?;
                let entries: serde_json::Value = audit_column(row, "entries")?;
                Ok(AuditSegment {
                    segment_id: audit_column(row, "segment_id")?,
                    first_index: from_bigint(first_index)?,
                    last_index: from_bigint(last_index)?,
                    opening_hash: audit_column(row, "opening_hash")?,
                    closing_hash: audit_column(row, "closing_hash")?,
                    sealed_at: audit_column(row, "sealed_at")?,
                    entries: serde_json::from_value(entries)?,
                })
            })
            .collect()
    }
}

fn audit_column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, IKycError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| IKycError::Storage(format!("postgres decode {column} failed: {e}")))
}

fn decode_audit_entry(row: &PgRow) -> Result<AuditEntry, IKycError> {
    let index: i64 = audit_column(row, "entry_index")?;
    let ticket_id: Option<String> = audit_column(row, "ticket_id")?;
    let kind: String = audit_column(row, "kind")?;
    Ok(AuditEntry {
        entry_id: audit_column(row, "entry_id")?,
        index: from_bigint(index)?,
        ticket_id: ticket_id.as_deref().map(TicketId::parse).transpose()?,
        kind: AuditKind::parse(&kind)?,
        timestamp: audit_column(row, "entry_timestamp")?,
        payload: audit_column(row, "payload")?,
        previous_hash: audit_column(row, "previous_hash")?,
        entry_hash: audit_column(row, "entry_hash")?,
    })
}

fn to_bigint_u64(value: u64) -> Result<i64, IKycError> {
    i64::try_from(value)
        .map_err(|_| IKycError::Ledger("audit index exceeds postgres BIGINT range".to_string()))
}

fn from_bigint(value: i64) -> Result<u64, IKycError> {
    u64::try_from(value)
        .map_err(|_| IKycError::Ledger(format!("negative audit index {value} in storage")))
}
