//! Persistence seams, store implementations, and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info_span, warn};
use unify_core::{
    normalize_phone_last10, CanonicalClient, MergeConflict, RawStagedRecord, RecoveryJobState,
    Source, SyncRun, SyncStatus,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-store";

/// In-flight recovery checkpoints go stale after this long.
pub const JOB_STATE_INFLIGHT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Completed recovery results are served as a cache for this long.
pub const JOB_STATE_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an active sync run already exists for source {0}")]
    ActiveRunExists(Source),
    #[error("sync run {0} not found")]
    RunNotFound(Uuid),
    #[error("sync run {id} is {status}, expected an active run")]
    InvalidRunState { id: Uuid, status: SyncStatus },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Sync-run rows. `try_start` is the single-flight gate: the active-run check
/// and the insert happen behind one lock (memory) or one guarded INSERT
/// (Postgres), so two local callers cannot both claim a source. The window
/// between independent processes remains and is reclaimed by the idle sweep.
#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn try_start(&self, source: Source, dry_run: bool) -> Result<SyncRun, StoreError>;
    async fn get(&self, id: Uuid) -> Result<SyncRun, StoreError>;
    async fn update(&self, run: &SyncRun) -> Result<(), StoreError>;
    /// The run currently holding the source's single-flight slot, if any:
    /// running, continuing, or paused.
    async fn find_active(&self, source: Source) -> Result<Option<SyncRun>, StoreError>;
    /// Force-fail active runs whose last checkpoint update is older than the
    /// threshold. Returns the number of runs reclaimed.
    async fn sweep_stale(
        &self,
        source: Source,
        idle_threshold: Duration,
        message: &str,
    ) -> Result<u64, StoreError>;
}

/// Canonical-client rows. Lookups mirror the identity precedence signals;
/// writes are keyed by client id and rely on store-level atomicity, not
/// application locks.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalClient>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<CanonicalClient>, StoreError>;
    async fn find_by_platform_id(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<CanonicalClient>, StoreError>;
    async fn find_by_phone_key(&self, last10: &str) -> Result<Option<CanonicalClient>, StoreError>;
    async fn insert(&self, client: &CanonicalClient) -> Result<(), StoreError>;
    async fn update(&self, client: &CanonicalClient) -> Result<(), StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Raw payload staging: idempotent last-fetch-wins upsert per
/// (source, external_id). Purely an audit/replay cache.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn stage(&self, record: RawStagedRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ConflictStore: Send + Sync {
    async fn record(&self, conflict: MergeConflict) -> Result<(), StoreError>;
    async fn open_conflicts(&self) -> Result<Vec<MergeConflict>, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Single-process store used by tests and local/dry runs. One `RwLock` per
/// table; `try_start` holds the runs write lock across check and insert.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<Uuid, SyncRun>>,
    clients: RwLock<HashMap<Uuid, CanonicalClient>>,
    staged: RwLock<HashMap<(Source, String), RawStagedRecord>>,
    conflicts: RwLock<Vec<MergeConflict>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SyncRunStore for MemoryStore {
    async fn try_start(&self, source: Source, dry_run: bool) -> Result<SyncRun, StoreError> {
        let mut runs = self.runs.write().await;
        if runs
            .values()
            .any(|r| r.source == source && r.status.holds_source_slot())
        {
            return Err(StoreError::ActiveRunExists(source));
        }
        let run = SyncRun::new(source, dry_run);
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> Result<SyncRun, StoreError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn update(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(&run.id) {
            return Err(StoreError::RunNotFound(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn find_active(&self, source: Source) -> Result<Option<SyncRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .find(|r| r.source == source && r.status.holds_source_slot())
            .cloned())
    }

    async fn sweep_stale(
        &self,
        source: Source,
        idle_threshold: Duration,
        message: &str,
    ) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let mut swept = 0u64;
        let mut runs = self.runs.write().await;
        for run in runs.values_mut() {
            if run.source == source && run.status.is_active() && run.updated_at < cutoff {
                run.status = SyncStatus::Failed;
                run.error_message = Some(message.to_string());
                run.completed_at = Some(Utc::now());
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalClient>, StoreError> {
        Ok(self.clients.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<CanonicalClient>, StoreError> {
        Ok(self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.email.as_deref() == Some(email))
            .min_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_by_platform_id(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<CanonicalClient>, StoreError> {
        Ok(self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.platform_id(source) == Some(external_id))
            .min_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_by_phone_key(&self, last10: &str) -> Result<Option<CanonicalClient>, StoreError> {
        Ok(self
            .clients
            .read()
            .await
            .values()
            .filter(|c| {
                c.phone
                    .as_deref()
                    .and_then(normalize_phone_last10)
                    .as_deref()
                    == Some(last10)
            })
            .min_by_key(|c| c.created_at)
            .cloned())
    }

    async fn insert(&self, client: &CanonicalClient) -> Result<(), StoreError> {
        self.clients
            .write()
            .await
            .insert(client.id, client.clone());
        Ok(())
    }

    async fn update(&self, client: &CanonicalClient) -> Result<(), StoreError> {
        self.clients
            .write()
            .await
            .insert(client.id, client.clone());
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.clients.read().await.len() as u64)
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn stage(&self, record: RawStagedRecord) -> Result<(), StoreError> {
        self.staged
            .write()
            .await
            .insert((record.source, record.external_id.clone()), record);
        Ok(())
    }
}

#[async_trait]
impl ConflictStore for MemoryStore {
    async fn record(&self, conflict: MergeConflict) -> Result<(), StoreError> {
        self.conflicts.write().await.push(conflict);
        Ok(())
    }

    async fn open_conflicts(&self) -> Result<Vec<MergeConflict>, StoreError> {
        Ok(self
            .conflicts
            .read()
            .await
            .iter()
            .filter(|c| c.status == unify_core::ConflictStatus::Open)
            .cloned()
            .collect())
    }
}

impl MemoryStore {
    /// Test/report helper: snapshot of every staged record.
    pub async fn staged_records(&self) -> Vec<RawStagedRecord> {
        self.staged.read().await.values().cloned().collect()
    }

    pub async fn all_clients(&self) -> Vec<CanonicalClient> {
        self.clients.read().await.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sync_runs (
    id UUID PRIMARY KEY,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    checkpoint TEXT,
    total_fetched BIGINT NOT NULL DEFAULT 0,
    total_inserted BIGINT NOT NULL DEFAULT 0,
    total_updated BIGINT NOT NULL DEFAULT 0,
    total_skipped BIGINT NOT NULL DEFAULT 0,
    total_conflicts BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    dry_run BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS clients (
    id UUID PRIMARY KEY,
    email TEXT UNIQUE,
    phone TEXT,
    phone_key TEXT,
    full_name TEXT,
    ghl_contact_id TEXT,
    manychat_subscriber_id TEXT,
    stripe_customer_id TEXT,
    paypal_customer_id TEXT,
    tracking JSONB NOT NULL DEFAULT '{}'::jsonb,
    opt_ins JSONB NOT NULL DEFAULT '{}'::jsonb,
    tags JSONB NOT NULL DEFAULT '[]'::jsonb,
    lifecycle_stage TEXT NOT NULL DEFAULT 'LEAD',
    total_spend DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_paid DOUBLE PRECISION NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS clients_phone_key_idx ON clients (phone_key);

CREATE TABLE IF NOT EXISTS raw_staged_records (
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    payload JSONB NOT NULL,
    payload_hash TEXT NOT NULL,
    sync_run_id UUID NOT NULL,
    fetched_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (source, external_id)
);

CREATE TABLE IF NOT EXISTS merge_conflicts (
    id UUID PRIMARY KEY,
    source TEXT NOT NULL,
    candidate_ids JSONB NOT NULL,
    incoming JSONB NOT NULL,
    reason TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_from_str(raw: &str) -> Result<SyncStatus, StoreError> {
    let status = match raw {
        "running" => SyncStatus::Running,
        "continuing" => SyncStatus::Continuing,
        "completed" => SyncStatus::Completed,
        "completed_with_errors" => SyncStatus::CompletedWithErrors,
        "failed" => SyncStatus::Failed,
        "canceled" => SyncStatus::Canceled,
        "paused" => SyncStatus::Paused,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown sync status in database: {other}"
            )))
        }
    };
    Ok(status)
}

fn run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let source_raw: String = row.try_get("source")?;
    let status_raw: String = row.try_get("status")?;
    let source = source_raw
        .parse::<Source>()
        .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        source,
        status: status_from_str(&status_raw)?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        checkpoint: row.try_get("checkpoint")?,
        counters: unify_core::SyncCounters {
            fetched: row.try_get::<i64, _>("total_fetched")? as u64,
            inserted: row.try_get::<i64, _>("total_inserted")? as u64,
            updated: row.try_get::<i64, _>("total_updated")? as u64,
            skipped: row.try_get::<i64, _>("total_skipped")? as u64,
            conflicts: row.try_get::<i64, _>("total_conflicts")? as u64,
        },
        error_message: row.try_get("error_message")?,
        dry_run: row.try_get("dry_run")?,
    })
}

fn client_from_row(row: &PgRow) -> Result<CanonicalClient, StoreError> {
    let tracking: JsonValue = row.try_get("tracking")?;
    let opt_ins: JsonValue = row.try_get("opt_ins")?;
    let tags: JsonValue = row.try_get("tags")?;
    let stage_raw: String = row.try_get("lifecycle_stage")?;
    let lifecycle_stage = serde_json::from_value(JsonValue::String(stage_raw))
        .context("decoding lifecycle_stage")?;
    Ok(CanonicalClient {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        full_name: row.try_get("full_name")?,
        ghl_contact_id: row.try_get("ghl_contact_id")?,
        manychat_subscriber_id: row.try_get("manychat_subscriber_id")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        paypal_customer_id: row.try_get("paypal_customer_id")?,
        tracking: serde_json::from_value(tracking).context("decoding tracking")?,
        opt_ins: serde_json::from_value(opt_ins).context("decoding opt_ins")?,
        tags: serde_json::from_value(tags).context("decoding tags")?,
        lifecycle_stage,
        total_spend: row.try_get("total_spend")?,
        total_paid: row.try_get("total_paid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const CLIENT_COLUMNS: &str = "id, email, phone, full_name, ghl_contact_id, \
     manychat_subscriber_id, stripe_customer_id, paypal_customer_id, tracking, \
     opt_ins, tags, lifecycle_stage, total_spend, total_paid, created_at, updated_at";

fn platform_id_column(source: Source) -> Option<&'static str> {
    match source {
        Source::GhlContacts => Some("ghl_contact_id"),
        Source::ManychatSubscribers => Some("manychat_subscriber_id"),
        Source::StripeCustomers => Some("stripe_customer_id"),
        Source::PaypalCustomers => Some("paypal_customer_id"),
        Source::Invoices | Source::Dunning | Source::RevenueRecovery => None,
    }
}

#[async_trait]
impl SyncRunStore for PgStore {
    async fn try_start(&self, source: Source, dry_run: bool) -> Result<SyncRun, StoreError> {
        let run = SyncRun::new(source, dry_run);
        // Guarded insert: the NOT EXISTS subquery and the insert execute as
        // one statement, which is the compare-and-set for none -> running.
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, source, status, started_at, updated_at, checkpoint, dry_run)
            SELECT $1, $2, 'running', $3, $3, NULL, $4
             WHERE NOT EXISTS (
                   SELECT 1 FROM sync_runs
                    WHERE source = $2
                      AND status IN ('running', 'continuing', 'paused')
             )
            "#,
        )
        .bind(run.id)
        .bind(source.as_str())
        .bind(run.started_at)
        .bind(dry_run)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ActiveRunExists(source));
        }
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> Result<SyncRun, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(StoreError::RunNotFound(id)),
        }
    }

    async fn update(&self, run: &SyncRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   updated_at = $3,
                   completed_at = $4,
                   checkpoint = $5,
                   total_fetched = $6,
                   total_inserted = $7,
                   total_updated = $8,
                   total_skipped = $9,
                   total_conflicts = $10,
                   error_message = $11
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.to_string())
        .bind(run.updated_at)
        .bind(run.completed_at)
        .bind(&run.checkpoint)
        .bind(run.counters.fetched as i64)
        .bind(run.counters.inserted as i64)
        .bind(run.counters.updated as i64)
        .bind(run.counters.skipped as i64)
        .bind(run.counters.conflicts as i64)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn find_active(&self, source: Source) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_runs
             WHERE source = $1 AND status IN ('running', 'continuing', 'paused')
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn sweep_stale(
        &self,
        source: Source,
        idle_threshold: Duration,
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = 'failed',
                   error_message = $3,
                   completed_at = NOW()
             WHERE source = $1
               AND status IN ('running', 'continuing')
               AND updated_at < NOW() - ($2 * INTERVAL '1 second')
            "#,
        )
        .bind(source.as_str())
        .bind(idle_threshold.as_secs_f64())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ClientStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalClient>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<CanonicalClient>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE email = $1 ORDER BY created_at LIMIT 1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    async fn find_by_platform_id(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<CanonicalClient>, StoreError> {
        let Some(column) = platform_id_column(source) else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE {column} = $1 ORDER BY created_at LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    async fn find_by_phone_key(&self, last10: &str) -> Result<Option<CanonicalClient>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE phone_key = $1 ORDER BY created_at LIMIT 1"
        ))
        .bind(last10)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    async fn insert(&self, client: &CanonicalClient) -> Result<(), StoreError> {
        let phone_key = client.phone.as_deref().and_then(normalize_phone_last10);
        sqlx::query(
            r#"
            INSERT INTO clients
                (id, email, phone, phone_key, full_name, ghl_contact_id,
                 manychat_subscriber_id, stripe_customer_id, paypal_customer_id,
                 tracking, opt_ins, tags, lifecycle_stage, total_spend,
                 total_paid, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17)
            "#,
        )
        .bind(client.id)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(phone_key)
        .bind(&client.full_name)
        .bind(&client.ghl_contact_id)
        .bind(&client.manychat_subscriber_id)
        .bind(&client.stripe_customer_id)
        .bind(&client.paypal_customer_id)
        .bind(serde_json::to_value(&client.tracking).context("encoding tracking")?)
        .bind(serde_json::to_value(&client.opt_ins).context("encoding opt_ins")?)
        .bind(serde_json::to_value(&client.tags).context("encoding tags")?)
        .bind(serde_json::to_value(client.lifecycle_stage).context("encoding stage")?
            .as_str()
            .unwrap_or("LEAD")
            .to_string())
        .bind(client.total_spend)
        .bind(client.total_paid)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, client: &CanonicalClient) -> Result<(), StoreError> {
        let phone_key = client.phone.as_deref().and_then(normalize_phone_last10);
        sqlx::query(
            r#"
            UPDATE clients
               SET email = $2,
                   phone = $3,
                   phone_key = $4,
                   full_name = $5,
                   ghl_contact_id = $6,
                   manychat_subscriber_id = $7,
                   stripe_customer_id = $8,
                   paypal_customer_id = $9,
                   tracking = $10,
                   opt_ins = $11,
                   tags = $12,
                   lifecycle_stage = $13,
                   total_spend = $14,
                   total_paid = $15,
                   updated_at = $16
             WHERE id = $1
            "#,
        )
        .bind(client.id)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(phone_key)
        .bind(&client.full_name)
        .bind(&client.ghl_contact_id)
        .bind(&client.manychat_subscriber_id)
        .bind(&client.stripe_customer_id)
        .bind(&client.paypal_customer_id)
        .bind(serde_json::to_value(&client.tracking).context("encoding tracking")?)
        .bind(serde_json::to_value(&client.opt_ins).context("encoding opt_ins")?)
        .bind(serde_json::to_value(&client.tags).context("encoding tags")?)
        .bind(serde_json::to_value(client.lifecycle_stage).context("encoding stage")?
            .as_str()
            .unwrap_or("LEAD")
            .to_string())
        .bind(client.total_spend)
        .bind(client.total_paid)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM clients")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn stage(&self, record: RawStagedRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO raw_staged_records
                (source, external_id, payload, payload_hash, sync_run_id, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source, external_id) DO UPDATE
               SET payload = EXCLUDED.payload,
                   payload_hash = EXCLUDED.payload_hash,
                   sync_run_id = EXCLUDED.sync_run_id,
                   fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(record.source.as_str())
        .bind(&record.external_id)
        .bind(&record.payload)
        .bind(&record.payload_hash)
        .bind(record.sync_run_id)
        .bind(record.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConflictStore for PgStore {
    async fn record(&self, conflict: MergeConflict) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO merge_conflicts
                (id, source, candidate_ids, incoming, reason, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'open', $6)
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.source.as_str())
        .bind(serde_json::to_value(&conflict.candidate_ids).context("encoding candidates")?)
        .bind(serde_json::to_value(&conflict.incoming).context("encoding incoming")?)
        .bind(
            serde_json::to_value(conflict.reason)
                .context("encoding reason")?
                .as_str()
                .unwrap_or("ambiguous_identity")
                .to_string(),
        )
        .bind(conflict.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_conflicts(&self) -> Result<Vec<MergeConflict>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source, candidate_ids, incoming, reason, created_at \
             FROM merge_conflicts WHERE status = 'open' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source_raw: String = row.try_get("source")?;
            let reason_raw: String = row.try_get("reason")?;
            out.push(MergeConflict {
                id: row.try_get("id")?,
                source: source_raw
                    .parse()
                    .map_err(|e: String| StoreError::Backend(anyhow::anyhow!(e)))?,
                candidate_ids: serde_json::from_value(row.try_get("candidate_ids")?)
                    .context("decoding candidates")?,
                incoming: serde_json::from_value(row.try_get("incoming")?)
                    .context("decoding incoming")?,
                reason: serde_json::from_value(JsonValue::String(reason_raw))
                    .context("decoding reason")?,
                status: unify_core::ConflictStatus::Open,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Client-local recovery job state
// ---------------------------------------------------------------------------

/// File-backed checkpoint blob for the recovery processor, keyed by job type.
/// Reads apply the embedded-timestamp expiry; all failures are best-effort
/// (a warning, never an error) since correctness does not depend on this
/// cache surviving.
#[derive(Debug, Clone)]
pub struct JobStateStore {
    root: PathBuf,
}

impl JobStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Load the saved state for `key`, dropping it when expired: 2 hours for
    /// an in-flight checkpoint, 24 hours for a completed-result cache.
    pub async fn read(&self, key: &str) -> Option<RecoveryJobState> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(key, error = %err, "failed to read job state; treating as absent");
                return None;
            }
        };
        let state: RecoveryJobState = match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(err) => {
                warn!(key, error = %err, "corrupt job state; discarding");
                self.clear(key).await;
                return None;
            }
        };
        let ttl = if state.completed {
            JOB_STATE_RESULT_TTL
        } else {
            JOB_STATE_INFLIGHT_TTL
        };
        let age = Utc::now().signed_duration_since(state.timestamp);
        if age.num_seconds() < 0 || age.to_std().map(|a| a > ttl).unwrap_or(true) {
            self.clear(key).await;
            return None;
        }
        Some(state)
    }

    /// Atomic write via temp file + rename, same discipline as artifact
    /// stores: a reader never observes a partially written blob.
    pub async fn write(&self, key: &str, state: &RecoveryJobState) {
        if let Err(err) = self.write_inner(key, state).await {
            warn!(key, error = %err, "failed to persist job state; continuing without it");
        }
    }

    async fn write_inner(&self, key: &str, state: &RecoveryJobState) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating job state dir {}", self.root.display()))?;
        let bytes = serde_json::to_vec_pretty(state).context("serializing job state")?;
        let path = self.path_for(key);
        let temp_path = self.root.join(format!(".{}.{key}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp job state {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp job state {}", temp_path.display()))?;
        file.flush().await.context("flushing temp job state")?;
        drop(file);
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("renaming job state into place {}", path.display()));
        }
        Ok(())
    }

    pub async fn clear(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %err, "failed to clear job state");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Vendor auth rejections are fatal, everything else transport-retryable.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            FetchError::HttpStatus { status, .. } if *status == 401 || *status == 403
        )
    }
}

/// Shared outbound HTTP client: retry with exponential backoff, bounded
/// per-source concurrency, optional token-bucket rate limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Decode {
            url: url.to_string(),
            message: "fetcher shut down".to_string(),
        })?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("vendor_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(|err| {
                            FetchError::Decode {
                                url: final_url,
                                message: err.to_string(),
                            }
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::Decode {
                url: url.to_string(),
                message: "retry loop exhausted without a captured error".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use unify_core::SyncCounters;

    #[test]
    fn payload_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_delays_double_then_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        // Past the cap the delay stays flat, even for absurd attempt counts.
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn try_start_enforces_single_flight_per_source() {
        let store = MemoryStore::new();
        let run = store
            .try_start(Source::GhlContacts, false)
            .await
            .expect("first start");
        let second = store.try_start(Source::GhlContacts, false).await;
        assert!(matches!(second, Err(StoreError::ActiveRunExists(_))));

        // A different source is an independent state machine.
        store
            .try_start(Source::StripeCustomers, false)
            .await
            .expect("other source starts");

        let mut done = SyncRunStore::get(&store, run.id).await.unwrap();
        done.status = SyncStatus::Completed;
        SyncRunStore::update(&store, &done).await.unwrap();
        store
            .try_start(Source::GhlContacts, false)
            .await
            .expect("start after terminal");
    }

    #[tokio::test]
    async fn staging_upsert_is_last_fetch_wins() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        for version in ["one", "two"] {
            let payload = serde_json::json!({ "v": version });
            let payload_hash = sha256_hex(payload.to_string().as_bytes());
            store
                .stage(RawStagedRecord {
                    source: Source::ManychatSubscribers,
                    external_id: "sub_1".to_string(),
                    payload,
                    payload_hash,
                    sync_run_id: run_id,
                    fetched_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let staged = store.staged_records().await;
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].payload["v"], "two");
    }

    #[tokio::test]
    async fn sweep_fails_only_idle_runs() {
        let store = MemoryStore::new();
        let idle = store.try_start(Source::GhlContacts, false).await.unwrap();
        let mut backdated = SyncRunStore::get(&store, idle.id).await.unwrap();
        backdated.updated_at = Utc::now() - chrono::Duration::minutes(45);
        SyncRunStore::update(&store, &backdated).await.unwrap();

        let fresh = store
            .try_start(Source::StripeCustomers, false)
            .await
            .unwrap();

        let swept = store
            .sweep_stale(
                Source::GhlContacts,
                Duration::from_secs(30 * 60),
                "sync abandoned after idle timeout",
            )
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert_eq!(
            SyncRunStore::get(&store, idle.id).await.unwrap().status,
            SyncStatus::Failed
        );
        assert_eq!(
            SyncRunStore::get(&store, fresh.id).await.unwrap().status,
            SyncStatus::Running
        );

        // The single-flight slot is free again.
        store.try_start(Source::GhlContacts, false).await.unwrap();
    }

    #[tokio::test]
    async fn job_state_round_trips_and_expires() {
        let dir = tempdir().expect("tempdir");
        let store = JobStateStore::new(dir.path());

        assert!(store.read("revenue-recovery").await.is_none());

        let mut state = RecoveryJobState {
            hours_lookback: 72,
            sync_run_id: Uuid::new_v4(),
            cursor: Some("page-3".to_string()),
            batches_done: 3,
            succeeded: 12,
            failed: 2,
            skipped: 1,
            recovered_amount: 840.0,
            failed_amount: 120.0,
            skipped_amount: 0.0,
            completed: false,
            timestamp: Utc::now(),
        };
        store.write("revenue-recovery", &state).await;
        let loaded = store.read("revenue-recovery").await.expect("fresh state");
        assert_eq!(loaded.cursor.as_deref(), Some("page-3"));

        // In-flight state older than two hours is dropped on read.
        state.timestamp = Utc::now() - chrono::Duration::hours(3);
        store.write("revenue-recovery", &state).await;
        assert!(store.read("revenue-recovery").await.is_none());

        // A completed result survives longer, up to 24 hours.
        state.completed = true;
        state.timestamp = Utc::now() - chrono::Duration::hours(3);
        store.write("revenue-recovery", &state).await;
        assert!(store.read("revenue-recovery").await.is_some());

        state.timestamp = Utc::now() - chrono::Duration::hours(25);
        store.write("revenue-recovery", &state).await;
        assert!(store.read("revenue-recovery").await.is_none());
    }

    #[tokio::test]
    async fn counters_absorb_accumulates() {
        let mut total = SyncCounters::default();
        total.absorb(SyncCounters {
            fetched: 60,
            inserted: 40,
            updated: 15,
            skipped: 3,
            conflicts: 2,
        });
        total.absorb(SyncCounters {
            fetched: 40,
            inserted: 10,
            updated: 28,
            skipped: 1,
            conflicts: 1,
        });
        assert_eq!(total.fetched, 100);
        assert_eq!(total.inserted, 50);
        assert_eq!(total.updated, 43);
        assert_eq!(total.skipped, 4);
        assert_eq!(total.conflicts, 3);
    }
}
