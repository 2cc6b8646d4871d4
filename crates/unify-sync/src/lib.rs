//! Sync orchestration: identity resolution, run lifecycle, revenue recovery.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use unify_adapters::{
    AdapterError, AdapterRegistry, FetchPage, HttpAdapterRegistry, HttpRecoveryGateway,
    RecoveryGateway, VendorConfig,
};
use unify_core::{
    normalize_email, normalize_phone_last10, CanonicalClient, ConflictReason, MergeConflict,
    NormalizedContact, RawStagedRecord, RecoveryItem, RecoveryJobState, ResolveAction, Source,
    SyncCounters, SyncRun, SyncStatus,
};
use unify_store::{
    sha256_hex, ClientStore, ConflictStore, HttpClientConfig, HttpFetcher, JobStateStore,
    MemoryStore, PgStore, StagingStore, StoreError, SyncRunStore, TokenBucketConfig,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-sync";

/// Idle runs older than this are reclaimed by the sweep.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
/// Hard ceiling on recovery batches, regardless of what the remote reports.
pub const DEFAULT_RECOVERY_MAX_BATCHES: u32 = 500;
/// Records resolved concurrently within one page.
const RESOLVE_BATCH: usize = 10;

const IDLE_TIMEOUT_MESSAGE: &str = "sync abandoned after idle timeout";
const RECOVERY_JOB_KEY: &str = "revenue-recovery";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("an active sync run already exists for source {0}")]
    Conflict(Source),
    #[error("sync run {0} not found")]
    RunNotFound(Uuid),
    #[error("sync run {id} is {status}; operation requires {expected}")]
    InvalidState {
        id: Uuid,
        status: SyncStatus,
        expected: &'static str,
    },
    #[error("no adapter registered for source {0}")]
    NoAdapter(Source),
    // `origin` rather than `source`: thiserror reserves that field name for
    // the cause chain, which `Source` cannot satisfy.
    #[error("transport failure for {origin}: {message}")]
    Transport { origin: Source, message: String },
    #[error("vendor credential rejected for {origin}: {message}")]
    Auth { origin: Source, message: String },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ActiveRunExists(source) => SyncError::Conflict(source),
            StoreError::RunNotFound(id) => SyncError::RunNotFound(id),
            other => SyncError::Store(other),
        }
    }
}

fn classify_adapter_error(source: Source, err: AdapterError) -> SyncError {
    if err.is_auth() {
        SyncError::Auth {
            origin: source,
            message: err.to_string(),
        }
    } else {
        SyncError::Transport {
            origin: source,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// How one class of canonical-client fields absorbs an incoming observation.
/// This table is the single most behaviorally significant rule in the
/// system, so it is named data, not inline conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Identity fields: fill only when currently null, never overwrite.
    FillIfNull,
    /// Session-scoped attribution: the newest observation always wins.
    LastWriteWins,
    /// Consent flags: overwrite only when the incoming value is present.
    OverwriteIfSome,
    /// Tags: set union, never replacement.
    Union,
    /// Lifecycle stage: move forward only.
    AdvanceOnly,
    /// Platform IDs: fill when null; a differing non-null value is an
    /// identity conflict, not an overwrite.
    FillOrConflict,
    /// Monetary aggregates: only payment-observing sources may lower a
    /// non-zero value.
    TrustedOverwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Email,
    Phone,
    FullName,
    Tracking,
    OptIns,
    Tags,
    LifecycleStage,
    PlatformId,
    MonetaryAggregates,
}

pub const MERGE_POLICY_TABLE: &[(FieldKind, MergePolicy)] = &[
    (FieldKind::Email, MergePolicy::FillIfNull),
    (FieldKind::Phone, MergePolicy::FillIfNull),
    (FieldKind::FullName, MergePolicy::FillIfNull),
    (FieldKind::Tracking, MergePolicy::LastWriteWins),
    (FieldKind::OptIns, MergePolicy::OverwriteIfSome),
    (FieldKind::Tags, MergePolicy::Union),
    (FieldKind::LifecycleStage, MergePolicy::AdvanceOnly),
    (FieldKind::PlatformId, MergePolicy::FillOrConflict),
    (FieldKind::MonetaryAggregates, MergePolicy::TrustedOverwrite),
];

pub fn policy_for(field: FieldKind) -> MergePolicy {
    MERGE_POLICY_TABLE
        .iter()
        .find(|(kind, _)| *kind == field)
        .map(|(_, policy)| *policy)
        .unwrap_or(MergePolicy::FillIfNull)
}

fn fill_if_null(target: &mut Option<String>, incoming: Option<&str>) {
    if target.is_none() {
        if let Some(value) = incoming {
            if !value.trim().is_empty() {
                *target = Some(value.to_string());
            }
        }
    }
}

fn overwrite_if_some<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value.clone());
    }
}

/// Apply one normalized record to a client under the policy table. Returns
/// the conflict reason instead of mutating when a platform ID disagrees.
pub fn apply_merge(
    client: &mut CanonicalClient,
    incoming: &NormalizedContact,
    source: Source,
) -> Result<(), ConflictReason> {
    // Platform ID first: a mismatch must leave the client untouched.
    if client.platform_id(source).is_some()
        && client.platform_id(source) != Some(incoming.external_id.as_str())
    {
        debug_assert_eq!(policy_for(FieldKind::PlatformId), MergePolicy::FillOrConflict);
        return Err(ConflictReason::PlatformIdMismatch);
    }

    let normalized_email = incoming.email.as_deref().and_then(normalize_email);
    debug_assert_eq!(policy_for(FieldKind::Email), MergePolicy::FillIfNull);
    fill_if_null(&mut client.email, normalized_email.as_deref());
    fill_if_null(&mut client.phone, incoming.phone.as_deref());
    fill_if_null(&mut client.full_name, incoming.full_name.as_deref());

    if client.platform_id(source).is_none() {
        client.set_platform_id(source, incoming.external_id.clone());
    }

    debug_assert_eq!(policy_for(FieldKind::Tracking), MergePolicy::LastWriteWins);
    if !incoming.tracking.is_empty() {
        client.tracking = incoming.tracking.clone();
    }

    debug_assert_eq!(policy_for(FieldKind::OptIns), MergePolicy::OverwriteIfSome);
    overwrite_if_some(&mut client.opt_ins.email, &incoming.opt_ins.email);
    overwrite_if_some(&mut client.opt_ins.sms, &incoming.opt_ins.sms);
    overwrite_if_some(&mut client.opt_ins.messenger, &incoming.opt_ins.messenger);

    debug_assert_eq!(policy_for(FieldKind::Tags), MergePolicy::Union);
    for tag in &incoming.tags {
        client.tags.insert(tag.clone());
    }

    debug_assert_eq!(policy_for(FieldKind::LifecycleStage), MergePolicy::AdvanceOnly);
    if let Some(stage) = incoming.lifecycle_stage {
        client.lifecycle_stage = client.lifecycle_stage.advanced_to(stage);
    }

    debug_assert_eq!(
        policy_for(FieldKind::MonetaryAggregates),
        MergePolicy::TrustedOverwrite
    );
    let trusted = source.is_payment_source();
    if let Some(spend) = incoming.total_spend {
        if trusted || client.total_spend == 0.0 {
            client.total_spend = spend;
        }
    }
    if let Some(paid) = incoming.total_paid {
        if trusted || client.total_paid == 0.0 {
            client.total_paid = paid;
        }
    }

    client.updated_at = Utc::now();
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity resolver
// ---------------------------------------------------------------------------

pub struct IdentityResolver {
    clients: Arc<dyn ClientStore>,
    conflicts: Arc<dyn ConflictStore>,
}

impl IdentityResolver {
    pub fn new(clients: Arc<dyn ClientStore>, conflicts: Arc<dyn ConflictStore>) -> Self {
        Self { clients, conflicts }
    }

    /// Find or create the canonical client for one record. Precedence:
    /// email, then the source's platform ID, then last-10-digit phone.
    /// Multiple distinct candidates are a conflict, never a guess. Dry-run
    /// performs the full search and reports the would-be action without any
    /// write.
    pub async fn resolve(
        &self,
        record: &NormalizedContact,
        source: Source,
        dry_run: bool,
    ) -> Result<ResolveAction, SyncError> {
        let email = record.email.as_deref().and_then(normalize_email);
        let phone_key = record.phone.as_deref().and_then(normalize_phone_last10);
        let has_platform_slot = matches!(
            source,
            Source::GhlContacts
                | Source::ManychatSubscribers
                | Source::StripeCustomers
                | Source::PaypalCustomers
        );

        if email.is_none() && phone_key.is_none() && !has_platform_slot {
            return Ok(ResolveAction::Skipped);
        }

        // Candidates gathered in precedence order: email, platform ID, phone.
        let mut candidates: Vec<CanonicalClient> = Vec::new();
        if let Some(email) = &email {
            if let Some(client) = self.clients.find_by_email(email).await? {
                candidates.push(client);
            }
        }
        if has_platform_slot {
            if let Some(client) = self
                .clients
                .find_by_platform_id(source, &record.external_id)
                .await?
            {
                candidates.push(client);
            }
        }
        if let Some(key) = &phone_key {
            if let Some(client) = self.clients.find_by_phone_key(key).await? {
                candidates.push(client);
            }
        }

        let mut distinct: Vec<&CanonicalClient> = Vec::new();
        for client in &candidates {
            if !distinct.iter().any(|c| c.id == client.id) {
                distinct.push(client);
            }
        }

        match distinct.len() {
            0 => {
                let mut client = CanonicalClient::new();
                // A fresh client has no platform IDs, so this cannot conflict.
                let _ = apply_merge(&mut client, record, source);
                if !dry_run {
                    self.clients.insert(&client).await?;
                }
                Ok(ResolveAction::Created(client.id))
            }
            1 => {
                let mut client = candidates[0].clone();
                match apply_merge(&mut client, record, source) {
                    Ok(()) => {
                        if !dry_run {
                            self.clients.update(&client).await?;
                        }
                        Ok(ResolveAction::Updated(client.id))
                    }
                    Err(reason) => {
                        if !dry_run {
                            self.conflicts
                                .record(MergeConflict::open(
                                    source,
                                    vec![candidates[0].id],
                                    record.clone(),
                                    reason,
                                ))
                                .await?;
                        }
                        Ok(ResolveAction::Conflict)
                    }
                }
            }
            _ => {
                let candidate_ids = distinct.iter().map(|c| c.id).collect::<Vec<_>>();
                warn!(
                    %source,
                    external_id = %record.external_id,
                    candidates = candidate_ids.len(),
                    "ambiguous identity match; recording conflict"
                );
                if !dry_run {
                    self.conflicts
                        .record(MergeConflict::open(
                            source,
                            candidate_ids,
                            record.clone(),
                            ConflictReason::AmbiguousIdentity,
                        ))
                        .await?;
                }
                Ok(ResolveAction::Conflict)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sync run controller
// ---------------------------------------------------------------------------

/// Result of one `process_next_page` unit of work, returned to the caller
/// driving the poll loop.
#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub run_id: Uuid,
    pub status: SyncStatus,
    pub has_more: bool,
    pub checkpoint: Option<String>,
    pub counters: SyncCounters,
}

pub struct SyncController {
    runs: Arc<dyn SyncRunStore>,
    staging: Arc<dyn StagingStore>,
    resolver: Arc<IdentityResolver>,
    adapters: Arc<dyn AdapterRegistry>,
}

impl SyncController {
    pub fn new(
        runs: Arc<dyn SyncRunStore>,
        staging: Arc<dyn StagingStore>,
        resolver: Arc<IdentityResolver>,
        adapters: Arc<dyn AdapterRegistry>,
    ) -> Self {
        Self {
            runs,
            staging,
            resolver,
            adapters,
        }
    }

    /// Claim the single-flight slot for a source and create a run at
    /// checkpoint zero.
    pub async fn start(&self, source: Source, dry_run: bool) -> Result<SyncRun, SyncError> {
        if self.adapters.adapter_for(source).is_none() {
            return Err(SyncError::NoAdapter(source));
        }
        let run = self.runs.try_start(source, dry_run).await?;
        info!(%source, run_id = %run.id, dry_run, "sync run started");
        Ok(run)
    }

    /// One page: fetch, stage, resolve, persist checkpoint + counters.
    /// Callers re-invoke until `has_more` is false. A fetch failure marks
    /// the run failed immediately; the pre-page checkpoint remains valid.
    pub async fn process_next_page(&self, run_id: Uuid) -> Result<PageOutcome, SyncError> {
        let mut run = self.runs.get(run_id).await?;
        if !run.status.is_active() {
            return Err(SyncError::InvalidState {
                id: run_id,
                status: run.status,
                expected: "an active run",
            });
        }
        let adapter = self
            .adapters
            .adapter_for(run.source)
            .ok_or(SyncError::NoAdapter(run.source))?;

        let page = match adapter.fetch_page(run.checkpoint.as_deref()).await {
            Ok(page) => page,
            Err(err) => {
                let classified = classify_adapter_error(run.source, err);
                run.status = SyncStatus::Failed;
                run.error_message = Some(classified.to_string());
                run.completed_at = Some(Utc::now());
                run.updated_at = Utc::now();
                self.runs.update(&run).await?;
                return Err(classified);
            }
        };

        let page_counters = self.apply_page(&mut run, &page).await?;
        run.counters.absorb(page_counters);
        run.checkpoint = page.next_cursor.clone();
        run.updated_at = Utc::now();
        run.status = if page.has_more {
            SyncStatus::Continuing
        } else {
            run.completed_at = Some(Utc::now());
            if run.error_message.is_some() {
                SyncStatus::CompletedWithErrors
            } else {
                SyncStatus::Completed
            }
        };
        self.runs.update(&run).await?;

        Ok(PageOutcome {
            run_id,
            status: run.status,
            has_more: page.has_more,
            checkpoint: run.checkpoint.clone(),
            counters: run.counters,
        })
    }

    async fn apply_page(
        &self,
        run: &mut SyncRun,
        page: &FetchPage,
    ) -> Result<SyncCounters, SyncError> {
        let mut counters = SyncCounters {
            fetched: page.records.len() as u64 + page.skipped,
            skipped: page.skipped,
            ..SyncCounters::default()
        };

        if !run.dry_run {
            for record in &page.records {
                let payload = record.extra.clone();
                let payload_hash = sha256_hex(payload.to_string().as_bytes());
                let staged = RawStagedRecord {
                    source: run.source,
                    external_id: record.external_id.clone(),
                    payload,
                    payload_hash,
                    sync_run_id: run.id,
                    fetched_at: Utc::now(),
                };
                // Staging is an audit cache; a failure must never abort merging.
                if let Err(err) = self.staging.stage(staged).await {
                    warn!(
                        source = %run.source,
                        external_id = %record.external_id,
                        error = %err,
                        "failed to stage raw payload; continuing"
                    );
                }
            }
        }

        let mut record_errors = 0u64;
        for chunk in page.records.chunks(RESOLVE_BATCH) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|record| self.resolver.resolve(record, run.source, run.dry_run)),
            )
            .await;
            for result in results {
                match result {
                    Ok(ResolveAction::Created(_)) => counters.inserted += 1,
                    Ok(ResolveAction::Updated(_)) => counters.updated += 1,
                    Ok(ResolveAction::Conflict) => counters.conflicts += 1,
                    Ok(ResolveAction::Skipped) => counters.skipped += 1,
                    Err(err) => {
                        warn!(source = %run.source, error = %err, "record resolution failed");
                        counters.skipped += 1;
                        record_errors += 1;
                    }
                }
            }
        }
        if record_errors > 0 {
            run.error_message = Some(format!(
                "{record_errors} record(s) failed resolution; see logs"
            ));
        }

        Ok(counters)
    }

    /// Terminal stop. The last persisted checkpoint stays valid for a later
    /// fresh run.
    pub async fn cancel(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        self.transition_active(run_id, SyncStatus::Canceled, true).await
    }

    /// Park the run. A paused run still owns its source's single-flight
    /// slot; `resume` re-enters continuing from the saved checkpoint.
    pub async fn pause(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        self.transition_active(run_id, SyncStatus::Paused, false).await
    }

    async fn transition_active(
        &self,
        run_id: Uuid,
        to: SyncStatus,
        terminal: bool,
    ) -> Result<SyncRun, SyncError> {
        let mut run = self.runs.get(run_id).await?;
        if !run.status.is_active() {
            return Err(SyncError::InvalidState {
                id: run_id,
                status: run.status,
                expected: "an active run",
            });
        }
        run.status = to;
        run.updated_at = Utc::now();
        if terminal {
            run.completed_at = Some(Utc::now());
        }
        self.runs.update(&run).await?;
        info!(run_id = %run.id, status = %run.status, "sync run transitioned");
        Ok(run)
    }

    pub async fn resume(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        let mut run = self.runs.get(run_id).await?;
        if run.status != SyncStatus::Paused {
            return Err(SyncError::InvalidState {
                id: run_id,
                status: run.status,
                expected: "a paused run",
            });
        }
        run.status = SyncStatus::Continuing;
        run.updated_at = Utc::now();
        self.runs.update(&run).await?;
        Ok(run)
    }

    /// Reclaim runs whose last checkpoint update is older than the
    /// threshold, freeing the single-flight slot.
    pub async fn sweep_stale(
        &self,
        source: Source,
        idle_threshold: Option<Duration>,
    ) -> Result<u64, SyncError> {
        let threshold = idle_threshold.unwrap_or(DEFAULT_IDLE_THRESHOLD);
        let swept = self
            .runs
            .sweep_stale(source, threshold, IDLE_TIMEOUT_MESSAGE)
            .await?;
        if swept > 0 {
            warn!(%source, swept, "reclaimed idle sync runs");
        }
        Ok(swept)
    }

    /// Start and page a run to a terminal state. The cancel flag is honored
    /// cooperatively between pages; in-flight page work always completes so
    /// no half-applied page is left behind.
    pub async fn drive(
        &self,
        source: Source,
        dry_run: bool,
        cancel: &AtomicBool,
    ) -> Result<SyncRun, SyncError> {
        let run = self.start(source, dry_run).await?;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return self.cancel(run.id).await;
            }
            let outcome = self.process_next_page(run.id).await?;
            if !outcome.has_more {
                break;
            }
        }
        Ok(self.runs.get(run.id).await?)
    }

    pub async fn run(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        Ok(self.runs.get(run_id).await?)
    }
}

pub fn summarize_run(run: &SyncRun) -> String {
    format!(
        "run {} source={} status={} fetched={} inserted={} updated={} skipped={} conflicts={}",
        run.id,
        run.source,
        run.status,
        run.counters.fetched,
        run.counters.inserted,
        run.counters.updated,
        run.counters.skipped,
        run.counters.conflicts
    )
}

// ---------------------------------------------------------------------------
// Recovery batch processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_batches: u32,
    pub inter_batch_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_batches: DEFAULT_RECOVERY_MAX_BATCHES,
            inter_batch_delay: Duration::from_millis(1_000),
        }
    }
}

/// What one `run_recovery` invocation produced. Aggregates are cumulative
/// across resumed sessions; the item lists cover this invocation only.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub sync_run_id: Uuid,
    pub status: SyncStatus,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub batches_done: u32,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub recovered_amount: f64,
    pub failed_amount: f64,
    pub skipped_amount: f64,
    pub succeeded_items: Vec<RecoveryItem>,
    pub failed_items: Vec<RecoveryItem>,
    pub skipped_items: Vec<RecoveryItem>,
}

/// Charge-retry processor: the same run state machine as the sync
/// controller, with a client-local resumable checkpoint, a hard batch
/// ceiling, and a fixed inter-batch delay for the remote rate limit.
pub struct RecoveryProcessor {
    gateway: Arc<dyn RecoveryGateway>,
    runs: Arc<dyn SyncRunStore>,
    job_state: JobStateStore,
    config: RecoveryConfig,
}

impl RecoveryProcessor {
    pub fn new(
        gateway: Arc<dyn RecoveryGateway>,
        runs: Arc<dyn SyncRunStore>,
        job_state: JobStateStore,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            gateway,
            runs,
            job_state,
            config,
        }
    }

    async fn load_or_start(&self, hours_lookback: u32) -> Result<RecoveryJobState, SyncError> {
        if let Some(state) = self.job_state.read(RECOVERY_JOB_KEY).await {
            if state.hours_lookback == hours_lookback && !state.completed {
                // Resume an interrupted session; re-enter continuing.
                match self.runs.get(state.sync_run_id).await {
                    Ok(mut run) if !run.status.is_terminal() => {
                        run.status = SyncStatus::Continuing;
                        run.updated_at = Utc::now();
                        self.runs.update(&run).await?;
                        info!(run_id = %run.id, cursor = ?state.cursor, "resuming recovery run");
                        return Ok(state);
                    }
                    _ => self.job_state.clear(RECOVERY_JOB_KEY).await,
                }
            }
        }

        // A run can outlive its client-local blob: the in-flight checkpoint
        // expires after two hours, while a parked run keeps the slot
        // indefinitely. Re-attach to the slot holder instead of losing the
        // source to a permanent Conflict. Position resumes from the run's
        // checkpoint, so no charge is retried twice; counts are rebuilt from
        // the run row, monetary aggregates cannot be and restart at zero.
        if let Some(mut run) = self.runs.find_active(Source::RevenueRecovery).await? {
            run.status = SyncStatus::Continuing;
            run.updated_at = Utc::now();
            self.runs.update(&run).await?;
            warn!(
                run_id = %run.id,
                cursor = ?run.checkpoint,
                "local recovery state missing; re-attaching to the existing run"
            );
            return Ok(RecoveryJobState {
                hours_lookback,
                sync_run_id: run.id,
                cursor: run.checkpoint.clone(),
                batches_done: 0,
                succeeded: run.counters.updated,
                failed: run
                    .counters
                    .fetched
                    .saturating_sub(run.counters.updated + run.counters.skipped),
                skipped: run.counters.skipped,
                recovered_amount: 0.0,
                failed_amount: 0.0,
                skipped_amount: 0.0,
                completed: false,
                timestamp: Utc::now(),
            });
        }

        let run = self.runs.try_start(Source::RevenueRecovery, false).await?;
        Ok(RecoveryJobState {
            hours_lookback,
            sync_run_id: run.id,
            cursor: None,
            batches_done: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            recovered_amount: 0.0,
            failed_amount: 0.0,
            skipped_amount: 0.0,
            completed: false,
            timestamp: Utc::now(),
        })
    }

    async fn persist_run(
        &self,
        state: &RecoveryJobState,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<(), SyncError> {
        let mut run = self.runs.get(state.sync_run_id).await?;
        run.status = status;
        run.checkpoint = state.cursor.clone();
        run.counters = SyncCounters {
            fetched: state.succeeded + state.failed + state.skipped,
            inserted: 0,
            updated: state.succeeded,
            skipped: state.skipped,
            conflicts: 0,
        };
        run.error_message = error;
        run.updated_at = Utc::now();
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        self.runs.update(&run).await?;
        Ok(())
    }

    fn outcome(
        state: &RecoveryJobState,
        status: SyncStatus,
        has_more: bool,
        items: (Vec<RecoveryItem>, Vec<RecoveryItem>, Vec<RecoveryItem>),
    ) -> RecoveryOutcome {
        RecoveryOutcome {
            sync_run_id: state.sync_run_id,
            status,
            has_more,
            next_cursor: state.cursor.clone(),
            batches_done: state.batches_done,
            succeeded: state.succeeded,
            failed: state.failed,
            skipped: state.skipped,
            recovered_amount: state.recovered_amount,
            failed_amount: state.failed_amount,
            skipped_amount: state.skipped_amount,
            succeeded_items: items.0,
            failed_items: items.1,
            skipped_items: items.2,
        }
    }

    /// Run (or resume) the charge-retry loop. Cancellation between batches
    /// captures the aggregate into the resumable checkpoint: "stopped for
    /// now", not "finished". Any error after partial progress persists the
    /// checkpoint before surfacing, so callers resume rather than restart.
    pub async fn run_recovery(
        &self,
        hours_lookback: u32,
        cancel: &AtomicBool,
    ) -> Result<RecoveryOutcome, SyncError> {
        // A finished result is served from the local cache until it expires;
        // re-invoking within the window must not retry charges again.
        if let Some(state) = self.job_state.read(RECOVERY_JOB_KEY).await {
            if state.completed && state.hours_lookback == hours_lookback {
                info!(run_id = %state.sync_run_id, "returning cached recovery result");
                let status = if state.failed > 0 {
                    SyncStatus::CompletedWithErrors
                } else {
                    SyncStatus::Completed
                };
                return Ok(Self::outcome(
                    &state,
                    status,
                    false,
                    (Vec::new(), Vec::new(), Vec::new()),
                ));
            }
        }

        let mut state = self.load_or_start(hours_lookback).await?;
        let mut succeeded_items = Vec::new();
        let mut failed_items = Vec::new();
        let mut skipped_items = Vec::new();
        let mut first_batch = state.batches_done == 0;
        // The ceiling bounds this invocation; a resumed session gets a fresh
        // allowance while `state.batches_done` keeps the cumulative tally.
        let mut session_batches = 0u32;

        loop {
            if session_batches >= self.config.max_batches {
                warn!(
                    batches = state.batches_done,
                    ceiling = self.config.max_batches,
                    "recovery batch ceiling reached; parking run"
                );
                state.timestamp = Utc::now();
                self.job_state.write(RECOVERY_JOB_KEY, &state).await;
                self.persist_run(&state, SyncStatus::Paused, None).await?;
                return Ok(Self::outcome(
                    &state,
                    SyncStatus::Paused,
                    true,
                    (succeeded_items, failed_items, skipped_items),
                ));
            }

            if cancel.load(Ordering::Relaxed) {
                state.timestamp = Utc::now();
                self.job_state.write(RECOVERY_JOB_KEY, &state).await;
                self.persist_run(&state, SyncStatus::Paused, None).await?;
                return Ok(Self::outcome(
                    &state,
                    SyncStatus::Paused,
                    true,
                    (succeeded_items, failed_items, skipped_items),
                ));
            }

            if !first_batch {
                // Fixed delay between remote batches, per processor rate limit.
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
            first_batch = false;

            let batch = match self
                .gateway
                .retry_batch(hours_lookback, state.cursor.as_deref())
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    let classified = classify_adapter_error(Source::RevenueRecovery, err);
                    // Recoverable: the partial aggregate survives the error.
                    state.timestamp = Utc::now();
                    self.job_state.write(RECOVERY_JOB_KEY, &state).await;
                    self.persist_run(
                        &state,
                        SyncStatus::Failed,
                        Some(classified.to_string()),
                    )
                    .await?;
                    return Err(classified);
                }
            };

            state.succeeded += batch.succeeded.len() as u64;
            state.failed += batch.failed.len() as u64;
            state.skipped += batch.skipped.len() as u64;
            state.recovered_amount += batch.succeeded.iter().map(|i| i.amount).sum::<f64>();
            state.failed_amount += batch.failed.iter().map(|i| i.amount).sum::<f64>();
            state.skipped_amount += batch.skipped.iter().map(|i| i.amount).sum::<f64>();
            state.batches_done += 1;
            session_batches += 1;
            state.cursor = batch.next_cursor.clone();
            state.timestamp = Utc::now();
            succeeded_items.extend(batch.succeeded);
            failed_items.extend(batch.failed);
            skipped_items.extend(batch.skipped);

            self.job_state.write(RECOVERY_JOB_KEY, &state).await;

            if !batch.has_more {
                state.completed = true;
                state.timestamp = Utc::now();
                self.job_state.write(RECOVERY_JOB_KEY, &state).await;
                let status = if state.failed > 0 {
                    SyncStatus::CompletedWithErrors
                } else {
                    SyncStatus::Completed
                };
                self.persist_run(&state, status, None).await?;
                info!(
                    run_id = %state.sync_run_id,
                    succeeded = state.succeeded,
                    failed = state.failed,
                    recovered = state.recovered_amount,
                    "recovery run completed"
                );
                return Ok(Self::outcome(
                    &state,
                    status,
                    false,
                    (succeeded_items, failed_items, skipped_items),
                ));
            }

            self.persist_run(&state, SyncStatus::Continuing, None).await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration and runtime wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_dir: PathBuf,
    pub admin_token: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sweep_cron: Option<String>,
    pub idle_threshold: Duration,
    pub recovery: RecoveryConfig,
    pub vendors: VendorConfig,
    pub recovery_base_url: String,
    pub recovery_bearer: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let vendors = VendorConfig {
            ghl_api_key: std::env::var("GHL_API_KEY").unwrap_or_default(),
            manychat_token: std::env::var("MANYCHAT_TOKEN").unwrap_or_default(),
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            paypal_access_token: std::env::var("PAYPAL_ACCESS_TOKEN").unwrap_or_default(),
            page_size: std::env::var("UNIFY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            ..VendorConfig::default()
        };
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            state_dir: std::env::var("UNIFY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            admin_token: std::env::var("UNIFY_ADMIN_TOKEN").unwrap_or_default(),
            user_agent: std::env::var("UNIFY_USER_AGENT")
                .unwrap_or_else(|_| "unify-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("UNIFY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sweep_cron: std::env::var("UNIFY_SWEEP_CRON").ok(),
            idle_threshold: std::env::var("UNIFY_IDLE_THRESHOLD_MINS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|mins| Duration::from_secs(mins * 60))
                .unwrap_or(DEFAULT_IDLE_THRESHOLD),
            recovery: RecoveryConfig {
                max_batches: std::env::var("UNIFY_RECOVERY_MAX_BATCHES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RECOVERY_MAX_BATCHES),
                inter_batch_delay: std::env::var("UNIFY_RECOVERY_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::from_millis(1_000)),
            },
            vendors,
            recovery_base_url: std::env::var("RECOVERY_BASE_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            recovery_bearer: std::env::var("RECOVERY_BEARER_TOKEN").unwrap_or_default(),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Per-source settings from the YAML registry (`sources.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub source: Source,
    pub enabled: bool,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(workspace_root: &std::path::Path) -> anyhow::Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.source)
            .collect()
    }
}

/// Everything a caller (CLI, web) needs, wired once from config.
pub struct SyncRuntime {
    pub controller: Arc<SyncController>,
    pub resolver: Arc<IdentityResolver>,
    pub recovery: Arc<RecoveryProcessor>,
    pub conflicts: Arc<dyn ConflictStore>,
    pub config: SyncConfig,
}

impl SyncRuntime {
    /// Postgres-backed when DATABASE_URL is set, in-memory otherwise.
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 8,
                refill_every: Duration::from_millis(250),
            }),
            ..Default::default()
        })?);

        let (runs, clients, staging, conflicts): (
            Arc<dyn SyncRunStore>,
            Arc<dyn ClientStore>,
            Arc<dyn StagingStore>,
            Arc<dyn ConflictStore>,
        ) = match &config.database_url {
            Some(url) => {
                let store = Arc::new(
                    PgStore::connect(url)
                        .await
                        .context("connecting to database")?,
                );
                store.migrate().await.context("applying schema")?;
                (
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    store,
                )
            }
            None => {
                let store = MemoryStore::shared();
                (
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    store,
                )
            }
        };

        let resolver = Arc::new(IdentityResolver::new(clients, conflicts.clone()));
        let adapters = Arc::new(HttpAdapterRegistry::new(http.clone(), config.vendors.clone()));
        let controller = Arc::new(SyncController::new(
            runs.clone(),
            staging,
            resolver.clone(),
            adapters,
        ));
        let gateway = Arc::new(HttpRecoveryGateway::new(
            http,
            config.recovery_base_url.clone(),
            config.recovery_bearer.clone(),
        ));
        let recovery = Arc::new(RecoveryProcessor::new(
            gateway,
            runs,
            JobStateStore::new(config.state_dir.clone()),
            config.recovery.clone(),
        ));

        Ok(Self {
            controller,
            resolver,
            recovery,
            conflicts,
            config,
        })
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    /// Optional cron job sweeping idle runs for every source.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        let Some(cron) = self.config.sweep_cron.clone() else {
            return Ok(None);
        };
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let controller = self.controller.clone();
        let threshold = self.config.idle_threshold;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let controller = controller.clone();
            Box::pin(async move {
                for source in Source::ALL {
                    if let Err(err) = controller.sweep_stale(source, Some(threshold)).await {
                        warn!(%source, error = %err, "scheduled sweep failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {cron}"))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(Some(sched))
    }
}
