//! Core domain model for the Unify customer-data sync and identity pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-core";

/// One external system being ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    GhlContacts,
    ManychatSubscribers,
    StripeCustomers,
    PaypalCustomers,
    Invoices,
    Dunning,
    RevenueRecovery,
}

impl Source {
    pub const ALL: [Source; 7] = [
        Source::GhlContacts,
        Source::ManychatSubscribers,
        Source::StripeCustomers,
        Source::PaypalCustomers,
        Source::Invoices,
        Source::Dunning,
        Source::RevenueRecovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::GhlContacts => "ghl-contacts",
            Source::ManychatSubscribers => "manychat-subscribers",
            Source::StripeCustomers => "stripe-customers",
            Source::PaypalCustomers => "paypal-customers",
            Source::Invoices => "invoices",
            Source::Dunning => "dunning",
            Source::RevenueRecovery => "revenue-recovery",
        }
    }

    /// Whether records from this source carry first-hand payment observations.
    /// Only these sources may lower a non-zero monetary aggregate.
    pub fn is_payment_source(&self) -> bool {
        matches!(
            self,
            Source::StripeCustomers
                | Source::PaypalCustomers
                | Source::Invoices
                | Source::Dunning
                | Source::RevenueRecovery
        )
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| format!("unknown source: {s}"))
    }
}

/// Lifecycle position of a canonical client. Ordered: a merge may only move
/// a client forward along this axis, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleStage {
    Lead,
    Trial,
    Customer,
    Churn,
}

impl LifecycleStage {
    pub fn rank(&self) -> u8 {
        match self {
            LifecycleStage::Lead => 0,
            LifecycleStage::Trial => 1,
            LifecycleStage::Customer => 2,
            LifecycleStage::Churn => 3,
        }
    }

    /// Monotonic advance: returns the further-along of the two stages.
    pub fn advanced_to(self, incoming: LifecycleStage) -> LifecycleStage {
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Continuing,
    Completed,
    CompletedWithErrors,
    Failed,
    Canceled,
    Paused,
}

impl SyncStatus {
    /// Statuses that accept further page work.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Running | SyncStatus::Continuing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active() && *self != SyncStatus::Paused
    }

    /// Statuses that hold the single-flight slot for their source. Note
    /// that paused runs are not workable but still own the slot, so a
    /// fresh `start` is refused until the run is canceled or resumed to
    /// completion; `resume` can therefore never race a new run for the
    /// same source.
    pub fn holds_source_slot(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Running => "running",
            SyncStatus::Continuing => "continuing",
            SyncStatus::Completed => "completed",
            SyncStatus::CompletedWithErrors => "completed_with_errors",
            SyncStatus::Failed => "failed",
            SyncStatus::Canceled => "canceled",
            SyncStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Progress counters carried on every run and returned to callers alongside
/// terminal status, so partial success is distinguishable from total failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub conflicts: u64,
}

impl SyncCounters {
    pub fn absorb(&mut self, other: SyncCounters) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
    }
}

/// One execution of one source's ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub source: Source,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    /// Bumped on every checkpoint write; the idle sweep inspects this, not
    /// wall-clock run duration, so a slow but progressing run is never killed.
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque resume cursor. `None` means "from the beginning".
    pub checkpoint: Option<String>,
    pub counters: SyncCounters,
    pub error_message: Option<String>,
    pub dry_run: bool,
}

impl SyncRun {
    pub fn new(source: Source, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            status: SyncStatus::Running,
            started_at: now,
            updated_at: now,
            completed_at: None,
            checkpoint: None,
            counters: SyncCounters::default(),
            error_message: None,
            dry_run,
        }
    }
}

/// Per-channel communication consent. `None` means the source did not report
/// the flag at all, which is distinct from an explicit opt-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptIns {
    pub email: Option<bool>,
    pub sms: Option<bool>,
    pub messenger: Option<bool>,
}

/// Session-scoped attribution signals. Always last-write-wins on merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingData {
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub fbclid: Option<String>,
    pub gclid: Option<String>,
}

impl TrackingData {
    pub fn is_empty(&self) -> bool {
        self.utm_source.is_none()
            && self.utm_medium.is_none()
            && self.utm_campaign.is_none()
            && self.utm_term.is_none()
            && self.utm_content.is_none()
            && self.fbclid.is_none()
            && self.gclid.is_none()
    }
}

/// Adapter handoff contract: one source record, normalized into the common
/// shape. Vendor-specific field names never travel past the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedContact {
    pub external_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub tags: Vec<String>,
    pub opt_ins: OptIns,
    pub tracking: TrackingData,
    pub lifecycle_stage: Option<LifecycleStage>,
    /// Monetary observations, present only when the source saw payments.
    pub total_spend: Option<f64>,
    pub total_paid: Option<f64>,
    /// Vendor payload remainder, kept opaque for audit.
    pub extra: JsonValue,
}

impl NormalizedContact {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            email: None,
            phone: None,
            full_name: None,
            tags: Vec::new(),
            opt_ins: OptIns::default(),
            tracking: TrackingData::default(),
            lifecycle_stage: None,
            total_spend: None,
            total_paid: None,
            extra: JsonValue::Null,
        }
    }
}

/// The unified customer identity that resolution converges on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalClient {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub ghl_contact_id: Option<String>,
    pub manychat_subscriber_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub paypal_customer_id: Option<String>,
    pub tracking: TrackingData,
    pub opt_ins: OptIns,
    pub tags: BTreeSet<String>,
    pub lifecycle_stage: LifecycleStage,
    pub total_spend: f64,
    pub total_paid: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalClient {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: None,
            phone: None,
            full_name: None,
            ghl_contact_id: None,
            manychat_subscriber_id: None,
            stripe_customer_id: None,
            paypal_customer_id: None,
            tracking: TrackingData::default(),
            opt_ins: OptIns::default(),
            tags: BTreeSet::new(),
            lifecycle_stage: LifecycleStage::Lead,
            total_spend: 0.0,
            total_paid: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The platform external-ID slot corresponding to a source, if that
    /// source has one (invoice-family sources identify by email only).
    pub fn platform_id(&self, source: Source) -> Option<&str> {
        match source {
            Source::GhlContacts => self.ghl_contact_id.as_deref(),
            Source::ManychatSubscribers => self.manychat_subscriber_id.as_deref(),
            Source::StripeCustomers => self.stripe_customer_id.as_deref(),
            Source::PaypalCustomers => self.paypal_customer_id.as_deref(),
            Source::Invoices | Source::Dunning | Source::RevenueRecovery => None,
        }
    }

    pub fn set_platform_id(&mut self, source: Source, id: String) {
        match source {
            Source::GhlContacts => self.ghl_contact_id = Some(id),
            Source::ManychatSubscribers => self.manychat_subscriber_id = Some(id),
            Source::StripeCustomers => self.stripe_customer_id = Some(id),
            Source::PaypalCustomers => self.paypal_customer_id = Some(id),
            Source::Invoices | Source::Dunning | Source::RevenueRecovery => {}
        }
    }
}

impl Default for CanonicalClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Distinct clients matched by different identity signals.
    AmbiguousIdentity,
    /// The matched client already carries a different platform ID for the
    /// incoming record's source.
    PlatformIdMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

/// An unresolved identity collision, parked for human review. The resolver
/// never guesses; it records the collision and mutates nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub id: Uuid,
    pub source: Source,
    pub candidate_ids: Vec<Uuid>,
    pub incoming: NormalizedContact,
    pub reason: ConflictReason,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
}

impl MergeConflict {
    pub fn open(
        source: Source,
        candidate_ids: Vec<Uuid>,
        incoming: NormalizedContact,
        reason: ConflictReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            candidate_ids,
            incoming,
            reason,
            status: ConflictStatus::Open,
            created_at: Utc::now(),
        }
    }
}

/// One fetched, not-yet-merged source payload. A cache of the most recent
/// observation keyed by (source, external_id), not a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStagedRecord {
    pub source: Source,
    pub external_id: String,
    pub payload: JsonValue,
    pub payload_hash: String,
    pub sync_run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// What the resolver did (or, in dry-run mode, would have done).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "client_id")]
pub enum ResolveAction {
    Created(Uuid),
    Updated(Uuid),
    Conflict,
    Skipped,
}

impl ResolveAction {
    pub fn client_id(&self) -> Option<Uuid> {
        match self {
            ResolveAction::Created(id) | ResolveAction::Updated(id) => Some(*id),
            ResolveAction::Conflict | ResolveAction::Skipped => None,
        }
    }
}

/// Client-local resumable checkpoint for the recovery batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryJobState {
    pub hours_lookback: u32,
    pub sync_run_id: Uuid,
    pub cursor: Option<String>,
    pub batches_done: u32,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub recovered_amount: f64,
    pub failed_amount: f64,
    #[serde(default)]
    pub skipped_amount: f64,
    pub completed: bool,
    /// Written on every save; expiry checks on read compare against this.
    pub timestamp: DateTime<Utc>,
}

/// Per-invoice outcome of one remote charge-retry batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryItem {
    pub invoice_id: String,
    pub amount: f64,
    pub reason: Option<String>,
}

/// Lowercase + trim, rejecting obviously malformed addresses. Malformed
/// input is treated as "no email", never as a match key.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let (local, domain) = trimmed.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    let (host, tld) = domain.rsplit_once('.')?;
    if host.is_empty() || tld.is_empty() || trimmed.contains(char::is_whitespace) {
        return None;
    }
    Some(trimmed)
}

/// Last 10 digits of a phone number, the identity-match key for phones.
/// Numbers differing only in country code collapse to the same key; that is
/// the inherited matching rule and a known false-positive risk.
pub fn normalize_phone_last10(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("crm".parse::<Source>().is_err());
    }

    #[test]
    fn lifecycle_advance_is_monotonic() {
        use LifecycleStage::*;
        assert_eq!(Lead.advanced_to(Trial), Trial);
        assert_eq!(Trial.advanced_to(Customer), Customer);
        assert_eq!(Customer.advanced_to(Lead), Customer);
        assert_eq!(Customer.advanced_to(Trial), Customer);
        assert_eq!(Churn.advanced_to(Customer), Churn);
    }

    #[test]
    fn email_normalization_lowercases_and_rejects_malformed() {
        assert_eq!(
            normalize_email("  Jane.Doe@Example.COM "),
            Some("jane.doe@example.com".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("@example.com"), None);
        assert_eq!(normalize_email("jane@"), None);
        assert_eq!(normalize_email("jane@localhost"), None);
        assert_eq!(normalize_email("jane doe@example.com"), None);
    }

    #[test]
    fn phone_key_is_last_ten_digits() {
        assert_eq!(
            normalize_phone_last10("+1 (555) 123-4567"),
            Some("5551234567".to_string())
        );
        assert_eq!(
            normalize_phone_last10("445551234567"),
            Some("5551234567".to_string())
        );
        assert_eq!(normalize_phone_last10("12345"), Some("12345".to_string()));
        assert_eq!(normalize_phone_last10("ext."), None);
    }

    #[test]
    fn status_single_flight_classification() {
        assert!(SyncStatus::Running.is_active());
        assert!(SyncStatus::Continuing.is_active());
        assert!(!SyncStatus::Paused.is_active());
        assert!(!SyncStatus::Paused.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
        assert!(SyncStatus::Canceled.is_terminal());
    }
}
