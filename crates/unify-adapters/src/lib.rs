//! Source adapter contract + vendor-specific page adapters.
//!
//! Each adapter owns one vendor's pagination semantics and payload shape and
//! hands the pipeline `NormalizedContact` values; vendor field names stop
//! here. Adapters never touch sync-run state.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use unify_core::{LifecycleStage, NormalizedContact, OptIns, RecoveryItem, Source, TrackingData};
use unify_store::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "unify-adapters";

/// One page of normalized records plus the position of the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPage {
    pub records: Vec<NormalizedContact>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Vendor entries that could not be normalized (missing external id).
    /// They are counted, never silently dropped.
    pub skipped: u64,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    // Field name avoids `source`, which thiserror reserves for the cause
    // chain and `Source` cannot satisfy.
    #[error("malformed {origin} payload: {message}")]
    Payload { origin: Source, message: String },
    #[error("invalid cursor for {origin}: {cursor}")]
    Cursor { origin: Source, cursor: String },
}

impl AdapterError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AdapterError::Transport(err) if err.is_auth())
    }
}

/// Uniform page-fetch contract. `cursor = None` means the first page; the
/// returned `next_cursor` is opaque to everything above the adapter.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError>;
}

/// Vendor endpoints and credentials, filled from the environment by the sync
/// layer. Base URLs are overridable so tests can point at a local stub.
#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub ghl_base_url: String,
    pub ghl_api_key: String,
    pub manychat_base_url: String,
    pub manychat_token: String,
    pub stripe_base_url: String,
    pub stripe_secret_key: String,
    pub paypal_base_url: String,
    pub paypal_access_token: String,
    pub page_size: u32,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            ghl_base_url: "https://rest.gohighlevel.com/v1".to_string(),
            ghl_api_key: String::new(),
            manychat_base_url: "https://api.manychat.com".to_string(),
            manychat_token: String::new(),
            stripe_base_url: "https://api.stripe.com".to_string(),
            stripe_secret_key: String::new(),
            paypal_base_url: "https://api-m.paypal.com".to_string(),
            paypal_access_token: String::new(),
            page_size: 100,
        }
    }
}

// JSON path helpers shared by the vendor parsers.

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_bool()
}

fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_u64()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn string_tags(value: &JsonValue, path: &[&str]) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    let Some(arr) = cur.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|v| {
            v.as_str()
                .map(ToString::to_string)
                .or_else(|| json_str(v, &["name"]).map(ToString::to_string))
        })
        .filter(|t| !t.trim().is_empty())
        .collect()
}

fn join_names(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = [first, last]
        .into_iter()
        .flatten()
        .filter_map(text_or_none)
        .collect::<Vec<_>>()
        .join(" ");
    text_or_none(&joined)
}

fn tracking_from(value: &JsonValue, prefix: &[&str]) -> TrackingData {
    let root = prefix.iter().try_fold(value, |cur, seg| cur.get(*seg));
    let Some(root) = root else {
        return TrackingData::default();
    };
    TrackingData {
        utm_source: json_str(root, &["utm_source"])
            .or_else(|| json_str(root, &["utmSource"]))
            .and_then(text_or_none),
        utm_medium: json_str(root, &["utm_medium"])
            .or_else(|| json_str(root, &["utmMedium"]))
            .and_then(text_or_none),
        utm_campaign: json_str(root, &["utm_campaign"])
            .or_else(|| json_str(root, &["utmCampaign"]))
            .and_then(text_or_none),
        utm_term: json_str(root, &["utm_term"])
            .or_else(|| json_str(root, &["utmTerm"]))
            .and_then(text_or_none),
        utm_content: json_str(root, &["utm_content"])
            .or_else(|| json_str(root, &["utmContent"]))
            .and_then(text_or_none),
        fbclid: json_str(root, &["fbclid"]).and_then(text_or_none),
        gclid: json_str(root, &["gclid"]).and_then(text_or_none),
    }
}

// ---------------------------------------------------------------------------
// GHL contacts (offset pagination)
// ---------------------------------------------------------------------------

pub struct GhlContactsAdapter {
    http: Arc<HttpFetcher>,
    config: VendorConfig,
}

impl GhlContactsAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: VendorConfig) -> Self {
        Self { http, config }
    }
}

fn parse_offset_cursor(source: Source, cursor: Option<&str>) -> Result<u64, AdapterError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw.parse::<u64>().map_err(|_| AdapterError::Cursor {
            origin: source,
            cursor: raw.to_string(),
        }),
    }
}

/// Parse one GHL contacts page. Offset cursors: the next cursor is
/// `offset + returned`, and there is more while that stays under `meta.total`.
pub fn parse_ghl_page(
    payload: &JsonValue,
    offset: u64,
    page_size: u32,
) -> Result<FetchPage, AdapterError> {
    let contacts = payload
        .get("contacts")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::Payload {
            origin: Source::GhlContacts,
            message: "missing contacts array".to_string(),
        })?;

    let mut records = Vec::with_capacity(contacts.len());
    let mut skipped = 0u64;
    for entry in contacts {
        let Some(id) = json_str(entry, &["id"]).and_then(text_or_none) else {
            skipped += 1;
            continue;
        };
        let mut contact = NormalizedContact::new(id);
        contact.email = json_str(entry, &["email"]).and_then(text_or_none);
        contact.phone = json_str(entry, &["phone"]).and_then(text_or_none);
        contact.full_name = json_str(entry, &["contactName"])
            .and_then(text_or_none)
            .or_else(|| {
                join_names(
                    json_str(entry, &["firstName"]),
                    json_str(entry, &["lastName"]),
                )
            });
        contact.tags = string_tags(entry, &["tags"]);
        // GHL models consent as a "do not disturb" flag.
        contact.opt_ins = OptIns {
            email: json_bool(entry, &["dnd"]).map(|dnd| !dnd),
            sms: json_bool(entry, &["dndSms"]).map(|dnd| !dnd),
            messenger: None,
        };
        contact.tracking = tracking_from(entry, &["attributionSource"]);
        contact.lifecycle_stage = match json_str(entry, &["type"]) {
            Some("customer") => Some(LifecycleStage::Customer),
            Some("trial") => Some(LifecycleStage::Trial),
            Some("lead") | None => Some(LifecycleStage::Lead),
            Some(_) => None,
        };
        contact.extra = entry.clone();
        records.push(contact);
    }

    let returned = contacts.len() as u64;
    let total = json_u64(payload, &["meta", "total"]);
    let consumed = offset + returned;
    let has_more = match total {
        Some(total) => consumed < total,
        // Without a total, a full page implies another one may follow.
        None => returned == u64::from(page_size) && returned > 0,
    };

    Ok(FetchPage {
        records,
        next_cursor: has_more.then(|| consumed.to_string()),
        has_more,
        skipped,
    })
}

#[async_trait]
impl SourceAdapter for GhlContactsAdapter {
    fn source(&self) -> Source {
        Source::GhlContacts
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError> {
        let offset = parse_offset_cursor(self.source(), cursor)?;
        let url = format!(
            "{}/contacts/?limit={}&offset={}",
            self.config.ghl_base_url, self.config.page_size, offset
        );
        let payload = self
            .http
            .get_json(
                self.source().as_str(),
                &url,
                Some(&self.config.ghl_api_key),
                &[],
            )
            .await?;
        parse_ghl_page(&payload, offset, self.config.page_size)
    }
}

// ---------------------------------------------------------------------------
// ManyChat subscribers (opaque cursor)
// ---------------------------------------------------------------------------

pub struct ManychatSubscribersAdapter {
    http: Arc<HttpFetcher>,
    config: VendorConfig,
}

impl ManychatSubscribersAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: VendorConfig) -> Self {
        Self { http, config }
    }
}

pub fn parse_manychat_page(payload: &JsonValue) -> Result<FetchPage, AdapterError> {
    if json_str(payload, &["status"]).is_some_and(|s| s != "success") {
        return Err(AdapterError::Payload {
            origin: Source::ManychatSubscribers,
            message: format!(
                "vendor reported status {}",
                json_str(payload, &["status"]).unwrap_or("unknown")
            ),
        });
    }
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::Payload {
            origin: Source::ManychatSubscribers,
            message: "missing data array".to_string(),
        })?;

    let mut records = Vec::with_capacity(data.len());
    let mut skipped = 0u64;
    for entry in data {
        let id = json_str(entry, &["id"])
            .map(ToString::to_string)
            .or_else(|| json_u64(entry, &["id"]).map(|n| n.to_string()));
        let Some(id) = id else {
            skipped += 1;
            continue;
        };
        let mut contact = NormalizedContact::new(id);
        contact.email = json_str(entry, &["email"]).and_then(text_or_none);
        contact.phone = json_str(entry, &["phone"])
            .or_else(|| json_str(entry, &["whatsapp_phone"]))
            .and_then(text_or_none);
        contact.full_name = json_str(entry, &["name"]).and_then(text_or_none).or_else(|| {
            join_names(
                json_str(entry, &["first_name"]),
                json_str(entry, &["last_name"]),
            )
        });
        contact.tags = string_tags(entry, &["tags"]);
        contact.opt_ins = OptIns {
            email: json_bool(entry, &["optin_email"]),
            sms: json_bool(entry, &["optin_phone"]),
            messenger: json_bool(entry, &["subscribed"]),
        };
        contact.tracking = tracking_from(entry, &["custom_fields"]);
        contact.lifecycle_stage = Some(LifecycleStage::Lead);
        contact.extra = entry.clone();
        records.push(contact);
    }

    let next_cursor = json_str(payload, &["next"]).and_then(text_or_none);
    let has_more = next_cursor.is_some();

    Ok(FetchPage {
        records,
        next_cursor,
        has_more,
        skipped,
    })
}

#[async_trait]
impl SourceAdapter for ManychatSubscribersAdapter {
    fn source(&self) -> Source {
        Source::ManychatSubscribers
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError> {
        let mut url = format!(
            "{}/fb/subscriber/list?limit={}",
            self.config.manychat_base_url, self.config.page_size
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }
        let payload = self
            .http
            .get_json(
                self.source().as_str(),
                &url,
                Some(&self.config.manychat_token),
                &[],
            )
            .await?;
        parse_manychat_page(&payload)
    }
}

// ---------------------------------------------------------------------------
// Stripe customers (starting_after cursor)
// ---------------------------------------------------------------------------

pub struct StripeCustomersAdapter {
    http: Arc<HttpFetcher>,
    config: VendorConfig,
}

impl StripeCustomersAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: VendorConfig) -> Self {
        Self { http, config }
    }
}

pub fn parse_stripe_page(payload: &JsonValue) -> Result<FetchPage, AdapterError> {
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::Payload {
            origin: Source::StripeCustomers,
            message: "missing data array".to_string(),
        })?;

    let mut records = Vec::with_capacity(data.len());
    let mut skipped = 0u64;
    for entry in data {
        let Some(id) = json_str(entry, &["id"]).and_then(text_or_none) else {
            skipped += 1;
            continue;
        };
        let mut contact = NormalizedContact::new(id);
        contact.email = json_str(entry, &["email"]).and_then(text_or_none);
        contact.phone = json_str(entry, &["phone"]).and_then(text_or_none);
        contact.full_name = json_str(entry, &["name"]).and_then(text_or_none);
        contact.tracking = tracking_from(entry, &["metadata"]);
        // A customer record at the payment processor is a first-hand
        // payment observation.
        contact.lifecycle_stage = Some(LifecycleStage::Customer);
        contact.total_spend = json_f64(entry, &["metadata", "total_spend"]);
        contact.total_paid = json_f64(entry, &["metadata", "total_paid"]);
        contact.extra = entry.clone();
        records.push(contact);
    }

    let has_more = json_bool(payload, &["has_more"]).unwrap_or(false);
    let next_cursor = if has_more {
        data.last()
            .and_then(|entry| json_str(entry, &["id"]))
            .map(ToString::to_string)
    } else {
        None
    };
    if has_more && next_cursor.is_none() {
        return Err(AdapterError::Payload {
            origin: Source::StripeCustomers,
            message: "has_more without a last record id".to_string(),
        });
    }

    Ok(FetchPage {
        records,
        next_cursor,
        has_more,
        skipped,
    })
}

#[async_trait]
impl SourceAdapter for StripeCustomersAdapter {
    fn source(&self) -> Source {
        Source::StripeCustomers
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError> {
        let mut url = format!(
            "{}/v1/customers?limit={}",
            self.config.stripe_base_url, self.config.page_size
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&starting_after={cursor}"));
        }
        let payload = self
            .http
            .get_json(
                self.source().as_str(),
                &url,
                Some(&self.config.stripe_secret_key),
                &[],
            )
            .await?;
        parse_stripe_page(&payload)
    }
}

// ---------------------------------------------------------------------------
// PayPal customers (page-number pagination)
// ---------------------------------------------------------------------------

pub struct PaypalCustomersAdapter {
    http: Arc<HttpFetcher>,
    config: VendorConfig,
}

impl PaypalCustomersAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: VendorConfig) -> Self {
        Self { http, config }
    }
}

pub fn parse_paypal_page(payload: &JsonValue, page: u64) -> Result<FetchPage, AdapterError> {
    let customers = payload
        .get("customers")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::Payload {
            origin: Source::PaypalCustomers,
            message: "missing customers array".to_string(),
        })?;

    let mut records = Vec::with_capacity(customers.len());
    let mut skipped = 0u64;
    for entry in customers {
        let Some(id) = json_str(entry, &["payer_id"])
            .or_else(|| json_str(entry, &["id"]))
            .and_then(text_or_none)
        else {
            skipped += 1;
            continue;
        };
        let mut contact = NormalizedContact::new(id);
        contact.email = json_str(entry, &["email_address"])
            .or_else(|| json_str(entry, &["email"]))
            .and_then(text_or_none);
        contact.phone = json_str(entry, &["phone", "phone_number", "national_number"])
            .and_then(text_or_none);
        contact.full_name = join_names(
            json_str(entry, &["name", "given_name"]),
            json_str(entry, &["name", "surname"]),
        );
        contact.lifecycle_stage = Some(LifecycleStage::Customer);
        contact.total_paid = json_f64(entry, &["total_paid"]);
        contact.total_spend = json_f64(entry, &["total_paid"]);
        contact.extra = entry.clone();
        records.push(contact);
    }

    let total_pages = json_u64(payload, &["total_pages"]).unwrap_or(page);
    let has_more = page < total_pages;

    Ok(FetchPage {
        records,
        next_cursor: has_more.then(|| (page + 1).to_string()),
        has_more,
        skipped,
    })
}

#[async_trait]
impl SourceAdapter for PaypalCustomersAdapter {
    fn source(&self) -> Source {
        Source::PaypalCustomers
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError> {
        let page = match cursor {
            None => 1,
            Some(raw) => raw.parse::<u64>().map_err(|_| AdapterError::Cursor {
                origin: self.source(),
                cursor: raw.to_string(),
            })?,
        };
        let url = format!(
            "{}/v1/customer/customers?page_size={}&page={}",
            self.config.paypal_base_url, self.config.page_size, page
        );
        let payload = self
            .http
            .get_json(
                self.source().as_str(),
                &url,
                Some(&self.config.paypal_access_token),
                &[],
            )
            .await?;
        parse_paypal_page(&payload, page)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup seam between the controller and concrete adapters, so tests can
/// substitute scripted sources.
pub trait AdapterRegistry: Send + Sync {
    fn adapter_for(&self, source: Source) -> Option<Arc<dyn SourceAdapter>>;
}

/// Production registry wiring each contact source to its HTTP adapter. The
/// invoice-family sources have no contact adapter; they belong to the
/// recovery processor.
pub struct HttpAdapterRegistry {
    ghl: Arc<GhlContactsAdapter>,
    manychat: Arc<ManychatSubscribersAdapter>,
    stripe: Arc<StripeCustomersAdapter>,
    paypal: Arc<PaypalCustomersAdapter>,
}

impl HttpAdapterRegistry {
    pub fn new(http: Arc<HttpFetcher>, config: VendorConfig) -> Self {
        Self {
            ghl: Arc::new(GhlContactsAdapter::new(http.clone(), config.clone())),
            manychat: Arc::new(ManychatSubscribersAdapter::new(http.clone(), config.clone())),
            stripe: Arc::new(StripeCustomersAdapter::new(http.clone(), config.clone())),
            paypal: Arc::new(PaypalCustomersAdapter::new(http, config)),
        }
    }
}

impl AdapterRegistry for HttpAdapterRegistry {
    fn adapter_for(&self, source: Source) -> Option<Arc<dyn SourceAdapter>> {
        match source {
            Source::GhlContacts => Some(self.ghl.clone()),
            Source::ManychatSubscribers => Some(self.manychat.clone()),
            Source::StripeCustomers => Some(self.stripe.clone()),
            Source::PaypalCustomers => Some(self.paypal.clone()),
            Source::Invoices | Source::Dunning | Source::RevenueRecovery => {
                warn!(%source, "no contact adapter registered for source");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery gateway (remote charge-retry batches)
// ---------------------------------------------------------------------------

/// One remote charge-retry batch: per-invoice outcomes plus the position of
/// the next batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecoveryBatch {
    pub succeeded: Vec<RecoveryItem>,
    pub failed: Vec<RecoveryItem>,
    pub skipped: Vec<RecoveryItem>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Remote "retry failed charges" operation. Like `SourceAdapter`, the
/// gateway is side-effect-free with respect to sync state.
#[async_trait]
pub trait RecoveryGateway: Send + Sync {
    async fn retry_batch(
        &self,
        hours_lookback: u32,
        cursor: Option<&str>,
    ) -> Result<RecoveryBatch, AdapterError>;
}

pub struct HttpRecoveryGateway {
    http: Arc<HttpFetcher>,
    base_url: String,
    bearer: String,
}

impl HttpRecoveryGateway {
    pub fn new(http: Arc<HttpFetcher>, base_url: String, bearer: String) -> Self {
        Self {
            http,
            base_url,
            bearer,
        }
    }
}

fn recovery_items(payload: &JsonValue, key: &str) -> Vec<RecoveryItem> {
    let Some(arr) = payload.get(key).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|entry| {
            let invoice_id = json_str(entry, &["invoice_id"])
                .or_else(|| json_str(entry, &["id"]))?
                .to_string();
            Some(RecoveryItem {
                invoice_id,
                amount: json_f64(entry, &["amount"]).unwrap_or(0.0),
                reason: json_str(entry, &["reason"]).map(ToString::to_string),
            })
        })
        .collect()
}

pub fn parse_recovery_batch(payload: &JsonValue) -> Result<RecoveryBatch, AdapterError> {
    if payload.get("succeeded").is_none()
        && payload.get("failed").is_none()
        && payload.get("skipped").is_none()
    {
        return Err(AdapterError::Payload {
            origin: Source::RevenueRecovery,
            message: "response carries no outcome arrays".to_string(),
        });
    }
    let has_more = json_bool(payload, &["has_more"]).unwrap_or(false);
    let next_cursor = json_str(payload, &["next_cursor"])
        .and_then(text_or_none)
        .filter(|_| has_more);
    Ok(RecoveryBatch {
        succeeded: recovery_items(payload, "succeeded"),
        failed: recovery_items(payload, "failed"),
        skipped: recovery_items(payload, "skipped"),
        next_cursor,
        has_more,
    })
}

#[async_trait]
impl RecoveryGateway for HttpRecoveryGateway {
    async fn retry_batch(
        &self,
        hours_lookback: u32,
        cursor: Option<&str>,
    ) -> Result<RecoveryBatch, AdapterError> {
        let mut url = format!(
            "{}/v1/invoices/retry-failed?hours={hours_lookback}",
            self.base_url
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }
        let payload = self
            .http
            .get_json(
                Source::RevenueRecovery.as_str(),
                &url,
                Some(&self.bearer),
                &[],
            )
            .await?;
        parse_recovery_batch(&payload)
    }
}
