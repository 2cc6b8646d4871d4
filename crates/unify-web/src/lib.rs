//! Axum JSON admin API over the sync controller and recovery processor.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;
use unify_core::{MergeConflict, NormalizedContact, ResolveAction, Source, SyncRun};
use unify_store::ConflictStore;
use unify_sync::{
    IdentityResolver, PageOutcome, RecoveryOutcome, RecoveryProcessor, SyncController, SyncError,
    SyncRuntime,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SyncController>,
    pub resolver: Arc<IdentityResolver>,
    pub recovery: Arc<RecoveryProcessor>,
    pub conflicts: Arc<dyn ConflictStore>,
    pub admin_token: String,
}

impl AppState {
    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self {
            controller: runtime.controller.clone(),
            resolver: runtime.resolver.clone(),
            recovery: runtime.recovery.clone(),
            conflicts: runtime.conflicts.clone(),
            admin_token: runtime.config.admin_token.clone(),
        }
    }
}

/// JSON error envelope plus the status the failure maps to.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::Conflict(_) | SyncError::InvalidState { .. } => StatusCode::CONFLICT,
            SyncError::RunNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::NoAdapter(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::Transport { .. } | SyncError::Auth { .. } => StatusCode::BAD_GATEWAY,
            SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let admin = Router::new()
        .route("/sync/start", post(sync_start_handler))
        .route("/sync/sweep", post(sync_sweep_handler))
        .route("/sync/{id}", get(sync_status_handler))
        .route("/sync/{id}/continue", post(sync_continue_handler))
        .route("/sync/{id}/cancel", post(sync_cancel_handler))
        .route("/sync/{id}/pause", post(sync_pause_handler))
        .route("/sync/{id}/resume", post(sync_resume_handler))
        .route("/identity/merge", post(identity_merge_handler))
        .route("/identity/unify", post(identity_unify_handler))
        .route("/identity/conflicts", get(identity_conflicts_handler))
        .route("/recovery/run", post(recovery_run_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
    Router::new()
        .route("/health", get(health_handler))
        .merge(admin)
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = SyncRuntime::from_env().await?;
    serve(runtime).await
}

pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let port: u16 = std::env::var("UNIFY_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    if runtime.config.admin_token.is_empty() {
        warn!("UNIFY_ADMIN_TOKEN is unset; all admin routes will reject");
    }
    let state = AppState::from_runtime(&runtime);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-admin-secret").and_then(|v| v.to_str().ok()))
}

/// Admin credential gate. Runs before any handler, so a rejected caller
/// never mutates state.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = !state.admin_token.is_empty()
        && presented_token(req.headers()) == Some(state.admin_token.as_str());
    if !authorized {
        return ApiError(
            StatusCode::UNAUTHORIZED,
            "admin credential required".to_string(),
        )
        .into_response();
    }
    next.run(req).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

#[derive(Debug, Deserialize)]
struct StartSyncRequest {
    source: Source,
    #[serde(default)]
    dry_run: bool,
}

async fn sync_start_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSyncRequest>,
) -> Result<Json<SyncRun>, ApiError> {
    let run = state.controller.start(req.source, req.dry_run).await?;
    Ok(Json(run))
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<SyncRun>, ApiError> {
    Ok(Json(state.controller.run(id).await?))
}

async fn sync_continue_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<PageOutcome>, ApiError> {
    Ok(Json(state.controller.process_next_page(id).await?))
}

async fn sync_cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<SyncRun>, ApiError> {
    Ok(Json(state.controller.cancel(id).await?))
}

async fn sync_pause_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<SyncRun>, ApiError> {
    Ok(Json(state.controller.pause(id).await?))
}

async fn sync_resume_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<SyncRun>, ApiError> {
    Ok(Json(state.controller.resume(id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct SweepRequest {
    source: Option<Source>,
    idle_minutes: Option<u64>,
}

async fn sync_sweep_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SweepRequest>,
) -> Result<Json<BTreeMap<String, u64>>, ApiError> {
    let threshold = req.idle_minutes.map(|mins| Duration::from_secs(mins * 60));
    let targets: Vec<Source> = match req.source {
        Some(source) => vec![source],
        None => Source::ALL.to_vec(),
    };
    let mut swept = BTreeMap::new();
    for source in targets {
        let count = state.controller.sweep_stale(source, threshold).await?;
        swept.insert(source.as_str().to_string(), count);
    }
    Ok(Json(swept))
}

#[derive(Debug, Deserialize)]
struct ContactRequest {
    source: Source,
    contact: NormalizedContact,
    /// When set, report the would-be action without writing.
    #[serde(default)]
    dry_run: bool,
}

/// Merge one submitted contact into the canonical store; `dry_run`
/// previews the action instead.
async fn identity_merge_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequest>,
) -> Result<Json<ResolveAction>, ApiError> {
    let action = state
        .resolver
        .resolve(&req.contact, req.source, req.dry_run)
        .await?;
    Ok(Json(action))
}

/// Resolve a contact against the canonical store, writing the merge. Same
/// idempotent resolution as the sync pipeline, wrapped in a success
/// envelope for RPC callers.
async fn identity_unify_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = state.resolver.resolve(&req.contact, req.source, false).await?;
    let mut body = json!({ "success": true });
    if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(&action) {
        for (key, value) in fields {
            body[key.as_str()] = value;
        }
    }
    Ok(Json(body))
}

async fn identity_conflicts_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MergeConflict>>, ApiError> {
    let conflicts = state
        .conflicts
        .open_conflicts()
        .await
        .map_err(SyncError::from)?;
    Ok(Json(conflicts))
}

#[derive(Debug, Deserialize)]
struct RecoveryRequest {
    #[serde(default = "default_hours_lookback")]
    hours_lookback: u32,
}

fn default_hours_lookback() -> u32 {
    72
}

async fn recovery_run_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoveryRequest>,
) -> Result<Json<RecoveryOutcome>, ApiError> {
    // HTTP callers have no cancel channel; the batch ceiling bounds the loop.
    let outcome = state
        .recovery
        .run_recovery(req.hours_lookback, &AtomicBool::new(false))
        .await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;
    use unify_adapters::{
        AdapterError, AdapterRegistry, FetchPage, RecoveryBatch, RecoveryGateway, SourceAdapter,
    };
    use unify_core::RecoveryItem;
    use unify_store::{ClientStore, JobStateStore, MemoryStore, SyncRunStore};
    use unify_sync::RecoveryConfig;

    const TOKEN: &str = "test-secret";

    struct ScriptedAdapter {
        source: Source,
        pages: Vec<Vec<NormalizedContact>>,
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, AdapterError> {
            let index: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let records = self.pages.get(index).cloned().unwrap_or_default();
            let has_more = index + 1 < self.pages.len();
            Ok(FetchPage {
                records,
                next_cursor: has_more.then(|| (index + 1).to_string()),
                has_more,
                skipped: 0,
            })
        }
    }

    struct SingleRegistry(Arc<dyn SourceAdapter>);

    impl AdapterRegistry for SingleRegistry {
        fn adapter_for(&self, source: Source) -> Option<Arc<dyn SourceAdapter>> {
            (self.0.source() == source).then(|| self.0.clone())
        }
    }

    struct FiniteGateway {
        batches: u32,
    }

    #[async_trait]
    impl RecoveryGateway for FiniteGateway {
        async fn retry_batch(
            &self,
            _hours_lookback: u32,
            cursor: Option<&str>,
        ) -> Result<RecoveryBatch, AdapterError> {
            let index: u32 = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let has_more = index + 1 < self.batches;
            Ok(RecoveryBatch {
                succeeded: vec![RecoveryItem {
                    invoice_id: format!("inv_{index}"),
                    amount: 40.0,
                    reason: None,
                }],
                failed: Vec::new(),
                skipped: Vec::new(),
                next_cursor: has_more.then(|| (index + 1).to_string()),
                has_more,
            })
        }
    }

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        _state_dir: tempfile::TempDir,
    }

    fn harness(pages: Vec<Vec<NormalizedContact>>) -> Harness {
        let store = MemoryStore::shared();
        let resolver = Arc::new(IdentityResolver::new(store.clone(), store.clone()));
        let registry = Arc::new(SingleRegistry(Arc::new(ScriptedAdapter {
            source: Source::GhlContacts,
            pages,
        })));
        let controller = Arc::new(SyncController::new(
            store.clone(),
            store.clone(),
            resolver.clone(),
            registry,
        ));
        let state_dir = tempdir().unwrap();
        let recovery = Arc::new(RecoveryProcessor::new(
            Arc::new(FiniteGateway { batches: 2 }),
            store.clone(),
            JobStateStore::new(state_dir.path()),
            RecoveryConfig {
                max_batches: 500,
                inter_batch_delay: Duration::from_millis(0),
            },
        ));
        let app = app(AppState {
            controller,
            resolver,
            recovery,
            conflicts: store.clone(),
            admin_token: TOKEN.to_string(),
        });
        Harness {
            app,
            store,
            _state_dir: state_dir,
        }
    }

    fn authed_post(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn authed_get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .header("x-admin-secret", TOKEN)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn contact(n: usize) -> NormalizedContact {
        let mut c = NormalizedContact::new(format!("ext_{n}"));
        c.email = Some(format!("user{n}@example.com"));
        c
    }

    #[tokio::test]
    async fn health_needs_no_credential() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn admin_routes_reject_missing_and_wrong_credentials() {
        let h = harness(vec![vec![contact(1)]]);

        let missing = h
            .app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/start")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"source": "ghl-contacts"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = h
            .app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/start")
                    .header("authorization", "Bearer nope")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"source": "ghl-contacts"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        // Rejection happened before the handler: no run was created.
        assert!(h
            .store
            .find_active(Source::GhlContacts)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn start_continue_status_flow() {
        let h = harness(vec![vec![contact(1), contact(2)], vec![contact(3)]]);

        let started = h
            .app
            .clone()
            .oneshot(authed_post("/sync/start", json!({"source": "ghl-contacts"})))
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::OK);
        let run = json_body(started).await;
        let id = run["id"].as_str().unwrap().to_string();
        assert_eq!(run["status"], "running");

        // Second start for the same source is refused while the first is live.
        let second = h
            .app
            .clone()
            .oneshot(authed_post("/sync/start", json!({"source": "ghl-contacts"})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let first_page = h
            .app
            .clone()
            .oneshot(authed_post(&format!("/sync/{id}/continue"), json!({})))
            .await
            .unwrap();
        assert_eq!(first_page.status(), StatusCode::OK);
        assert_eq!(json_body(first_page).await["has_more"], true);

        let last_page = h
            .app
            .clone()
            .oneshot(authed_post(&format!("/sync/{id}/continue"), json!({})))
            .await
            .unwrap();
        let outcome = json_body(last_page).await;
        assert_eq!(outcome["has_more"], false);
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["counters"]["fetched"], 3);

        let status = h
            .app
            .oneshot(authed_get(&format!("/sync/{id}")))
            .await
            .unwrap();
        assert_eq!(json_body(status).await["status"], "completed");
        assert_eq!(h.store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_run_is_404_and_cancel_is_conflict_after_terminal() {
        let h = harness(vec![vec![contact(1)]]);

        let missing = h
            .app
            .clone()
            .oneshot(authed_post(
                &format!("/sync/{}/cancel", Uuid::new_v4()),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let started = h
            .app
            .clone()
            .oneshot(authed_post("/sync/start", json!({"source": "ghl-contacts"})))
            .await
            .unwrap();
        let id = json_body(started).await["id"].as_str().unwrap().to_string();
        let canceled = h
            .app
            .clone()
            .oneshot(authed_post(&format!("/sync/{id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(canceled).await["status"], "canceled");

        let again = h
            .app
            .oneshot(authed_post(&format!("/sync/{id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn start_without_adapter_is_unprocessable() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(authed_post("/sync/start", json!({"source": "invoices"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn sweep_reports_per_source_counts() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(authed_post("/sync/sweep", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let counts = json_body(resp).await;
        assert_eq!(counts["ghl-contacts"], 0);
        assert_eq!(counts["stripe-customers"], 0);
    }

    #[tokio::test]
    async fn merge_endpoint_surfaces_conflicts() {
        let h = harness(vec![]);

        let mut a = unify_core::CanonicalClient::new();
        a.email = Some("shared@example.com".to_string());
        h.store.insert(&a).await.unwrap();
        let mut b = unify_core::CanonicalClient::new();
        b.phone = Some("+15550001111".to_string());
        h.store.insert(&b).await.unwrap();

        let mut incoming = NormalizedContact::new("sub_1");
        incoming.email = Some("shared@example.com".to_string());
        incoming.phone = Some("5550001111".to_string());

        let resp = h
            .app
            .clone()
            .oneshot(authed_post(
                "/identity/merge",
                json!({
                    "source": "manychat-subscribers",
                    "contact": serde_json::to_value(&incoming).unwrap(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["action"], "conflict");

        let listed = h
            .app
            .oneshot(authed_get("/identity/conflicts"))
            .await
            .unwrap();
        let conflicts = json_body(listed).await;
        assert_eq!(conflicts.as_array().unwrap().len(), 1);
        assert_eq!(conflicts[0]["reason"], "ambiguous_identity");
    }

    #[tokio::test]
    async fn merge_dry_run_previews_without_writing() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(authed_post(
                "/identity/merge",
                json!({
                    "source": "ghl-contacts",
                    "contact": serde_json::to_value(&contact(1)).unwrap(),
                    "dry_run": true,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["action"], "created");
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unify_endpoint_merges_idempotently() {
        let h = harness(vec![]);
        let body = json!({
            "source": "ghl-contacts",
            "contact": serde_json::to_value(&contact(1)).unwrap(),
        });

        let first = h
            .app
            .clone()
            .oneshot(authed_post("/identity/unify", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = json_body(first).await;
        assert_eq!(first["success"], true);
        assert_eq!(first["action"], "created");
        let client_id = first["client_id"].as_str().unwrap().to_string();

        // Submitting the same contact again updates the same client.
        let second = h
            .app
            .oneshot(authed_post("/identity/unify", body))
            .await
            .unwrap();
        let second = json_body(second).await;
        assert_eq!(second["action"], "updated");
        assert_eq!(second["client_id"], client_id.as_str());
        assert_eq!(h.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recovery_endpoint_runs_to_completion() {
        let h = harness(vec![]);
        let resp = h
            .app
            .oneshot(authed_post("/recovery/run", json!({"hours_lookback": 24})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["batches_done"], 2);
        assert_eq!(outcome["has_more"], false);
        assert_eq!(outcome["succeeded"], 2);
        assert_eq!(outcome["recovered_amount"], 80.0);
    }
}
