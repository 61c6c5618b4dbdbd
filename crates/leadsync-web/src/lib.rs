//! Axum ingress for the sync engine: the reply webhook, the cron trigger,
//! and the maintenance endpoints. Everything speaks JSON; everything but
//! the health probe requires the shared bearer secret when one is set.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadsync_core::extract_payload_field;
use leadsync_engine::{SyncEngine, SyncError};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leadsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub ingress_secret: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, ingress_secret: Option<String>) -> Self {
        Self {
            engine,
            ingress_secret,
        }
    }
}

/// Key spellings accepted in the reply-webhook body. The platform posts
/// many more fields; only lead and campaign identity matter here, matched
/// case-insensitively.
const WEBHOOK_EMAIL_KEYS: &[&str] = &["lead_email", "email", "lead"];
const WEBHOOK_CAMPAIGN_KEYS: &[&str] = &["campaign_id", "campaign"];

#[derive(Debug, Clone, Deserialize, Default)]
struct BackfillParams {
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct CleanupParams {
    client_id: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/lead-sync", post(lead_webhook_handler))
        .route("/cron/sync", post(cron_sync_handler))
        .route("/sync/clients/{client_id}", post(client_sync_handler))
        .route("/maintenance/backfill", post(backfill_handler))
        .route("/maintenance/cleanup", post(cleanup_handler))
        .route("/maintenance/reset", post(reset_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(engine: Arc<SyncEngine>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("LEADSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let secret = std::env::var("LEADSYNC_INGRESS_SECRET").ok();
    if secret.is_none() {
        warn!("LEADSYNC_INGRESS_SECRET is unset, ingress runs unauthenticated");
    }
    let state = AppState::new(engine, secret);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ingress listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn lead_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<JsonMap<String, JsonValue>>,
) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    let Some(lead_email) = extract_payload_field(&payload, WEBHOOK_EMAIL_KEYS) else {
        return bad_request("payload names no lead email");
    };
    let Some(campaign_id) = extract_payload_field(&payload, WEBHOOK_CAMPAIGN_KEYS) else {
        return bad_request("payload names no campaign");
    };
    match state.engine.sync_single_lead(&lead_email, &campaign_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn cron_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    match state.engine.sync_all_clients().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn client_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(client_id): AxumPath<String>,
) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    match state.engine.sync_client_data(&client_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<BackfillParams>,
) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    let limit = params.limit.unwrap_or(100);
    match state.engine.backfill_positives(limit, params.cursor).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CleanupParams>,
) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    match state
        .engine
        .cleanup_campaigns(params.client_id.as_deref(), params.dry_run)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn reset_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(denied) = require_secret(&state, &headers) {
        return denied;
    }
    match state.engine.reset_all().await {
        Ok(()) => Json(serde_json::json!({ "reset": true })).into_response(),
        Err(err) => sync_error_response(err),
    }
}

/// Bearer-secret check. Returns the rejection response to send, or `None`
/// when the request may proceed.
fn require_secret(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(expected) = &state.ingress_secret else {
        return None;
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        None
    } else {
        Some(
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid or missing bearer token" })),
            )
                .into_response(),
        )
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn sync_error_response(err: SyncError) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(%err, status = status.as_u16(), "ingress request failed");
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use leadsync_engine::{NoopAlertSink, SyncConfig};
    use leadsync_source::{
        DailyAnalyticsRow, EmailFilter, ExternalEmail, ExternalLead, LeadQuery, LeadSource, Page,
        ReplyRequest, SourceError,
    };
    use leadsync_store::{LeadStore, MemoryLeadStore};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Source stub with a fixed lead pool, enough for ingress-level tests.
    #[derive(Default)]
    struct StubSource {
        leads: Vec<ExternalLead>,
    }

    #[async_trait]
    impl LeadSource for StubSource {
        async fn list_leads(
            &self,
            _campaign_id: Option<&str>,
            query: &LeadQuery,
        ) -> Result<Page<ExternalLead>, SourceError> {
            let items = self
                .leads
                .iter()
                .filter(|l| match &query.search {
                    Some(search) => l.email.to_ascii_lowercase().contains(search.as_str()),
                    None => true,
                })
                .cloned()
                .collect();
            Ok(Page {
                items,
                next_starting_after: None,
            })
        }

        async fn list_emails(
            &self,
            _filter: &EmailFilter,
        ) -> Result<Page<ExternalEmail>, SourceError> {
            Ok(Page {
                items: vec![],
                next_starting_after: None,
            })
        }

        async fn campaign_daily_analytics(
            &self,
            _campaign_id: &str,
            _start: chrono::NaiveDate,
            _end: chrono::NaiveDate,
        ) -> Result<Vec<DailyAnalyticsRow>, SourceError> {
            Ok(vec![])
        }

        async fn campaigns_for_email(&self, _email: &str) -> Result<Vec<String>, SourceError> {
            Ok(vec![])
        }

        async fn reply_to_email(&self, _request: &ReplyRequest) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn test_engine(store: Arc<MemoryLeadStore>, source: StubSource) -> Arc<SyncEngine> {
        let config = SyncConfig {
            page_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            client_delay: Duration::ZERO,
            ..SyncConfig::default()
        };
        Arc::new(SyncEngine::new(
            config,
            Arc::new(source),
            store,
            Arc::new(NoopAlertSink),
        ))
    }

    fn lead(id: &str, email: &str) -> ExternalLead {
        ExternalLead {
            id: id.to_string(),
            email: email.to_string(),
            campaign: None,
            lt_interest_status: None,
            email_reply_count: 0,
            email_open_count: 0,
            status: 1,
            payload: serde_json::Map::new(),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_secret() {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = test_engine(store, StubSource::default());
        let app = app(AppState::new(engine, Some("s3cret".to_string())));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected() {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = test_engine(store, StubSource::default());
        let app = app(AppState::new(engine, Some("s3cret".to_string())));

        let resp = app
            .oneshot(post_json("/cron/sync", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_for_unmapped_campaign_is_404() {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = test_engine(store.clone(), StubSource::default());
        let app = app(AppState::new(engine, None));

        let resp = app
            .oneshot(post_json(
                "/webhooks/lead-sync",
                serde_json::json!({ "lead_email": "a@x.com", "campaign_id": "c-nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(store.lead_count(), 0);
    }

    #[tokio::test]
    async fn webhook_without_identity_fields_is_400() {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = test_engine(store, StubSource::default());
        let app = app(AppState::new(engine, None));

        let resp = app
            .oneshot(post_json(
                "/webhooks/lead-sync",
                serde_json::json!({ "event": "reply_received" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_syncs_the_lead_and_reports_counts() {
        let store = Arc::new(MemoryLeadStore::new());
        store.seed_mapping("k1", "c1");
        let source = StubSource {
            leads: vec![lead("l1", "A@X.com")],
        };
        let engine = test_engine(store.clone(), source);
        let app = app(AppState::new(engine, Some("s3cret".to_string())));

        // Key casing varies between platform webhook versions.
        let mut request = post_json(
            "/webhooks/lead-sync",
            serde_json::json!({ "Email": "a@x.com", "Campaign_ID": "c1" }),
        );
        request.headers_mut().insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_static("Bearer s3cret"),
        );
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["client_ids"], serde_json::json!(["k1"]));
        assert_eq!(body["interest_status"], serde_json::json!("positive"));
        assert_eq!(body["leads_upserted"], serde_json::json!(1));
        assert_eq!(store.lead_count(), 1);
    }

    #[tokio::test]
    async fn cron_sync_reports_a_run_summary() {
        let store = Arc::new(MemoryLeadStore::new());
        store.seed_mapping("k1", "c1");
        let source = StubSource {
            leads: vec![lead("l1", "a@x.com")],
        };
        let engine = test_engine(store.clone(), source);
        let app = app(AppState::new(engine, None));

        let resp = app
            .oneshot(post_json("/cron/sync", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["clients_synced"], serde_json::json!(1));
        assert_eq!(body["clients_failed"], serde_json::json!(0));
        assert_eq!(store.lead_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_honors_dry_run() {
        let store = Arc::new(MemoryLeadStore::new());
        store.seed_mapping("k1", "c1");
        let engine = test_engine(store.clone(), StubSource::default());

        // One stored lead the (empty) external campaign no longer lists.
        let record = leadsync_engine::lead_record_from_external(
            "k1",
            "c1",
            &lead("l1", "gone@x.com"),
            None,
            chrono::Utc::now(),
        );
        store.upsert_leads(&[record]).await.unwrap();

        let app = app(AppState::new(engine, None));
        let resp = app
            .clone()
            .oneshot(post_json(
                "/maintenance/cleanup?client_id=k1&dry_run=true",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["dry_run"], serde_json::json!(true));
        assert_eq!(
            body["campaigns"][0]["removed"],
            serde_json::json!(["gone@x.com"])
        );
        assert_eq!(store.lead_count(), 1);

        let resp = app
            .oneshot(post_json(
                "/maintenance/cleanup?client_id=k1",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.lead_count(), 0);
    }

    #[tokio::test]
    async fn reset_wipes_synced_state() {
        let store = Arc::new(MemoryLeadStore::new());
        store.seed_mapping("k1", "c1");
        let record = leadsync_engine::lead_record_from_external(
            "k1",
            "c1",
            &lead("l1", "a@x.com"),
            None,
            chrono::Utc::now(),
        );
        store.upsert_leads(&[record]).await.unwrap();
        let engine = test_engine(store.clone(), StubSource::default());
        let app = app(AppState::new(engine, None));

        let resp = app
            .oneshot(post_json("/maintenance/reset", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.lead_count(), 0);
    }
}
