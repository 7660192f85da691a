//! HTTP server.
//!
//! Exposes lock detection, the chat webhook callback, and read access to
//! stored detections as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check (returns version) |
//! | `GET`  | `/api/v1/health` | Detector and webhook readiness |
//! | `POST` | `/api/v1/lock/detect` | Multipart upload: `file`, optional `user_id` |
//! | `POST` | `/api/v1/dingtalk/webhook` | Signed chat callback |
//! | `POST` | `/api/v1/dingtalk/configure` | Replace webhook credentials at runtime |
//! | `GET`  | `/api/v1/stats` | Aggregate detection statistics |
//! | `GET`  | `/api/v1/history` | Stored detections, newest first (`limit`, `offset`) |
//! | `GET`  | `/api/v1/detections/{id}` | One stored detection |
//!
//! # Response Contract
//!
//! Every `/api/v1` route answers with the same envelope:
//!
//! ```json
//! { "success": true, "message": "ok", "data": { ... } }
//! ```
//!
//! Every handled failure (missing upload, undecodable image, detector error,
//! malformed callback, bad query parameters, unknown ids, unreadable request
//! bodies) is reported as `success: false` with status 200. Only a bad
//! callback signature uses 401.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::{BytesRejection, JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::classifier::LockStateClassifier;
use crate::config::Config;
use crate::db;
use crate::detector::{create_detector, ModelHandle};
use crate::dispatch::WebhookSink;
use crate::migrate;
use crate::models::Provenance;
use crate::orchestrator::{CallbackContext, CallbackOrchestrator};
use crate::retriever::HttpImageRetriever;
use crate::store::SqliteDetectionStore;

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<CallbackOrchestrator>,
    detector_enabled: bool,
    /// Upload ceiling for `/api/v1/lock/detect`.
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<CallbackOrchestrator>,
        detector_enabled: bool,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            orchestrator,
            detector_enabled,
            max_upload_bytes,
        }
    }

    /// Wire the production components from configuration.
    ///
    /// Opens the database (creating the schema if needed), loads the
    /// detector once, and builds the HTTP retriever and reply sink.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;

        let handle = ModelHandle::new();
        let detector = handle.get_or_init(|| create_detector(&config.detector))?;
        tracing::info!(detector = detector.name(), "object detector loaded");

        let classifier = LockStateClassifier::from_config(config, detector)?;
        let orchestrator = CallbackOrchestrator::new(
            Arc::new(classifier),
            Arc::new(SqliteDetectionStore::new(pool)),
            Arc::new(HttpImageRetriever::new(&config.retrieval)?),
            Arc::new(WebhookSink::new(config.retrieval.timeout_secs)?),
            config.dingtalk.clone(),
        );

        Ok(Self::new(
            Arc::new(orchestrator),
            config.detector.is_enabled(),
            config.retrieval.max_image_bytes,
        ))
    }
}

/// Build the router for `state`. Used by [`run_server`] and by tests that
/// serve the API on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Multipart framing needs headroom beyond the image itself.
    let body_limit = state.max_upload_bytes + 64 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/health", get(handle_api_health))
        .route("/api/v1/lock/detect", post(handle_detect))
        .route("/api/v1/dingtalk/webhook", post(handle_webhook))
        .route("/api/v1/dingtalk/configure", post(handle_configure))
        .route("/api/v1/stats", get(handle_stats))
        .route("/api/v1/history", get(handle_history))
        .route("/api/v1/detections/{id}", get(handle_get_detection))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server.
///
/// Binds to the address configured in `[server].bind` and runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = router(state);

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("lockwatch listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Response envelope ============

#[derive(Serialize)]
struct Envelope {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn ok(message: impl Into<String>, data: impl Serialize) -> Response {
    let body = Envelope {
        success: true,
        message: message.into(),
        data: serde_json::to_value(data).ok(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Handled failure: status 200 with `success: false`.
struct AppError {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: false,
            message: self.message,
            data: None,
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

fn failed(message: impl Into<String>) -> AppError {
    AppError {
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    failed("internal error")
}

/// Extractor rejections get the envelope instead of axum's plain-text body.
fn rejected(rejection: impl std::fmt::Display) -> AppError {
    tracing::debug!(error = %rejection, "request rejected");
    failed(format!("invalid request: {}", rejection))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/v1/health ============

async fn handle_api_health(State(state): State<AppState>) -> Response {
    let settings = state.orchestrator.settings().await;
    ok(
        "ok",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "detector": state.orchestrator.classifier().detector_name(),
            "detector_ready": state.detector_enabled,
            "webhook_configured": settings.is_configured(),
            "reply_url_configured": !settings.webhook_url.is_empty(),
        }),
    )
}

// ============ POST /api/v1/lock/detect ============

#[derive(Deserialize)]
struct DetectQuery {
    user_id: Option<String>,
}

/// Handler for `POST /api/v1/lock/detect`.
///
/// Accepts a multipart form with a `file` part and an optional `user_id`
/// part (or `?user_id=` query parameter). Identical bytes map to the same
/// stored detection; `is_new` tells whether this call created it.
async fn handle_detect(
    State(state): State<AppState>,
    query: Result<Query<DetectQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(rejected)?;
    let mut multipart = multipart.map_err(rejected)?;
    let mut file: Option<Bytes> = None;
    let mut user_id = query.user_id;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| failed(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| failed(format!("failed to read file: {}", e)))?;
                file = Some(bytes);
            }
            Some("user_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| failed(format!("failed to read user_id: {}", e)))?;
                if !text.is_empty() {
                    user_id = Some(text);
                }
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| failed("missing multipart field 'file'"))?;
    if file.is_empty() {
        return Err(failed("uploaded file is empty"));
    }
    if file.len() > state.max_upload_bytes {
        return Err(failed(format!(
            "file exceeds {} bytes",
            state.max_upload_bytes
        )));
    }

    let provenance = Provenance {
        user_id,
        ..Provenance::default()
    };
    match state.orchestrator.detect_upload(&file, &provenance).await {
        Ok(outcome) => {
            let message = if outcome.stored.result.is_safe() {
                "all locks are locked"
            } else {
                "unlocked locks found"
            };
            Ok(ok(
                message,
                serde_json::json!({
                    "detection_id": outcome.stored.id,
                    "is_new": outcome.is_new,
                    "result": outcome.stored.result,
                    "image_base64": outcome.image_base64,
                }),
            ))
        }
        Err(e) => {
            tracing::warn!(error = %e, code = e.code(), "upload detection failed");
            Err(failed(e.to_string()))
        }
    }
}

// ============ POST /api/v1/dingtalk/webhook ============

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Handler for `POST /api/v1/dingtalk/webhook`.
///
/// Reads the `timestamp` and `sign` headers and hands the raw body to the
/// callback orchestrator.
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection).into_response(),
    };
    let ctx = CallbackContext {
        timestamp: header(&headers, "timestamp"),
        signature: header(&headers, "sign"),
        body: body.to_vec(),
    };
    let outcome = state.orchestrator.handle(ctx).await;
    tracing::info!(
        state = ?outcome.final_state(),
        success = outcome.success,
        "webhook handled"
    );

    let status = StatusCode::from_u16(outcome.http_status).unwrap_or(StatusCode::OK);
    let body = Envelope {
        success: outcome.success,
        message: outcome.message,
        data: None,
    };
    (status, Json(body)).into_response()
}

// ============ POST /api/v1/dingtalk/configure ============

#[derive(Deserialize)]
struct ConfigureRequest {
    app_key: String,
    app_secret: String,
    #[serde(default)]
    webhook_url: Option<String>,
}

async fn handle_configure(
    State(state): State<AppState>,
    req: Result<Json<ConfigureRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = req.map_err(rejected)?;
    if req.app_key.trim().is_empty() || req.app_secret.trim().is_empty() {
        return Err(failed("app_key and app_secret must not be empty"));
    }
    state
        .orchestrator
        .configure(&req.app_key, &req.app_secret, req.webhook_url.as_deref())
        .await;
    Ok(ok("webhook configured", Value::Null))
}

// ============ GET /api/v1/stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let stats = state
        .orchestrator
        .store()
        .statistics()
        .await
        .map_err(internal)?;
    Ok(ok("ok", stats))
}

// ============ GET /api/v1/history ============

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn handle_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(rejected)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(failed(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }
    if offset < 0 {
        return Err(failed("offset must not be negative"));
    }

    let rows = state
        .orchestrator
        .store()
        .history(limit, offset)
        .await
        .map_err(internal)?;
    Ok(ok(format!("{} detection(s)", rows.len()), rows))
}

// ============ GET /api/v1/detections/{id} ============

async fn handle_get_detection(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Response, AppError> {
    let Path(id) = id.map_err(rejected)?;
    let row = state
        .orchestrator
        .store()
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| failed(format!("detection {} not found", id)))?;
    Ok(ok("ok", row))
}
