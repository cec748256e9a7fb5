use crate::auth::AuthUser;
use crate::config::ApiConfig;
use crate::error::{BomError, Result};
use crate::service::{AddQuantityRequest, BomService, DashboardSummary, ProcessBomRequest};
use crate::streaming::StreamReport;
use crate::supplier::Supplier;
use anyhow::Context;
use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Multipart framing allowance on top of the spreadsheet limit
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const NDJSON: &str = "application/x-ndjson";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BomService>,
}

/// Body of the supplier stream routes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub upload_id: i64,
    #[serde(default)]
    pub rows: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    #[serde(rename = "uploadId")]
    pub upload_id: i64,
    pub qty: i64,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if origins.is_empty() {
            layer.allow_origin(Any)
        } else {
            layer.allow_origin(origins)
        }
    } else {
        CorsLayer::new()
    };

    let upload_limit = config.max_upload_bytes() + MULTIPART_OVERHEAD;
    let max_mb = config.max_upload_mb;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/bom/test", get(checker_test))
        .route(
            "/bom/upload",
            post(move |state: State<AppState>, user: AuthUser, multipart: Multipart| {
                upload(state, user, multipart, max_mb)
            })
            .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/bom/process", patch(process))
        .route("/bom/quantity", patch(add_quantity))
        .route("/bom/stream-digikey", post(stream_digikey))
        .route("/bom/stream-mouser", post(stream_mouser))
        .route("/bom/stream-all", post(stream_all))
        .route("/bom/dashboard", get(dashboard))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "bom-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        ),
    }
}

/// Reachability of the BOM checker
async fn checker_test(State(state): State<AppState>, _user: AuthUser) -> Result<Json<Value>> {
    state.service.health().await?;
    Ok(Json(json!({
        "status": "ok",
        "message": "Bom Checker is running"
    })))
}

#[instrument(skip(state, multipart))]
async fn upload(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
    max_mb: usize,
) -> Result<Json<Value>> {
    let reject = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            BomError::PayloadTooLarge { max_mb }
        } else {
            BomError::Validation(format!("Invalid multipart body: {}", e.body_text()))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(reject)? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("bom.xlsx").to_string();
        let content_type = field.content_type().map(String::from);
        let data = field.bytes().await.map_err(reject)?;
        debug!(file_name = %file_name, size_bytes = data.len(), "Received BOM file");

        let payload = state
            .service
            .upload(&user, &file_name, content_type.as_deref(), data)
            .await?;
        return Ok(Json(payload));
    }

    Err(BomError::Validation("A file field is required".to_string()))
}

#[instrument(skip(state, request))]
async fn process(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<ProcessBomRequest>,
) -> Result<Json<Value>> {
    let rows = state.service.process(request).await?;
    Ok(Json(json!({
        "status": "ok",
        "total_rows": rows.len(),
        "rows": rows,
    })))
}

#[instrument(skip(state))]
async fn add_quantity(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<AddQuantityRequest>,
) -> Result<Json<Value>> {
    let quantities = state.service.add_quantity(request).await?;
    Ok(Json(json!({
        "status": "ok",
        "buildQuantities": quantities,
    })))
}

async fn stream_digikey(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<StreamRequest>,
) -> Result<Response> {
    stream_supplier(state, Supplier::Digikey, request).await
}

async fn stream_mouser(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<StreamRequest>,
) -> Result<Response> {
    stream_supplier(state, Supplier::Mouser, request).await
}

/// Relay a supplier's NDJSON lines as they are recorded
#[instrument(skip(state, request), fields(upload_id = request.upload_id))]
async fn stream_supplier(
    state: AppState,
    supplier: Supplier,
    request: StreamRequest,
) -> Result<Response> {
    let lines = state
        .service
        .stream_supplier(supplier, request.upload_id, request.rows)
        .await?;

    Ok((
        [(header::CONTENT_TYPE, NDJSON)],
        Body::from_stream(lines.map(Ok::<_, Infallible>)),
    )
        .into_response())
}

#[instrument(skip(state, request), fields(upload_id = request.upload_id))]
async fn stream_all(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<StreamRequest>,
) -> Result<Json<Vec<StreamReport>>> {
    state
        .service
        .stream_all(request.upload_id, request.rows)
        .await
        .map(Json)
}

#[instrument(skip(state))]
async fn dashboard(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<DashboardSummary>> {
    state
        .service
        .dashboard_summary(query.upload_id, query.qty)
        .await
        .map(Json)
}

/// Start the BOM API server, draining in-flight requests on `shutdown`
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting BOM API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
