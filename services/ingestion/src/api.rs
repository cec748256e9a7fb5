use crate::auth::AuthUser;
use crate::config::ApiConfig;
use crate::error::{IngestionError, Result};
use crate::service::{
    ConfirmUploadRequest, IngestionService, JobAccepted, JobView, RecentFile,
    StartIngestionRequest, UploadUrlRequest, UploadUrlResponse,
};
use anyhow::Context;
use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

/// Multipart framing allowance on top of the staged file limit
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestionService>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let stage_limit = state.service.max_stage_bytes() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ingestions", post(start_ingestion))
        .route(
            "/ingestions/stage",
            post(stage_upload).layer(DefaultBodyLimit::max(stage_limit)),
        )
        .route("/ingestions/upload-url", post(generate_upload_url))
        .route("/ingestions/:job_id/confirm", post(confirm_upload))
        .route("/ingestions/:job_id", get(job_status))
        .route("/recent", get(recent_files))
        .route("/files/:job_id", get(download_file))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ingestion-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        ),
    }
}

#[instrument(skip(state, request))]
async fn start_ingestion(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<StartIngestionRequest>,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let accepted = state.service.start_ingestion(&user, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[instrument(skip(state, multipart))]
async fn stage_upload(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let max_mb = state.service.max_stage_bytes() / (1024 * 1024);
    let reject = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            IngestionError::PayloadTooLarge { max_mb }
        } else {
            IngestionError::Validation(format!("Invalid multipart body: {}", e.body_text()))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(reject)? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload.zip").to_string();
        let content_type = field.content_type().map(String::from);
        let data = field.bytes().await.map_err(reject)?;

        let accepted = state
            .service
            .stage_upload(&user, &filename, content_type.as_deref(), data)
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(accepted)));
    }

    Err(IngestionError::Validation("A file field is required".to_string()))
}

#[instrument(skip(state, request))]
async fn generate_upload_url(
    State(state): State<AppState>,
    user: AuthUser,
    request: Option<Json<UploadUrlRequest>>,
) -> Result<Json<UploadUrlResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    state.service.generate_upload_url(&user, request).await.map(Json)
}

#[instrument(skip(state, request))]
async fn confirm_upload(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
    request: Option<Json<ConfirmUploadRequest>>,
) -> Result<Json<JobAccepted>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    state
        .service
        .confirm_upload(&user, job_id, request)
        .await
        .map(Json)
}

#[instrument(skip(state))]
async fn job_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>> {
    state.service.job_status(&user, job_id).await.map(Json)
}

#[instrument(skip(state))]
async fn recent_files(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<RecentFile>>> {
    state.service.recent_files(&user, params.limit).await.map(Json)
}

/// Stream a stored archive back to its owner
#[instrument(skip(state))]
async fn download_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Response> {
    let download = state.service.download(&user, job_id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, download.content_type),
            (header::CONTENT_LENGTH, download.content_length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download.filename),
            ),
            (header::ETAG, download.etag),
        ],
        Body::from_stream(download.body),
    )
        .into_response())
}

/// Start the ingestion API server, draining in-flight requests on `shutdown`
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{USER_ID_HEADER, USER_ROLE_HEADER};
    use crate::job_store::{JobStatus, JobStore};
    use crate::service::tests::{fixture, wait_for_terminal, Fixture};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> (Router, Fixture) {
        let f = fixture();
        let config = ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_enabled: false,
            cors_origins: vec![],
        };
        let app = create_router(
            AppState {
                service: f.service.clone(),
            },
            &config,
        );
        (app, f)
    }

    fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder
            .header(USER_ID_HEADER, "42")
            .header(USER_ROLE_HEADER, "PM")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requires_identity() {
        let (app, _) = router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingestions/upload-url")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_source_url_is_bad_request() {
        let (app, _) = router();
        let response = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/ingestions"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"sourceUrl":"not a url"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_stage_and_download_round_trip() {
        let (app, f) = router();
        let boundary = "X-FABSPACE-BOUNDARY";
        let payload = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"board.zip\"\r\n\
             Content-Type: application/zip\r\n\r\nPK\x03\x04body\r\n--{b}--\r\n",
            b = boundary
        );

        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/ingestions/stage"))
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", boundary),
                    )
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "staged");
        let job_id: Uuid = body["jobId"].as_str().unwrap().parse().unwrap();

        let job = wait_for_terminal(&f.jobs, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().uri(format!("/ingestions/{}", job_id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "completed");

        let response = app
            .oneshot(
                authed(Request::builder().uri(format!("/files/{}", job_id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{}.zip\"", job_id)
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"PK\x03\x04body");
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let (app, f) = router();
        let job = f.jobs.create("42", "x.zip", JobStatus::Staged).await.unwrap();

        let response = app
            .oneshot(
                authed(Request::builder().uri(format!("/files/{}", job.id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
