use crate::config::{ApiConfig, ImageConfig};
use crate::error::StorageError;
use crate::ingest::{record_run, DetectionRun, RunReceipt};
use crate::model::{SessionSummary, SessionView};
use crate::storage::PredictionStorage;
use crate::validation::{validate_detection, validate_score, LabelVocabulary};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn PredictionStorage>,
    pub vocabulary: Arc<LabelVocabulary>,
    pub images: ImageConfig,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Map a storage failure to a response. Backend detail is logged, never returned.
fn storage_error(e: StorageError) -> ApiError {
    if !e.is_client_error() {
        error!(error = %e, "Storage operation failed");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Storage operation failed",
            "STORAGE_ERROR",
        );
    }

    match e {
        StorageError::NotFound { uid } => api_error(
            StatusCode::NOT_FOUND,
            format!("Prediction not found: {uid}"),
            "NOT_FOUND",
        ),
        other => api_error(StatusCode::BAD_REQUEST, other.to_string(), "VALIDATION_ERROR"),
    }
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

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/predict", post(predict))
        .route("/prediction/:uid", get(get_prediction))
        .route("/prediction/:uid/image", get(get_prediction_image))
        .route("/image/:kind/:filename", get(get_image))
        .route("/predictions/label/:label", get(predictions_by_label))
        .route("/predictions/score/:min_score", get(predictions_by_score))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.check_health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "storage": "disconnected"
                })),
            )
        }
    }
}

/// Record one detection run
#[instrument(skip_all)]
async fn predict(
    State(state): State<AppState>,
    Json(run): Json<DetectionRun>,
) -> Result<Json<RunReceipt>, ApiError> {
    for detection in &run.detections {
        validate_detection(detection)
            .and_then(|_| state.vocabulary.validate(&detection.label))
            .map_err(storage_error)?;
    }

    let receipt = record_run(state.storage.as_ref(), &run)
        .await
        .map_err(storage_error)?;
    Ok(Json(receipt))
}

#[instrument(skip(state))]
async fn get_prediction(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .storage
        .get_prediction(&uid)
        .await
        .map(Json)
        .map_err(storage_error)
}

/// Serve the annotated image of a session in the format the client accepts
#[instrument(skip(state, headers))]
async fn get_prediction_image(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = state
        .storage
        .get_prediction(&uid)
        .await
        .map_err(storage_error)?;

    let bytes = read_image(FsPath::new(&session.predicted_image)).await?;

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let content_type = negotiate_image_type(accept).ok_or_else(|| {
        api_error(
            StatusCode::NOT_ACCEPTABLE,
            "Client does not accept an image format",
            "NOT_ACCEPTABLE",
        )
    })?;

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

/// Serve a stored original or predicted image by file name
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path((kind, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let dir = match kind.as_str() {
        "original" => state.images.original_dir(),
        "predicted" => state.images.predicted_dir(),
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Invalid image type",
                "INVALID_IMAGE_TYPE",
            ))
        }
    };

    let filename = sanitize_file_name(&filename).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Invalid file name",
            "INVALID_FILE_NAME",
        )
    })?;

    let bytes = read_image(&dir.join(&filename)).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for(&filename))], bytes).into_response())
}

#[instrument(skip(state))]
async fn predictions_by_label(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    state.vocabulary.validate(&label).map_err(storage_error)?;

    state
        .storage
        .get_predictions_by_label(&label)
        .await
        .map(Json)
        .map_err(storage_error)
}

#[instrument(skip(state))]
async fn predictions_by_score(
    State(state): State<AppState>,
    Path(min_score): Path<f64>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let min_score = validate_score(min_score).map_err(storage_error)?;

    state
        .storage
        .get_predictions_by_score(min_score)
        .await
        .map(Json)
        .map_err(storage_error)
}

async fn read_image(path: &FsPath) -> Result<Vec<u8>, ApiError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(api_error(
            StatusCode::NOT_FOUND,
            "Image not found",
            "NOT_FOUND",
        )),
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to read image");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read image",
                "IO_ERROR",
            ))
        }
    }
}

/// PNG wins over JPEG when both are listed
fn negotiate_image_type(accept: &str) -> Option<&'static str> {
    if accept.contains("image/png") {
        Some("image/png")
    } else if accept.contains("image/jpeg") || accept.contains("image/jpg") {
        Some("image/jpeg")
    } else {
        None
    }
}

/// Keep a single path component. Anything that could escape the image
/// directory is rejected.
fn sanitize_file_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    if cleaned.is_empty() || cleaned.starts_with('.') {
        None
    } else {
        Some(cleaned)
    }
}

fn content_type_for(filename: &str) -> &'static str {
    let extension = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Start the prediction API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting prediction API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
