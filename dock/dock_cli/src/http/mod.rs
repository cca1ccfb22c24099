//! HTTP surface of the host.
//!
//! | Method | Path | Meaning |
//! |---|---|---|
//! | POST | `/deploy` | deploy `{"repo": name}` |
//! | POST | `/undeploy` | undeploy `{"repo": name}`, or everything without a body |
//! | GET | `/health` | health report, 503 when unhealthy |
//! | GET | `/deployments` | per-package state |
//! | POST | `/:address` | dispatch the body to the module at `address` |

pub mod error;
pub mod payload;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dock_core::ModuleRequest;
use dock_runtime::DockRuntime;
use serde::Deserialize;
use tracing::info;

pub use error::ApiError;

/// Shared state of the handlers
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<DockRuntime>,
    max_payload_bytes: usize,
}

impl AppState {
    /// State over `runtime`, refusing octet-stream bodies over `max_payload_bytes`
    pub fn new(runtime: Arc<DockRuntime>, max_payload_bytes: usize) -> Self {
        Self {
            runtime,
            max_payload_bytes,
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/undeploy", post(undeploy))
        .route("/health", get(health))
        .route("/deployments", get(deployments))
        .route("/:address", post(dispatch))
        // Body size is enforced by the payload validator.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DeployBody {
    repo: String,
}

#[derive(Debug, Default, Deserialize)]
struct UndeployBody {
    #[serde(default)]
    repo: Option<String>,
}

async fn deploy(State(state): State<AppState>, body: Bytes) -> Result<String, ApiError> {
    let request: DeployBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Expected {{\"repo\": <name>}}: {}", e)))?;

    let summary = state.runtime.deploy(&request.repo).await?;
    Ok(format!(
        "Deployed {} at [{}] in {} ms\n",
        summary.package,
        summary.addresses.join(", "),
        summary.elapsed_ms
    ))
}

async fn undeploy(State(state): State<AppState>, body: Bytes) -> Result<String, ApiError> {
    let request: UndeployBody = if body.iter().all(u8::is_ascii_whitespace) {
        UndeployBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Expected {{\"repo\": <name>}}: {}", e)))?
    };

    let report = state.runtime.undeploy(request.repo.as_deref()).await;
    info!(
        packages = report.packages.len(),
        issues = report.issues.len(),
        "Undeploy requested over HTTP"
    );
    Ok(format!(
        "Undeployed {} package(s), {} module(s) stopped\n",
        report.packages.len(),
        report.modules_stopped
    ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.runtime.health();
    let status = if report.status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn deployments(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.deployments())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn dispatch(
    State(state): State<AppState>,
    Path(address): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let content_type = content_type(request.headers());
    payload::check_declared(
        content_type.as_deref(),
        content_length(request.headers()),
        state.max_payload_bytes,
    )?;

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read body: {}", e)))?;
    payload::validate(content_type.as_deref(), &body, state.max_payload_bytes)?;

    let mut module_request = ModuleRequest::new(address.as_str(), body);
    if let Some(content_type) = content_type {
        module_request = module_request.with_content_type(content_type);
    }

    let reply = state.runtime.dispatch(&address, module_request).await?;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Body::from(reply.body)).into_response();
    if let Some(value) = reply
        .content_type
        .and_then(|ct| header::HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
