//! C13 — shared worker HTTP scaffold.
//!
//! Every analysis worker (news, disclosure, chart, flow, report) exposes
//! the same three routes so the gateway and scheduler can treat them
//! uniformly: `GET /health`, `POST /execute` (on-demand run for one user),
//! `POST /check-schedule` (the scheduler's periodic trigger), and
//! `POST /set-user/:user_id` (the supervisor pins a single-user worker
//! process to its owning user at spawn time via `HYPERASSET_USER_ID`, but
//! a worker started without that env var accepts it over HTTP instead).

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Run one analysis cycle for `user_id` (or every watching user when
    /// `user_id` is `None`), triggered by `/execute`.
    async fn execute(&self, user_id: Option<&str>) -> Result<serde_json::Value, crate::error::Error>;

    /// Run the scheduler-triggered periodic cycle.
    async fn check_schedule(&self) -> Result<serde_json::Value, crate::error::Error>;
}

struct WorkerCore {
    handler: Arc<dyn WorkerHandler>,
    pinned_user_id: RwLock<Option<String>>,
    service_name: &'static str,
}

#[derive(Clone)]
pub struct WorkerState(Arc<WorkerCore>);

impl WorkerState {
    pub fn new(service_name: &'static str, handler: Arc<dyn WorkerHandler>, pinned_user_id: Option<String>) -> Self {
        Self(Arc::new(WorkerCore { handler, pinned_user_id: RwLock::new(pinned_user_id), service_name }))
    }
}

async fn health(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": state.0.service_name}))
}

#[derive(serde::Deserialize, Default)]
struct ExecuteRequest {
    #[serde(default)]
    user_id: Option<String>,
}

async fn execute(State(state): State<WorkerState>, Json(body): Json<ExecuteRequest>) -> Response {
    let requested = body.user_id.or_else(|| state.0.pinned_user_id.read().clone());
    match state.0.handler.execute(requested.as_deref()).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(service = state.0.service_name, error = %e, "execute failed");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn check_schedule(State(state): State<WorkerState>) -> Response {
    match state.0.handler.check_schedule().await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(service = state.0.service_name, error = %e, "check-schedule failed");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn set_user(State(state): State<WorkerState>, Path(user_id): Path<String>) -> impl IntoResponse {
    info!(service = state.0.service_name, user_id, "worker pinned to user");
    *state.0.pinned_user_id.write() = Some(user_id);
    Json(serde_json::json!({"status": "ok"}))
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/check-schedule", post(check_schedule))
        .route("/set-user/:user_id", post(set_user))
        .layer(axum::middleware::from_fn(crate::middleware::request_logging_simple))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl WorkerHandler for EchoHandler {
        async fn execute(&self, user_id: Option<&str>) -> Result<serde_json::Value, crate::error::Error> {
            Ok(serde_json::json!({"executed_for": user_id}))
        }
        async fn check_schedule(&self) -> Result<serde_json::Value, crate::error::Error> {
            Ok(serde_json::json!({"checked": true}))
        }
    }

    #[tokio::test]
    async fn set_user_pins_subsequent_execute() {
        let state = WorkerState::new("news", Arc::new(EchoHandler), None);
        set_user(State(state.clone()), Path("u1".into())).await;
        assert_eq!(state.0.pinned_user_id.read().as_deref(), Some("u1"));
    }
}
