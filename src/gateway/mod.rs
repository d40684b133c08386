//! C12 — public gateway.
//!
//! Single externally-reachable `axum` service. Terminates CORS and rate
//! limiting (both reused from the teacher's `middleware` module), resolves
//! `/api/user/*` requests directly against C5, and forwards
//! `/api/{service}/execute` and `/api/{service}/check-schedule` to the
//! named worker's HTTP port (`AppConfig::worker_endpoints`), translating a
//! backend 5xx into a structured 502 so a single worker crash never looks
//! like a gateway bug to the caller.

use crate::config::AppConfig;
use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct GatewayState {
    pub client: reqwest::Client,
    pub worker_urls: HashMap<&'static str, String>,
    pub supervisor_url: String,
    pub forward_timeout: Duration,
    pub user_config: Arc<UserConfigManager>,
    pub metrics_handle: PrometheusHandle,
}

impl GatewayState {
    pub fn new(config: &AppConfig, user_config: Arc<UserConfigManager>, metrics_handle: PrometheusHandle) -> Self {
        let worker_urls = AppConfig::worker_endpoints()
            .into_iter()
            .map(|w| (w.name, format!("http://127.0.0.1:{}", w.port)))
            .collect();
        Self {
            client: reqwest::Client::new(),
            worker_urls,
            supervisor_url: format!("http://127.0.0.1:{}", config.supervisor_port),
            forward_timeout: config.gateway_forward_timeout,
            user_config,
            metrics_handle,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    request_id: String,
    service: String,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>, service: &str, request_id: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail { code, message: message.into(), request_id: request_id.to_string(), service: service.to_string() },
        }),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    state.metrics_handle.render()
}

async fn get_user_config(State(state): State<GatewayState>, Path(user_id): Path<String>) -> Response {
    match state.user_config.get_user_config(&user_id).await {
        Ok(cfg) => Json(cfg).into_response(),
        Err(e) => {
            warn!(error = %e, user_id, "failed to load user config");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "config_load_failed", e.to_string(), "user", &Uuid::new_v4().to_string())
        }
    }
}

#[derive(Deserialize)]
struct UpdateConfigRequest {
    username: Option<String>,
    phone_number: Option<String>,
    news_similarity_threshold: Option<f64>,
    news_impact_threshold: Option<f64>,
    model_type: Option<String>,
}

async fn post_user_config(State(state): State<GatewayState>, Path(user_id): Path<String>, Json(body): Json<UpdateConfigRequest>) -> Response {
    if let (Some(username), Some(phone)) = (&body.username, &body.phone_number) {
        let sim = body.news_similarity_threshold.unwrap_or(0.7);
        let impact = body.news_impact_threshold.unwrap_or(0.8);
        if let Err(e) = state.user_config.upsert_profile(&user_id, username, phone, sim, impact).await {
            return error_response(StatusCode::BAD_REQUEST, "profile_update_failed", e.to_string(), "user", &Uuid::new_v4().to_string());
        }
    }
    if let Some(model_tag) = &body.model_type {
        if let Err(e) = state.user_config.set_model(&user_id, model_tag).await {
            return error_response(StatusCode::BAD_REQUEST, "model_update_failed", e.to_string(), "user", &Uuid::new_v4().to_string());
        }
    }
    Json(serde_json::json!({"status": "ok"})).into_response()
}

#[derive(Deserialize)]
struct StocksRequest {
    stocks: Vec<StockEntry>,
}

async fn post_user_stocks(State(state): State<GatewayState>, Path(user_id): Path<String>, Json(body): Json<StocksRequest>) -> Response {
    match state.user_config.update_stocks(&user_id, &body.stocks).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "stocks_update_failed", e.to_string(), "user", &Uuid::new_v4().to_string()),
    }
}

#[derive(Deserialize)]
struct ModelRequest {
    model_type: String,
}

async fn post_user_model(State(state): State<GatewayState>, Path(user_id): Path<String>, Json(body): Json<ModelRequest>) -> Response {
    match state.user_config.set_model(&user_id, &body.model_type).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "model_update_failed", e.to_string(), "user", &Uuid::new_v4().to_string()),
    }
}

#[derive(Deserialize)]
struct ServicesRequest {
    services: ServiceFlags,
}

async fn post_user_services(State(state): State<GatewayState>, Path(user_id): Path<String>, Json(body): Json<ServicesRequest>) -> Response {
    match state.user_config.update_services(&user_id, &body.services).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "services_update_failed", e.to_string(), "user", &Uuid::new_v4().to_string()),
    }
}

async fn forward(state: &GatewayState, service: &str, suffix: &str, headers: &HeaderMap, body: serde_json::Value) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let Some(base) = state.worker_urls.get(service) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_service", format!("no such service: {service}"), service, &request_id);
    };

    let mut req = state.client.post(format!("{base}{suffix}")).timeout(state.forward_timeout).json(&body);
    if let Some(user_id) = headers.get("X-User-ID") {
        req = req.header("X-User-ID", user_id.clone());
    }

    let result = req.send().await;

    match result {
        Ok(resp) if resp.status().is_server_error() => {
            error!(service, status = %resp.status(), "backend returned 5xx");
            error_response(StatusCode::BAD_GATEWAY, "backend_error", format!("{service} returned {}", resp.status()), service, &request_id)
        }
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK), bytes).into_response()
        }
        Err(e) => {
            error!(service, error = %e, "forward request failed");
            error_response(StatusCode::BAD_GATEWAY, "backend_unreachable", e.to_string(), service, &request_id)
        }
    }
}

async fn supervisor_forward(state: &GatewayState, method_is_post: bool, suffix: &str) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let url = format!("{}{suffix}", state.supervisor_url);
    let req = if method_is_post {
        state.client.post(url).timeout(state.forward_timeout)
    } else {
        state.client.get(url).timeout(state.forward_timeout)
    };

    match req.send().await {
        Ok(resp) if resp.status().is_server_error() => {
            error!(suffix, status = %resp.status(), "supervisor returned 5xx");
            error_response(StatusCode::BAD_GATEWAY, "backend_error", format!("supervisor returned {}", resp.status()), "supervisor", &request_id)
        }
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK), bytes).into_response()
        }
        Err(e) => {
            error!(suffix, error = %e, "supervisor unreachable");
            error_response(StatusCode::BAD_GATEWAY, "backend_unreachable", e.to_string(), "supervisor", &request_id)
        }
    }
}

async fn start_user_services(State(state): State<GatewayState>, Path(user_id): Path<String>) -> Response {
    supervisor_forward(&state, true, &format!("/users/{user_id}/start")).await
}

async fn stop_user_services(State(state): State<GatewayState>, Path(user_id): Path<String>) -> Response {
    supervisor_forward(&state, true, &format!("/users/{user_id}/stop")).await
}

async fn get_user_services_status(State(state): State<GatewayState>, Path(user_id): Path<String>) -> Response {
    supervisor_forward(&state, false, &format!("/users/{user_id}/services")).await
}

async fn execute(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    forward(&state, &service, "/execute", &headers, body).await
}

async fn check_schedule(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    forward(&state, &service, "/check-schedule", &headers, body).await
}

pub fn build_router(state: GatewayState, cors_allowlist: &[String]) -> Router {
    let cors = if cors_allowlist.iter().any(|origin| origin == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors_allowlist.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/user/config/:user_id", get(get_user_config).post(post_user_config))
        .route("/api/user/stocks/:user_id", post(post_user_stocks))
        .route("/api/user/model/:user_id", post(post_user_model))
        .route("/api/user/services/:user_id", post(post_user_services))
        .route("/api/user/services/:user_id/start", post(start_user_services))
        .route("/api/user/services/:user_id/stop", post(stop_user_services))
        .route("/api/user/services/:user_id/status", get(get_user_services_status))
        .route("/api/:service/execute", post(execute))
        .route("/api/:service/check-schedule", post(check_schedule))
        .layer(cors)
        .layer(axum::middleware::from_fn(crate::middleware::request_logging_simple))
        .layer(axum::middleware::from_fn(crate::middleware::request_metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Pool;

    #[tokio::test]
    async fn unknown_service_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("gw.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();
        let user_config = Arc::new(UserConfigManager::new(pool, Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle();

        let state = GatewayState {
            client: reqwest::Client::new(),
            worker_urls: HashMap::new(),
            supervisor_url: "http://127.0.0.1:8090".to_string(),
            forward_timeout: Duration::from_secs(5),
            user_config,
            metrics_handle: handle,
        };
        let resp = forward(&state, "not-a-service", "/execute", &HeaderMap::new(), serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
