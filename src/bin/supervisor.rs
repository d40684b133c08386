//! Per-User Service Supervisor Binary (C11)
//!
//! Exposes the supervisor's start/stop/status API over HTTP so the
//! gateway (and any admin caller) can drive it, and runs a background
//! reap loop that restarts any worker that exited unexpectedly. Every
//! other binary in this workspace is HTTP-driven; the supervisor follows
//! the same shape rather than being a bare library the gateway links in-
//! process, so a supervisor crash doesn't take the gateway down with it.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyperasset_core::config::AppConfig;
use hyperasset_core::db::Pool;
use hyperasset_core::notify::{Dispatcher, NullTransport, TelegramTransport};
use hyperasset_core::supervisor::Supervisor;
use hyperasset_core::telemetry;
use hyperasset_core::user_config::UserConfigManager;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
struct SupervisorState {
    supervisor: Arc<Supervisor>,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "supervisor"}))
}

async fn start_user(State(state): State<SupervisorState>, Path(user_id): Path<String>) -> Response {
    match state.supervisor.start_user_services(&user_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(user_id, error = %e, "failed to start user services");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn stop_user(State(state): State<SupervisorState>, Path(user_id): Path<String>) -> Response {
    match state.supervisor.stop_user_services(&user_id).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => {
            error!(user_id, error = %e, "failed to stop user services");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn get_services(State(state): State<SupervisorState>, Path(user_id): Path<String>) -> Response {
    match state.supervisor.get_user_services(&user_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(user_id, error = %e, "failed to read user services");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

fn build_router(state: SupervisorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users/:user_id/start", post(start_user))
        .route("/users/:user_id/stop", post(stop_user))
        .route("/users/:user_id/services", get(get_services))
        .layer(axum::middleware::from_fn(hyperasset_core::middleware::request_logging_simple))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,supervisor=info");

    let pool = Pool::open(
        &config.database_name,
        config.db_pool_size,
        config.db_pool_overflow,
        config.db_conn_max_idle,
        config.db_conn_max_lifetime,
    )
    .context("failed to open relational store")?;
    pool.ensure_schema().await.context("failed to apply schema")?;
    pool.spawn_janitor(std::time::Duration::from_secs(300));

    let user_config = Arc::new(UserConfigManager::new(
        pool.clone(),
        config.user_config_cache_ttl,
        config.default_news_similarity_threshold,
        config.default_news_impact_threshold,
        config.default_model_tag.clone(),
    ));

    let transport: Arc<dyn hyperasset_core::notify::NotifyTransport> =
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                Arc::new(TelegramTransport::new(token.clone(), chat_id.clone(), config.telegram_parse_mode.clone()))
            }
            _ => Arc::new(NullTransport),
        };
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        user_config.clone(),
        transport,
        config.delivery_retry_backoffs.clone(),
        config.delivery_dedup_window,
    ));

    let supervisor = Arc::new(Supervisor::new(
        pool.clone(),
        user_config,
        dispatcher,
        config.supervisor_health_poll_timeout,
        config.max_restarts,
        std::path::PathBuf::from(&config.worker_binary_dir),
    ));

    let reap_handle = {
        let supervisor = supervisor.clone();
        let interval = config.supervisor_reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                supervisor.reap_and_restart().await;
            }
        })
    };

    let state = SupervisorState { supervisor };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.supervisor_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind supervisor port")?;
    info!(addr, "supervisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("supervisor server error")?;
    reap_handle.abort();
    pool.drain().await;
    Ok(())
}
