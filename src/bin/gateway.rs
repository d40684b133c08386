//! Gateway Binary (C12)
//!
//! The single externally-reachable HTTP surface. Resolves user
//! configuration directly and forwards `/api/{service}/*` traffic to the
//! analysis worker listening on that service's port.
//!
//! Usage:
//!   gateway
//!
//! Environment: see `hyperasset_core::config::AppConfig`.

use anyhow::{Context, Result};
use hyperasset_core::config::AppConfig;
use hyperasset_core::db::Pool;
use hyperasset_core::gateway::{self, GatewayState};
use hyperasset_core::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
use hyperasset_core::telemetry;
use hyperasset_core::user_config::UserConfigManager;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,gateway=info");
    let metrics_handle = telemetry::init_metrics();

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

    let state = GatewayState::new(&config, user_config, metrics_handle);
    let rate_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: config.rate_limit_max_requests,
        window: config.rate_limit_window,
        ..Default::default()
    });
    let app = gateway::build_router(state, &config.cors_allowlist)
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware));

    let addr = format!("0.0.0.0:{}", config.gateway_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind gateway port")?;
    info!(addr, "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("gateway server error")?;
    pool.drain().await;
    Ok(())
}
