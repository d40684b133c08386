//! Chart Condition Worker (C7 chart engine, behind the C13 scaffold)
//!
//! Polls KIS for each watched stock's current quote, feeds it into the
//! realtime indicator state, and dispatches alerts for any of the eight
//! named conditions that fire. Market-close cadence: the scheduler's
//! `/check-schedule` ping runs one polling pass per watched stock during
//! the close window; `/execute` runs the same pass on demand.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyperasset_core::cadence::CadenceGate;
use hyperasset_core::chart::ChartEngine;
use hyperasset_core::config::{AppConfig, Cadence};
use hyperasset_core::db::Pool;
use hyperasset_core::error::Error;
use hyperasset_core::notify::{Dispatcher, NullTransport, TelegramTransport};
use hyperasset_core::sources::KisPriceHistorySource;
use hyperasset_core::telemetry;
use hyperasset_core::user_config::UserConfigManager;
use hyperasset_core::worker::{self, WorkerHandler, WorkerState};
use std::sync::Arc;
use tracing::{info, warn};

struct ChartHandler {
    pool: Arc<Pool>,
    engine: Arc<ChartEngine>,
    quotes: Arc<KisPriceHistorySource>,
    gate: CadenceGate,
}

async fn watched_stocks(pool: &Pool, user_id: Option<&str>) -> Result<Vec<(String, String)>, Error> {
    let user_id = user_id.map(|s| s.to_string());
    pool.with_conn(move |conn| {
        let rows = match &user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT us.stock_code, us.stock_name FROM user_stocks us
                     JOIN user_services s ON s.user_id = us.user_id
                     WHERE us.enabled = 1 AND s.chart = 1 AND us.user_id = ?1",
                )?;
                stmt.query_map([uid], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT us.stock_code, us.stock_name FROM user_stocks us
                     JOIN user_services s ON s.user_id = us.user_id
                     WHERE us.enabled = 1 AND s.chart = 1",
                )?;
                stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
    .await
}

impl ChartHandler {
    async fn poll_all(&self, user_id: Option<&str>) -> Result<serde_json::Value, Error> {
        let stocks = watched_stocks(&self.pool, user_id).await?;
        let mut fired_total = 0usize;
        for (code, name) in &stocks {
            match self.quotes.fetch_quote(code).await {
                Ok((price, volume)) => match self.engine.on_tick(code, name, chrono::Utc::now(), price, volume).await {
                    Ok(fired) => fired_total += fired.len(),
                    Err(e) => warn!(stock_code = code, error = %e, "chart tick processing failed, continuing"),
                },
                Err(e) => warn!(stock_code = code, error = %e, "quote fetch failed, continuing"),
            }
        }
        Ok(serde_json::json!({"executed": true, "stocks_processed": stocks.len(), "conditions_fired": fired_total}))
    }
}

#[async_trait]
impl WorkerHandler for ChartHandler {
    async fn execute(&self, user_id: Option<&str>) -> Result<serde_json::Value, Error> {
        self.poll_all(user_id).await
    }

    async fn check_schedule(&self) -> Result<serde_json::Value, Error> {
        if !self.gate.take_if_due() {
            return Ok(serde_json::json!({"executed": false, "reason": "cadence not yet due"}));
        }
        let result = self.poll_all(None).await?;
        Ok(serde_json::json!({"executed": true, "result": result}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,worker_chart=info");

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
        user_config,
        transport,
        config.delivery_retry_backoffs.clone(),
        config.delivery_dedup_window,
    ));

    let quotes = Arc::new(KisPriceHistorySource::new(
        config.kis_app_key.clone().unwrap_or_default(),
        config.kis_app_secret.clone().unwrap_or_default(),
    ));
    let market_tz = config.market_timezone.parse().unwrap_or(chrono_tz::Asia::Seoul);
    let engine = Arc::new(ChartEngine::new(pool.clone(), dispatcher, quotes.clone(), config.chart_condition_epsilon, market_tz));

    let handler = Arc::new(ChartHandler {
        pool: pool.clone(),
        engine,
        quotes,
        gate: CadenceGate::new(Cadence::MarketClose, market_tz, config.market_close_time, config.market_close_window_minutes),
    });

    let pinned_user_id = std::env::var("HYPERASSET_USER_ID").ok();
    let port: u16 = std::env::var("HYPERASSET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8003);
    let state = WorkerState::new("chart", handler, pinned_user_id);
    let app = worker::build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind worker port")?;
    info!(addr, "chart worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("chart worker server error")?;
    pool.drain().await;
    Ok(())
}
