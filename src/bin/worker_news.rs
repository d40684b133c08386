//! News Analysis Worker (C9 news path, behind the C13 scaffold)
//!
//! Fetches each watched stock's latest news, scores it through the LLM
//! gateway, and dispatches alerts to interested users. Runs on-demand via
//! `POST /execute` and on its hourly cadence via `POST /check-schedule`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyperasset_core::cadence::CadenceGate;
use hyperasset_core::config::{AppConfig, Cadence};
use hyperasset_core::db::Pool;
use hyperasset_core::dedup::DedupFilter;
use hyperasset_core::error::Error;
use hyperasset_core::llm::providers::build_registry;
use hyperasset_core::llm::LlmGateway;
use hyperasset_core::notify::{Dispatcher, NullTransport, TelegramTransport};
use hyperasset_core::pipelines::news::NewsPipeline;
use hyperasset_core::sources::HttpNewsSource;
use hyperasset_core::telemetry;
use hyperasset_core::user_config::UserConfigManager;
use hyperasset_core::vector::{NullEmbedder, VectorStore};
use hyperasset_core::worker::{self, WorkerHandler, WorkerState};
use std::sync::Arc;
use tracing::{info, warn};

async fn connect_redis(url: &str) -> Option<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).ok()?;
    match redis::aio::ConnectionManager::new(client).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!(error = %e, "redis unavailable, llm gateway running without shared cache");
            None
        }
    }
}

struct NewsHandler {
    pool: Arc<Pool>,
    pipeline: Arc<NewsPipeline>,
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
                     WHERE us.enabled = 1 AND s.news = 1 AND us.user_id = ?1",
                )?;
                stmt.query_map([uid], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT us.stock_code, us.stock_name FROM user_stocks us
                     JOIN user_services s ON s.user_id = us.user_id
                     WHERE us.enabled = 1 AND s.news = 1",
                )?;
                stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
    .await
}

#[async_trait]
impl WorkerHandler for NewsHandler {
    async fn execute(&self, user_id: Option<&str>) -> Result<serde_json::Value, Error> {
        let stocks = watched_stocks(&self.pool, user_id).await?;
        let mut total = 0usize;
        for (code, name) in &stocks {
            match self.pipeline.process_stock(code, name, None).await {
                Ok(n) => total += n,
                Err(e) => warn!(stock_code = code, error = %e, "news pass failed for stock, continuing"),
            }
        }
        Ok(serde_json::json!({"executed": true, "stocks_processed": stocks.len(), "items_dispatched": total}))
    }

    async fn check_schedule(&self) -> Result<serde_json::Value, Error> {
        if !self.gate.take_if_due() {
            return Ok(serde_json::json!({"executed": false, "reason": "cadence not yet due"}));
        }
        let result = self.execute(None).await?;
        Ok(serde_json::json!({"executed": true, "result": result}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,worker_news=info");

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

    let dedup = Arc::new(DedupFilter::new(
        pool.clone(),
        config.hamming_threshold,
        config.ttl_hours as i64,
        Some(config.simhash_log_path.clone()),
    ));

    let dedup_janitor = {
        let dedup = dedup.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match dedup.vacuum_expired().await {
                    Ok(n) if n > 0 => info!(removed = n, "vacuumed expired dedup fingerprints"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dedup vacuum failed, continuing"),
                }
            }
        })
    };

    let vector = Arc::new(VectorStore::new(pool.clone(), Arc::new(NullEmbedder)));
    vector.ensure_schema().await.context("failed to apply vector schema")?;

    let redis_conn = connect_redis(&config.redis_url).await;
    let providers = build_registry(
        config.hyperclova_api_key.clone(),
        config.openai_api_key.clone(),
        config.claude_api_key.clone(),
        config.grok_api_key.clone(),
        config.gemini_api_key.clone(),
    );
    let llm = Arc::new(LlmGateway::new(
        providers,
        config.llm_fallback_order.clone(),
        config.llm_timeout,
        config.llm_max_retries,
        config.local_cache_max_size,
        redis_conn,
    ));

    let source = Arc::new(HttpNewsSource::new(config.news_feed_url.clone()));
    let pipeline = Arc::new(NewsPipeline::new(pool.clone(), dedup, vector, llm, dispatcher, source, config.news_impact_routing_threshold));

    let handler = Arc::new(NewsHandler {
        pool: pool.clone(),
        pipeline,
        gate: CadenceGate::new(Cadence::Hourly, config.market_timezone.parse().unwrap_or(chrono_tz::Asia::Seoul), config.market_close_time, config.market_close_window_minutes),
    });

    let pinned_user_id = std::env::var("HYPERASSET_USER_ID").ok();
    let port: u16 = std::env::var("HYPERASSET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8001);
    let state = WorkerState::new("news", handler, pinned_user_id);
    let app = worker::build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind worker port")?;
    info!(addr, "news worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("news worker server error")?;
    dedup_janitor.abort();
    pool.drain().await;
    Ok(())
}
