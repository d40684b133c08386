//! Weekly Report Worker (C9 report path, behind the C13 scaffold)
//!
//! Once a week, summarizes the last 7 days of activity (news items,
//! disclosures, chart condition hits, flow pattern signals) per watched
//! stock into a single digest via the LLM gateway, then dispatches it as
//! a `kind=report` alert. Weekly cadence: Friday, market-close window.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyperasset_core::cadence::CadenceGate;
use hyperasset_core::config::{AppConfig, Cadence};
use hyperasset_core::db::Pool;
use hyperasset_core::error::Error;
use hyperasset_core::llm::providers::{build_registry, ModelTag};
use hyperasset_core::llm::{AnalysisKind, LlmGateway};
use hyperasset_core::notify::{AlertEvent, Dispatcher, EventKind, NullTransport, TelegramTransport};
use hyperasset_core::telemetry;
use hyperasset_core::time_util;
use hyperasset_core::user_config::UserConfigManager;
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

struct WeeklyActivity {
    news_count: i64,
    disclosure_count: i64,
    chart_hit_count: i64,
    composite_strong_days: i64,
}

struct ReportHandler {
    pool: Arc<Pool>,
    llm: Arc<LlmGateway>,
    dispatcher: Arc<Dispatcher>,
    gate: CadenceGate,
    market_tz: chrono_tz::Tz,
}

async fn watched_stocks(pool: &Pool, user_id: Option<&str>) -> Result<Vec<(String, String)>, Error> {
    let user_id = user_id.map(|s| s.to_string());
    pool.with_conn(move |conn| {
        let rows = match &user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT us.stock_code, us.stock_name FROM user_stocks us
                     JOIN user_services s ON s.user_id = us.user_id
                     WHERE us.enabled = 1 AND s.report = 1 AND us.user_id = ?1",
                )?;
                stmt.query_map([uid], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT us.stock_code, us.stock_name FROM user_stocks us
                     JOIN user_services s ON s.user_id = us.user_id
                     WHERE us.enabled = 1 AND s.report = 1",
                )?;
                stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
    .await
}

async fn weekly_activity(pool: &Pool, stock_code: &str, since: chrono::NaiveDate) -> Result<WeeklyActivity, Error> {
    let code = stock_code.to_string();
    let since_news = since.and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339();
    let since_date = since.format("%Y-%m-%d").to_string();

    let (c1, c2, c3, c4) = {
        let code1 = code.clone();
        let since_news1 = since_news.clone();
        let news_count: i64 = pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM news_item WHERE stock_code = ?1 AND publish_time >= ?2",
                    rusqlite::params![code1, since_news1],
                    |r| r.get(0),
                )
            })
            .await?;

        let code2 = code.clone();
        let since_date1 = since_date.clone();
        let disclosure_count: i64 = pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM disclosure_item WHERE stock_code = ?1 AND receipt_date >= ?2",
                    rusqlite::params![code2, since_date1],
                    |r| r.get(0),
                )
            })
            .await?;

        let code3 = code.clone();
        let since_date2 = since_date.clone();
        let chart_hit_count: i64 = pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM chart_condition_hit WHERE stock_code = ?1 AND hit_date >= ?2",
                    rusqlite::params![code3, since_date2],
                    |r| r.get(0),
                )
            })
            .await?;

        let code4 = code.clone();
        let since_date3 = since_date.clone();
        let composite_strong_days: i64 = pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM pattern_signal WHERE ticker = ?1 AND ref_time >= ?2 AND daily_inst_strong = 1 AND rt_prog_strong = 1",
                    rusqlite::params![code4, since_date3],
                    |r| r.get(0),
                )
            })
            .await?;

        (news_count, disclosure_count, chart_hit_count, composite_strong_days)
    };

    Ok(WeeklyActivity { news_count: c1, disclosure_count: c2, chart_hit_count: c3, composite_strong_days: c4 })
}

impl ReportHandler {
    async fn run_pass(&self, user_id: Option<&str>) -> Result<serde_json::Value, Error> {
        let stocks = watched_stocks(&self.pool, user_id).await?;
        let since = time_util::now_in_market_tz(self.market_tz).date_naive() - chrono::Duration::days(7);
        let mut dispatched = 0usize;

        for (code, name) in &stocks {
            let activity = match weekly_activity(&self.pool, code, since).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(stock_code = code, error = %e, "weekly activity lookup failed, continuing");
                    continue;
                }
            };

            let prompt = format!(
                "Summarize the past week for stock {name} ({code}) in two or three sentences, \
                 suitable for a retail investor notification. Data: {{\"news_items\": {}, \
                 \"disclosures\": {}, \"chart_condition_hits\": {}, \"composite_strong_flow_days\": {}}}.",
                activity.news_count, activity.disclosure_count, activity.chart_hit_count, activity.composite_strong_days,
            );

            let summary = match self.llm.generate(ModelTag::Hyperclova, AnalysisKind::Report, &prompt, 400).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(stock_code = code, error = %e, "report generation failed, using fallback summary");
                    format!(
                        "{name}: {} news items, {} disclosures, {} chart conditions, {} strong flow days this week.",
                        activity.news_count, activity.disclosure_count, activity.chart_hit_count, activity.composite_strong_days,
                    )
                }
            };

            let event = AlertEvent {
                kind: EventKind::Report,
                stock_code: code.clone(),
                stock_name: name.clone(),
                payload: serde_json::json!({"summary": summary}),
                target_user_id: None,
            };
            if let Err(e) = self.dispatcher.dispatch(&event).await {
                warn!(stock_code = code, error = %e, "report dispatch failed, continuing");
                continue;
            }
            dispatched += 1;
        }

        Ok(serde_json::json!({"executed": true, "stocks_processed": stocks.len(), "reports_dispatched": dispatched}))
    }
}

#[async_trait]
impl WorkerHandler for ReportHandler {
    async fn execute(&self, user_id: Option<&str>) -> Result<serde_json::Value, Error> {
        self.run_pass(user_id).await
    }

    async fn check_schedule(&self) -> Result<serde_json::Value, Error> {
        if !self.gate.take_if_due() {
            return Ok(serde_json::json!({"executed": false, "reason": "cadence not yet due"}));
        }
        let result = self.run_pass(None).await?;
        Ok(serde_json::json!({"executed": true, "result": result}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,worker_report=info");

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

    let market_tz = config.market_timezone.parse().unwrap_or(chrono_tz::Asia::Seoul);
    let handler = Arc::new(ReportHandler {
        pool: pool.clone(),
        llm,
        dispatcher,
        gate: CadenceGate::new(Cadence::Weekly, market_tz, config.market_close_time, config.market_close_window_minutes),
        market_tz,
    });

    let pinned_user_id = std::env::var("HYPERASSET_USER_ID").ok();
    let port: u16 = std::env::var("HYPERASSET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8004);
    let state = WorkerState::new("report", handler, pinned_user_id);
    let app = worker::build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind worker port")?;
    info!(addr, "report worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("report worker server error")?;
    pool.drain().await;
    Ok(())
}
