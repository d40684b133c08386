//! Check-Signal Scheduler Binary (C10)
//!
//! Runs the scheduling loop standalone: every `scheduler_interval`, pings
//! each worker's `/check-schedule` endpoint and falls back to a quiet-hour
//! notification for any cadence group that has gone stale.
//!
//! Usage:
//!   scheduler

use anyhow::{Context, Result};
use hyperasset_core::config::AppConfig;
use hyperasset_core::db::Pool;
use hyperasset_core::notify::{Dispatcher, NullTransport, TelegramTransport};
use hyperasset_core::scheduler::Scheduler;
use hyperasset_core::telemetry;
use hyperasset_core::user_config::UserConfigManager;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    telemetry::init_tracing("hyperasset_core=info,scheduler=info");

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

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        dispatcher,
        config.scheduler_interval,
        config.scheduler_request_timeout,
    ));

    info!(interval_secs = config.scheduler_interval.as_secs(), "scheduler starting");
    let handle = scheduler.spawn();

    telemetry::shutdown_signal().await;
    handle.abort();
    pool.drain().await;
    Ok(())
}
