//! Process-wide configuration, loaded once from the environment.
//!
//! Every tunable used by a downstream component is a typed field here
//! rather than a magic number scattered through the code.

use std::env;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// One worker's network identity plus the scheduler's cadence metadata for
/// it.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub name: &'static str,
    pub port: u16,
    pub cadence: Cadence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Hourly,
    MarketClose,
    Weekly,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // --- C1 relational store ---
    pub database_host: String,
    pub database_port: u16,
    pub database_user: String,
    pub database_password: String,
    pub database_name: String,
    pub db_pool_size: u32,
    pub db_pool_overflow: u32,
    pub db_conn_max_idle: Duration,
    pub db_conn_max_lifetime: Duration,

    // --- C2 vector store ---
    pub chromadb_persist_directory: String,

    // --- C3 dedup filter ---
    pub hamming_threshold: u32,
    pub ttl_hours: u64,
    pub simhash_log_path: String,

    // --- C4 LLM gateway ---
    pub hyperclova_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub claude_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub grok_api_key: Option<String>,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    pub llm_fallback_order: Vec<String>,
    pub cache_default_ttl: Duration,
    pub local_cache_max_size: usize,
    pub redis_url: String,

    // --- C5 user configuration ---
    pub user_config_cache_ttl: Duration,
    pub default_news_similarity_threshold: f64,
    pub default_news_impact_threshold: f64,
    pub default_model_tag: String,

    // --- C6 notification dispatcher ---
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_parse_mode: String,
    pub delivery_retry_backoffs: Vec<Duration>,
    pub delivery_dedup_window: Duration,

    // --- C7 chart engine ---
    pub chart_volume_threshold: f64,
    pub chart_price_change_threshold: f64,
    pub chart_condition_epsilon: f64,
    pub chart_warmup_period_days: u32,

    // --- C8 flow/pattern engine ---
    pub institutional_trigger_days: u32,
    pub institutional_trigger_threshold: u32,
    pub program_trigger_multiplier: f64,

    // --- C9 pipelines ---
    pub news_dedup_window_hours: u64,
    /// Global bar for routing a news item into the high-impact vector
    /// collection, distinct from each user's own notification threshold
    /// (`default_news_impact_threshold` above).
    pub news_impact_routing_threshold: f64,
    pub dart_api_key: Option<String>,
    pub kis_app_key: Option<String>,
    pub kis_app_secret: Option<String>,
    pub news_feed_url: String,

    // --- C10 scheduler ---
    pub scheduler_interval: Duration,
    pub scheduler_request_timeout: Duration,
    pub market_close_time: (u32, u32),
    pub market_close_window_minutes: u32,

    // --- C11 supervisor ---
    pub max_restarts: u32,
    pub supervisor_health_poll_timeout: Duration,
    pub supervisor_db_path: String,
    pub supervisor_port: u16,
    pub supervisor_reap_interval: Duration,
    pub worker_binary_dir: String,

    // --- C12 gateway ---
    pub gateway_port: u16,
    pub gateway_forward_timeout: Duration,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub cors_allowlist: Vec<String>,

    // --- retention / timezone ---
    pub data_retention_days: u32,
    pub market_timezone: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            database_host: env_string("DATABASE_HOST", "127.0.0.1"),
            database_port: env_u32("DATABASE_PORT", 3306) as u16,
            database_user: env_string("DATABASE_USER", "hyperasset"),
            database_password: env_string("DATABASE_PASSWORD", ""),
            database_name: env_string("DATABASE_NAME", "hyperasset.db"),
            db_pool_size: env_u32("DATABASE_POOL_SIZE", 3),
            db_pool_overflow: env_u32("DATABASE_POOL_OVERFLOW", 2),
            db_conn_max_idle: Duration::from_secs(env_u64("DATABASE_CONN_MAX_IDLE_SECS", 600)),
            db_conn_max_lifetime: Duration::from_secs(env_u64(
                "DATABASE_CONN_MAX_LIFETIME_SECS",
                1800,
            )),

            chromadb_persist_directory: env_string(
                "CHROMADB_PERSIST_DIRECTORY",
                "./data/vector_store",
            ),

            hamming_threshold: env_u32("HAMMING_THRESHOLD", 3),
            ttl_hours: env_u64("TTL_HOURS", 48),
            simhash_log_path: env_string("SIMHASH_LOG_PATH", "./data/simhash_duplicates.csv"),

            hyperclova_api_key: env::var("HYPERCLOVA_API_KEY").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            claude_api_key: env::var("CLAUDE_API_KEY").ok(),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            grok_api_key: env::var("GROK_API_KEY").ok(),
            llm_timeout: Duration::from_secs(env_u64("LLM_TIMEOUT_SECS", 30)),
            llm_max_retries: env_u32("LLM_MAX_RETRIES", 3),
            llm_fallback_order: env_string(
                "LLM_FALLBACK_ORDER",
                "hyperclova,chatgpt,claude,grok,gemini",
            )
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
            cache_default_ttl: Duration::from_secs(env_u64("CACHE_DEFAULT_TTL", 3600)),
            local_cache_max_size: env_u32("LOCAL_CACHE_MAX_SIZE", 500) as usize,
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),

            user_config_cache_ttl: Duration::from_secs(env_u64("USER_CONFIG_CACHE_TTL_SECS", 300)),
            default_news_similarity_threshold: env_f64("NEWS_SIMILARITY_THRESHOLD_DEFAULT", 0.7),
            default_news_impact_threshold: env_f64("NEWS_IMPACT_THRESHOLD_DEFAULT", 0.8),
            default_model_tag: env_string("DEFAULT_MODEL_TAG", "hyperclova"),

            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
            telegram_parse_mode: env_string("TELEGRAM_PARSE_MODE", "Markdown"),
            delivery_retry_backoffs: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ],
            delivery_dedup_window: Duration::from_secs(24 * 3600),

            chart_volume_threshold: env_f64("CHART_VOLUME_THRESHOLD", 10_000_000.0),
            chart_price_change_threshold: env_f64("CHART_PRICE_CHANGE_THRESHOLD", 0.10),
            chart_condition_epsilon: env_f64("CHART_CONDITION_EPSILON", 0.001),
            chart_warmup_period_days: env_u32("CHART_WARMUP_PERIOD_DAYS", 40),

            institutional_trigger_days: env_u32("INSTITUTIONAL_TRIGGER_DAYS", 5),
            institutional_trigger_threshold: env_u32("INSTITUTIONAL_TRIGGER_THRESHOLD", 3),
            program_trigger_multiplier: env_f64("PROGRAM_TRIGGER_MULTIPLIER", 2.5),

            news_dedup_window_hours: env_u64("NEWS_DEDUP_WINDOW_HOURS", 48),
            dart_api_key: env::var("DART_API_KEY").ok(),
            kis_app_key: env::var("KIS_APP_KEY").ok(),
            kis_app_secret: env::var("KIS_APP_SECRET").ok(),
            news_feed_url: env_string("NEWS_FEED_URL", "http://127.0.0.1:9100/news"),

            scheduler_interval: Duration::from_secs(env_u64("SCHEDULER_INTERVAL_SECS", 600)),
            scheduler_request_timeout: Duration::from_secs(env_u64(
                "SCHEDULER_REQUEST_TIMEOUT_SECS",
                30,
            )),
            market_close_time: (15, 30),
            market_close_window_minutes: env_u32("MARKET_CLOSE_WINDOW_MINUTES", 30),

            max_restarts: env_u32("MAX_RESTARTS", 3),
            supervisor_health_poll_timeout: Duration::from_secs(env_u64(
                "SUPERVISOR_HEALTH_POLL_TIMEOUT_SECS",
                60,
            )),
            supervisor_db_path: env_string("SUPERVISOR_DB_PATH", "./data/supervisor.db"),
            supervisor_port: env_u32("SUPERVISOR_PORT", 8090) as u16,
            supervisor_reap_interval: Duration::from_secs(env_u64("SUPERVISOR_REAP_INTERVAL_SECS", 15)),
            worker_binary_dir: env_string("WORKER_BINARY_DIR", "."),

            gateway_port: env_u32("GATEWAY_PORT", 8000) as u16,
            gateway_forward_timeout: Duration::from_secs(env_u64("GATEWAY_FORWARD_TIMEOUT_SECS", 30)),
            rate_limit_max_requests: env_u32("RATE_LIMIT_MAX_REQUESTS", 100),
            rate_limit_window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW_SECS", 60)),
            cors_allowlist: env_string("CORS_ALLOWLIST", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),

            data_retention_days: env_u32("DATA_RETENTION_DAYS", 30),
            market_timezone: env_string("MARKET_TIMEZONE", "Asia/Seoul"),
        }
    }

    /// Static worker/port/cadence table, grounded on the check-signal
    /// scheduler's service registry.
    pub fn worker_endpoints() -> Vec<WorkerEndpoint> {
        vec![
            WorkerEndpoint { name: "news", port: 8001, cadence: Cadence::Hourly },
            WorkerEndpoint { name: "disclosure", port: 8002, cadence: Cadence::Hourly },
            WorkerEndpoint { name: "chart", port: 8003, cadence: Cadence::MarketClose },
            WorkerEndpoint { name: "report", port: 8004, cadence: Cadence::Weekly },
            WorkerEndpoint { name: "flow", port: 8010, cadence: Cadence::MarketClose },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        env::remove_var("HAMMING_THRESHOLD");
        env::remove_var("TTL_HOURS");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.hamming_threshold, 3);
        assert_eq!(cfg.ttl_hours, 48);
        assert_eq!(cfg.program_trigger_multiplier, 2.5);
        assert_eq!(cfg.max_restarts, 3);
        assert_eq!(cfg.local_cache_max_size, 500);
    }

    #[test]
    fn worker_endpoints_cover_all_five_services() {
        let endpoints = AppConfig::worker_endpoints();
        assert_eq!(endpoints.len(), 5);
        assert!(endpoints.iter().any(|e| e.name == "chart" && e.cadence == Cadence::MarketClose));
    }
}
