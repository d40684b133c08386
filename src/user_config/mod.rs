//! C5 — user configuration manager.
//!
//! Authoritative, in-process view of user profile + watchlist + model tag,
//! composed from the relational store (C1) and cached 300s per `user_id` —
//! the same `parking_lot::Mutex<HashMap<K, Entry>>` + `Instant` idiom the
//! teacher uses for per-IP rate-limit windows (`middleware::rate_limit`).
//! Any mutation made through this manager invalidates the cached entry
//! before returning, so a reader never observes a stale write it raced.

use crate::db::Pool;
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockEntry {
    pub stock_code: String,
    pub stock_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceFlags {
    pub news: bool,
    pub disclosure: bool,
    pub chart: bool,
    pub report: bool,
    pub flow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    pub username: String,
    pub phone_number: String,
    pub news_similarity_threshold: f64,
    pub news_impact_threshold: f64,
    pub model_tag: String,
    pub stocks: Vec<StockEntry>,
    pub services: ServiceFlags,
}

struct CacheEntry {
    config: UserConfig,
    cached_at: Instant,
}

pub struct UserConfigManager {
    pool: Arc<Pool>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    default_news_similarity_threshold: f64,
    default_news_impact_threshold: f64,
    default_model_tag: String,
}

impl UserConfigManager {
    pub fn new(
        pool: Arc<Pool>,
        cache_ttl: Duration,
        default_news_similarity_threshold: f64,
        default_news_impact_threshold: f64,
        default_model_tag: String,
    ) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            default_news_similarity_threshold,
            default_news_impact_threshold,
            default_model_tag,
        }
    }

    fn invalidate(&self, user_id: &str) {
        self.cache.lock().remove(user_id);
    }

    /// Compose profile + watchlist + model tag + service flags. Cached for
    /// `cache_ttl`; missing rows fall back to the documented defaults
    /// (thresholds 0.7/0.8, model `hyperclova`, no stocks, no services).
    pub async fn get_user_config(&self, user_id: &str) -> Result<UserConfig> {
        if let Some(entry) = self.cache.lock().get(user_id) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                return Ok(entry.config.clone());
            }
        }

        let config = self.load_from_store(user_id).await?;
        self.cache.lock().insert(
            user_id.to_string(),
            CacheEntry { config: config.clone(), cached_at: Instant::now() },
        );
        Ok(config)
    }

    async fn load_from_store(&self, user_id: &str) -> Result<UserConfig> {
        let uid = user_id.to_string();
        let profile: Option<(String, String, f64, f64)> = self
            .pool
            .with_conn({
                let uid = uid.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT username, phone_number, news_similarity_threshold, news_impact_threshold
                         FROM user_profiles WHERE user_id = ?1",
                        [&uid],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                    )
                    .optional()
                }
            })
            .await?;

        let (username, phone_number, sim_threshold, impact_threshold) = profile.unwrap_or((
            String::new(),
            String::new(),
            self.default_news_similarity_threshold,
            self.default_news_impact_threshold,
        ));

        let model_tag: Option<String> = self
            .pool
            .with_conn({
                let uid = uid.clone();
                move |conn| {
                    conn.query_row("SELECT model_tag FROM user_model WHERE user_id = ?1", [&uid], |r| r.get(0))
                        .optional()
                }
            })
            .await?;
        let model_tag = model_tag.unwrap_or_else(|| self.default_model_tag.clone());

        let stocks: Vec<StockEntry> = self
            .pool
            .with_conn({
                let uid = uid.clone();
                move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT stock_code, stock_name, enabled FROM user_stocks WHERE user_id = ?1",
                    )?;
                    let rows = stmt
                        .query_map([&uid], |r| {
                            Ok(StockEntry {
                                stock_code: r.get(0)?,
                                stock_name: r.get(1)?,
                                enabled: r.get::<_, i64>(2)? != 0,
                            })
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                }
            })
            .await?;

        let services: Option<(i64, i64, i64, i64, i64)> = self
            .pool
            .with_conn({
                let uid = uid.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT news, disclosure, chart, report, flow FROM user_services WHERE user_id = ?1",
                        [&uid],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                    )
                    .optional()
                }
            })
            .await?;
        let services = match services {
            Some((n, d, c, r, f)) => ServiceFlags {
                news: n != 0,
                disclosure: d != 0,
                chart: c != 0,
                report: r != 0,
                flow: f != 0,
            },
            None => ServiceFlags::default(),
        };

        Ok(UserConfig {
            user_id: user_id.to_string(),
            username,
            phone_number,
            news_similarity_threshold: sim_threshold,
            news_impact_threshold: impact_threshold,
            model_tag,
            stocks,
            services,
        })
    }

    /// Create or update a user's profile row. Upsert semantics; invalidates
    /// the cache on return.
    pub async fn upsert_profile(
        &self,
        user_id: &str,
        username: &str,
        phone_number: &str,
        news_similarity_threshold: f64,
        news_impact_threshold: f64,
    ) -> Result<()> {
        let (uid, username, phone) = (user_id.to_string(), username.to_string(), phone_number.to_string());
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_profiles (user_id, username, phone_number, news_similarity_threshold, news_impact_threshold)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user_id) DO UPDATE SET
                        username = excluded.username,
                        phone_number = excluded.phone_number,
                        news_similarity_threshold = excluded.news_similarity_threshold,
                        news_impact_threshold = excluded.news_impact_threshold,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    rusqlite::params![uid, username, phone, news_similarity_threshold, news_impact_threshold],
                )
            })
            .await?;
        self.invalidate(user_id);
        Ok(())
    }

    pub async fn set_model(&self, user_id: &str, model_tag: &str) -> Result<()> {
        let (uid, tag) = (user_id.to_string(), model_tag.to_string());
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_model (user_id, model_tag) VALUES (?1, ?2)
                     ON CONFLICT(user_id) DO UPDATE SET model_tag = excluded.model_tag,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    rusqlite::params![uid, tag],
                )
            })
            .await?;
        self.invalidate(user_id);
        Ok(())
    }

    pub async fn update_stocks(&self, user_id: &str, stocks: &[StockEntry]) -> Result<()> {
        let uid = user_id.to_string();
        let rows: Vec<(String, String, String, i64)> = stocks
            .iter()
            .map(|s| (uid.clone(), s.stock_code.clone(), s.stock_name.clone(), s.enabled as i64))
            .collect();
        self.pool
            .with_conn(move |conn| {
                for (uid, code, name, enabled) in &rows {
                    conn.execute(
                        "INSERT INTO user_stocks (user_id, stock_code, stock_name, enabled) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(user_id, stock_code) DO UPDATE SET stock_name = excluded.stock_name,
                            enabled = excluded.enabled, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                        rusqlite::params![uid, code, name, enabled],
                    )?;
                }
                Ok(())
            })
            .await?;
        self.invalidate(user_id);
        Ok(())
    }

    pub async fn update_services(&self, user_id: &str, services: &ServiceFlags) -> Result<()> {
        let uid = user_id.to_string();
        let flags = (services.news as i64, services.disclosure as i64, services.chart as i64, services.report as i64, services.flow as i64);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_services (user_id, news, disclosure, chart, report, flow) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(user_id) DO UPDATE SET news = excluded.news, disclosure = excluded.disclosure,
                        chart = excluded.chart, report = excluded.report, flow = excluded.flow,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    rusqlite::params![uid, flags.0, flags.1, flags.2, flags.3, flags.4],
                )
            })
            .await?;
        self.invalidate(user_id);
        Ok(())
    }

    /// Fan-out call used by the gateway's combined update endpoint; shares
    /// one invalidation step instead of three.
    pub async fn update_user_config(
        &self,
        user_id: &str,
        model_tag: Option<&str>,
        stocks: Option<&[StockEntry]>,
        thresholds: Option<(f64, f64)>,
    ) -> Result<()> {
        if let Some(tag) = model_tag {
            self.set_model_no_invalidate(user_id, tag).await?;
        }
        if let Some(stocks) = stocks {
            self.update_stocks_no_invalidate(user_id, stocks).await?;
        }
        if let Some((sim, impact)) = thresholds {
            let cfg = self.load_from_store(user_id).await?;
            self.upsert_profile(user_id, &cfg.username, &cfg.phone_number, sim, impact).await?;
        }
        self.invalidate(user_id);
        Ok(())
    }

    async fn set_model_no_invalidate(&self, user_id: &str, model_tag: &str) -> Result<()> {
        let (uid, tag) = (user_id.to_string(), model_tag.to_string());
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_model (user_id, model_tag) VALUES (?1, ?2)
                     ON CONFLICT(user_id) DO UPDATE SET model_tag = excluded.model_tag",
                    rusqlite::params![uid, tag],
                )
            })
            .await?;
        Ok(())
    }

    async fn update_stocks_no_invalidate(&self, user_id: &str, stocks: &[StockEntry]) -> Result<()> {
        let uid = user_id.to_string();
        let rows: Vec<(String, String, String, i64)> = stocks
            .iter()
            .map(|s| (uid.clone(), s.stock_code.clone(), s.stock_name.clone(), s.enabled as i64))
            .collect();
        self.pool
            .with_conn(move |conn| {
                for (uid, code, name, enabled) in &rows {
                    conn.execute(
                        "INSERT INTO user_stocks (user_id, stock_code, stock_name, enabled) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(user_id, stock_code) DO UPDATE SET stock_name = excluded.stock_name, enabled = excluded.enabled",
                        rusqlite::params![uid, code, name, enabled],
                    )?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Cheap helper used by every dispatcher: does this user have this
    /// stock enabled?
    pub async fn is_user_interested_in_stock(&self, user_id: &str, stock_code: &str) -> Result<bool> {
        let config = self.get_user_config(user_id).await?;
        Ok(config.stocks.iter().any(|s| s.stock_code == stock_code && s.enabled))
    }

    /// Enumerate every user who has `stock_code` enabled — used by C6 to
    /// build its candidate list without scanning per-user.
    pub async fn users_watching_stock(&self, stock_code: &str) -> Result<Vec<String>> {
        let code = stock_code.to_string();
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT user_id FROM user_stocks WHERE stock_code = ?1 AND enabled = 1",
                )?;
                let rows = stmt.query_map([&code], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_manager() -> (UserConfigManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(
            dir.path().join("cfg.db").to_str().unwrap(),
            3,
            2,
            Duration::from_secs(600),
            Duration::from_secs(1800),
        )
        .unwrap();
        pool.ensure_schema().await.unwrap();
        let mgr = UserConfigManager::new(pool, Duration::from_secs(300), 0.7, 0.8, "hyperclova".into());
        (mgr, dir)
    }

    #[tokio::test]
    async fn missing_user_falls_back_to_defaults() {
        let (mgr, _dir) = test_manager().await;
        let cfg = mgr.get_user_config("ghost").await.unwrap();
        assert_eq!(cfg.news_similarity_threshold, 0.7);
        assert_eq!(cfg.news_impact_threshold, 0.8);
        assert_eq!(cfg.model_tag, "hyperclova");
        assert!(cfg.stocks.is_empty());
    }

    #[tokio::test]
    async fn onboarding_roundtrip() {
        let (mgr, _dir) = test_manager().await;
        mgr.upsert_profile("u1", "김투자", "01099998888", 0.8, 0.6).await.unwrap();
        mgr.update_stocks(
            "u1",
            &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }],
        )
        .await
        .unwrap();
        mgr.set_model("u1", "hyperclova").await.unwrap();

        let cfg = mgr.get_user_config("u1").await.unwrap();
        assert_eq!(cfg.news_similarity_threshold, 0.8);
        assert_eq!(cfg.news_impact_threshold, 0.6);
        assert_eq!(cfg.stocks.len(), 1);
        assert!(mgr.is_user_interested_in_stock("u1", "005930").await.unwrap());
        assert!(!mgr.is_user_interested_in_stock("u1", "000660").await.unwrap());
    }

    #[tokio::test]
    async fn mutation_invalidates_cache() {
        let (mgr, _dir) = test_manager().await;
        mgr.upsert_profile("u1", "name", "010", 0.7, 0.8).await.unwrap();
        let first = mgr.get_user_config("u1").await.unwrap();
        assert_eq!(first.news_similarity_threshold, 0.7);

        mgr.upsert_profile("u1", "name", "010", 0.9, 0.8).await.unwrap();
        let second = mgr.get_user_config("u1").await.unwrap();
        assert_eq!(second.news_similarity_threshold, 0.9);
    }

    #[tokio::test]
    async fn users_watching_stock_returns_only_enabled() {
        let (mgr, _dir) = test_manager().await;
        mgr.upsert_profile("u1", "a", "010", 0.7, 0.8).await.unwrap();
        mgr.upsert_profile("u2", "b", "011", 0.7, 0.8).await.unwrap();
        mgr.update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "s".into(), enabled: true }]).await.unwrap();
        mgr.update_stocks("u2", &[StockEntry { stock_code: "005930".into(), stock_name: "s".into(), enabled: false }]).await.unwrap();

        let watchers = mgr.users_watching_stock("005930").await.unwrap();
        assert_eq!(watchers, vec!["u1".to_string()]);
    }
}
