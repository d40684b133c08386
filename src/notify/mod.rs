//! C6 — notification dispatcher.
//!
//! Resolves a typed event into per-user deliveries: enumerate users with
//! the event's stock enabled, filter by the user's per-kind flag and
//! kind-specific thresholds, render the template (`notify::templates`),
//! then deliver through an injected `NotifyTransport` with retry/backoff.
//! The at-most-once property is enforced by a `sha1` event digest checked
//! against the consolidated `delivery_log` table within a 24h window.

pub mod templates;

use crate::db::Pool;
use crate::error::Result;
use crate::user_config::UserConfigManager;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    News,
    Disclosure,
    Chart,
    Flow,
    Report,
    System,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::News => "news",
            EventKind::Disclosure => "disclosure",
            EventKind::Chart => "chart",
            EventKind::Flow => "flow",
            EventKind::Report => "report",
            EventKind::System => "system",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: EventKind,
    pub stock_code: String,
    pub stock_name: String,
    pub payload: Value,
    /// When set, the event targets this user directly instead of being
    /// resolved via stock-watchlist membership — used for account-level
    /// alerts (e.g. `kind=error` from the supervisor) that have no
    /// associated stock to look recipients up by.
    pub target_user_id: Option<String>,
}

/// Canonicalize the payload for digest purposes: serde_json's `Map` is a
/// `BTreeMap` under default features, so `to_string` already produces
/// deterministic key ordering.
fn canonical(payload: &Value) -> String {
    payload.to_string()
}

fn event_digest(kind: EventKind, stock_code: &str, payload: &Value) -> String {
    let mut hasher = Sha1::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(stock_code.as_bytes());
    hasher.update(canonical(payload).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..10])
}

#[async_trait]
pub trait NotifyTransport: Send + Sync {
    async fn send(&self, user_id: &str, message: &str) -> Result<()>;
}

pub struct TelegramTransport {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    parse_mode: String,
}

impl TelegramTransport {
    pub fn new(bot_token: String, chat_id: String, parse_mode: String) -> Self {
        Self { client: reqwest::Client::new(), bot_token, chat_id, parse_mode }
    }
}

#[async_trait]
impl NotifyTransport for TelegramTransport {
    async fn send(&self, _user_id: &str, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": message,
                "parse_mode": self.parse_mode,
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(crate::error::Error::Connection(format!("telegram http {}", resp.status())));
        }
        Ok(())
    }
}

/// Transport used where no bot token is configured: logs instead of
/// failing the pipeline (notification is best-effort per spec.md §7).
pub struct NullTransport;

#[async_trait]
impl NotifyTransport for NullTransport {
    async fn send(&self, user_id: &str, message: &str) -> Result<()> {
        debug!(user_id, message, "no transport configured, logging alert instead of delivering");
        Ok(())
    }
}

pub struct Dispatcher {
    pool: Arc<Pool>,
    user_config: Arc<UserConfigManager>,
    transport: Arc<dyn NotifyTransport>,
    retry_backoffs: Vec<Duration>,
    dedup_window: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<Pool>,
        user_config: Arc<UserConfigManager>,
        transport: Arc<dyn NotifyTransport>,
        retry_backoffs: Vec<Duration>,
        dedup_window: Duration,
    ) -> Self {
        Self { pool, user_config, transport, retry_backoffs, dedup_window }
    }

    fn user_has_kind_enabled(kind: EventKind, services: &crate::user_config::ServiceFlags) -> bool {
        match kind {
            EventKind::News => services.news,
            EventKind::Disclosure => services.disclosure,
            EventKind::Chart => services.chart,
            EventKind::Flow => services.flow,
            EventKind::Report => services.report,
            EventKind::System | EventKind::Error => true,
        }
    }

    fn passes_kind_threshold(kind: EventKind, payload: &Value, user_impact_threshold: f64) -> bool {
        match kind {
            EventKind::News => payload
                .get("impact_score")
                .and_then(Value::as_f64)
                .map(|score| score >= user_impact_threshold)
                .unwrap_or(true),
            _ => true,
        }
    }

    async fn already_delivered(&self, user_id: &str, digest: &str) -> Result<bool> {
        let uid = user_id.to_string();
        let digest = digest.to_string();
        let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(self.dedup_window).unwrap()).to_rfc3339();
        let count: i64 = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM delivery_log WHERE user_id = ?1 AND event_digest = ?2 AND sent_at >= ?3",
                    rusqlite::params![uid, digest, cutoff],
                    |r| r.get(0),
                )
            })
            .await?;
        Ok(count > 0)
    }

    async fn record_delivery(&self, kind: EventKind, user_id: &str, digest: &str, status: &str, message: &str) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let sent_at = chrono::Utc::now().to_rfc3339();
        let mut hasher = Sha1::new();
        hasher.update(message.as_bytes());
        let message_hash = hex::encode(hasher.finalize());

        let (kind_s, uid, digest, status) = (kind.as_str().to_string(), user_id.to_string(), digest.to_string(), status.to_string());
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO delivery_log (id, kind, user_id, event_digest, status, sent_at, message_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id, kind_s, uid, digest, status, sent_at, message_hash],
                )
            })
            .await?;
        Ok(())
    }

    async fn deliver_with_retry(&self, user_id: &str, message: &str) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.transport.send(user_id, message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry_backoffs.len() => {
                    warn!(user_id, attempt, error = %e, "delivery attempt failed, retrying");
                    tokio::time::sleep(self.retry_backoffs[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatch `event` to every interested, eligible, not-yet-delivered
    /// user. Returns the number of users actually delivered to.
    pub async fn dispatch(&self, event: &AlertEvent) -> Result<usize> {
        let digest = event_digest(event.kind, &event.stock_code, &event.payload);
        let candidates = match &event.target_user_id {
            Some(user_id) => vec![user_id.clone()],
            None => self.user_config.users_watching_stock(&event.stock_code).await?,
        };

        let mut delivered = 0usize;
        for user_id in candidates {
            let config = match self.user_config.get_user_config(&user_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(user_id, error = %e, "failed to load user config, skipping");
                    continue;
                }
            };

            // A directly-targeted event (no stock to gate on) still honors
            // the user's per-kind flag, skipping only the stock-watchlist
            // gate that `users_watching_stock` would otherwise have applied.
            if !Self::user_has_kind_enabled(event.kind, &config.services) {
                continue;
            }
            if !Self::passes_kind_threshold(event.kind, &event.payload, config.news_impact_threshold) {
                continue;
            }
            if self.already_delivered(&user_id, &digest).await.unwrap_or(false) {
                debug!(user_id, digest, "skipping: already delivered within dedup window");
                continue;
            }

            let timestamp = chrono::Utc::now().to_rfc3339();
            let message = templates::render(event.kind, &event.stock_name, &event.stock_code, &event.payload, &timestamp);

            let status = match self.deliver_with_retry(&user_id, &message).await {
                Ok(()) => {
                    delivered += 1;
                    "sent"
                }
                Err(e) => {
                    warn!(user_id, error = %e, "delivery failed after retries");
                    "failed"
                }
            };
            if let Err(e) = self.record_delivery(event.kind, &user_id, &digest, status, &message).await {
                warn!(error = %e, "failed to persist delivery log row");
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    struct RecordingTransport {
        sent: Arc<SyncMutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl NotifyTransport for RecordingTransport {
        async fn send(&self, user_id: &str, message: &str) -> Result<()> {
            self.sent.lock().push((user_id.to_string(), message.to_string()));
            Ok(())
        }
    }

    async fn setup() -> (Dispatcher, Arc<SyncMutex<Vec<(String, String)>>>, Arc<UserConfigManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::Pool::open(
            dir.path().join("notify.db").to_str().unwrap(),
            3,
            2,
            Duration::from_secs(600),
            Duration::from_secs(1800),
        )
        .unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.5).await.unwrap();
        user_config
            .update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }])
            .await
            .unwrap();
        user_config
            .update_services("u1", &ServiceFlags { news: true, chart: true, ..Default::default() })
            .await
            .unwrap();

        let sent = Arc::new(SyncMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent: sent.clone() });
        let dispatcher = Dispatcher::new(pool, user_config.clone(), transport, vec![], Duration::from_secs(86_400));
        (dispatcher, sent, user_config, dir)
    }

    #[tokio::test]
    async fn dispatches_to_interested_eligible_user() {
        let (dispatcher, sent, _cfg, _dir) = setup().await;
        let event = AlertEvent {
            kind: EventKind::News,
            stock_code: "005930".into(),
            stock_name: "삼성전자".into(),
            payload: serde_json::json!({"impact_score": 0.9, "title": "headline"}),
            target_user_id: None,
        };
        let n = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn below_threshold_is_skipped() {
        let (dispatcher, sent, _cfg, _dir) = setup().await;
        let event = AlertEvent {
            kind: EventKind::News,
            stock_code: "005930".into(),
            stock_name: "삼성전자".into(),
            payload: serde_json::json!({"impact_score": 0.1, "title": "headline"}),
            target_user_id: None,
        };
        let n = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(n, 0);
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_kind_is_skipped() {
        let (dispatcher, sent, _cfg, _dir) = setup().await;
        let event = AlertEvent {
            kind: EventKind::Disclosure,
            stock_code: "005930".into(),
            stock_name: "삼성전자".into(),
            payload: serde_json::json!({}),
            target_user_id: None,
        };
        let n = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(n, 0);
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn at_most_once_within_dedup_window() {
        let (dispatcher, sent, _cfg, _dir) = setup().await;
        let event = AlertEvent {
            kind: EventKind::Chart,
            stock_code: "005930".into(),
            stock_name: "삼성전자".into(),
            payload: serde_json::json!({"condition": "golden_cross"}),
            target_user_id: None,
        };
        let first = dispatcher.dispatch(&event).await.unwrap();
        let second = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(sent.lock().len(), 1);
    }

    /// A directly-targeted event (e.g. a supervisor hard-failure alert)
    /// must reach the named user even though its `stock_code` is empty
    /// and would match nothing via `users_watching_stock`.
    #[tokio::test]
    async fn targeted_event_bypasses_stock_watchlist_lookup() {
        let (dispatcher, sent, _cfg, _dir) = setup().await;
        let event = AlertEvent {
            kind: EventKind::Error,
            stock_code: String::new(),
            stock_name: String::new(),
            payload: serde_json::json!({"message": "chart worker exceeded 3 restarts"}),
            target_user_id: Some("u1".into()),
        };
        let n = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(sent.lock().len(), 1);
    }
}
