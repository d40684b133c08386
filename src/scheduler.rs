//! C10 — check-signal scheduler.
//!
//! Single-threaded loop: every `scheduler_interval` (default 10 minutes),
//! concurrently POST `/check-schedule` to each enabled worker
//! (`AppConfig::worker_endpoints()`) with a bounded timeout. Each worker
//! decides locally whether its own cadence has elapsed and either runs its
//! pass or returns `{executed: false, reason}`; the scheduler makes no
//! execution decisions of its own; it only logs outcomes and, if an entire
//! cadence group goes quiet past its window, emits a best-effort "no event"
//! notification through C6 (spec.md §4.10's quiet-hour fallback).

use crate::config::{AppConfig, Cadence, WorkerEndpoint};
use crate::db::Pool;
use crate::error::Result;
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, Default)]
struct CheckScheduleResponse {
    #[serde(default)]
    executed: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub worker: &'static str,
    pub executed: bool,
    pub reason: Option<String>,
}

fn cadence_label(cadence: Cadence) -> &'static str {
    match cadence {
        Cadence::Hourly => "hourly",
        Cadence::MarketClose => "market_close",
        Cadence::Weekly => "weekly",
    }
}

/// The cadence groups the quiet-hour fallback watches, and the event kind
/// a "no event" notification for that group carries. `Weekly` (the report
/// worker) has no fallback: a missed weekly report is a supervisor-level
/// failure, not an absence of news.
fn quiet_hour_window(cadence: Cadence) -> Option<(Duration, EventKind)> {
    match cadence {
        Cadence::Hourly => Some((Duration::from_secs(3600), EventKind::News)),
        Cadence::MarketClose => Some((Duration::from_secs(3600), EventKind::Chart)),
        Cadence::Weekly => None,
    }
}

pub struct Scheduler {
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    client: reqwest::Client,
    endpoints: Vec<WorkerEndpoint>,
    interval: Duration,
    request_timeout: Duration,
    last_executed: Mutex<HashMap<&'static str, Instant>>,
}

impl Scheduler {
    pub fn new(pool: Arc<Pool>, dispatcher: Arc<Dispatcher>, interval: Duration, request_timeout: Duration) -> Self {
        let endpoints = AppConfig::worker_endpoints();
        let now = Instant::now();
        let last_executed = endpoints.iter().map(|e| (e.name, now)).collect();
        Self {
            pool,
            dispatcher,
            client: reqwest::Client::new(),
            endpoints,
            interval,
            request_timeout,
            last_executed: Mutex::new(last_executed),
        }
    }

    async fn ping(&self, endpoint: &WorkerEndpoint) -> CheckResult {
        let url = format!("http://127.0.0.1:{}/check-schedule", endpoint.port);
        match self.client.post(&url).timeout(self.request_timeout).send().await {
            Ok(resp) => {
                let parsed: CheckScheduleResponse = resp.json().await.unwrap_or_default();
                CheckResult { worker: endpoint.name, executed: parsed.executed, reason: parsed.reason }
            }
            Err(e) => CheckResult { worker: endpoint.name, executed: false, reason: Some(e.to_string()) },
        }
    }

    /// Distinct enabled `(stock_code, stock_name)` pairs across every
    /// user's watchlist — the fan-out base for a quiet-hour notification,
    /// which has no single owning stock of its own.
    async fn watched_stocks(&self) -> Result<Vec<(String, String)>> {
        self.pool
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT stock_code, stock_name FROM user_stocks WHERE enabled = 1")?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn fire_quiet_hour(&self, kind: EventKind, window_label: &str) {
        let stocks = match self.watched_stocks().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to load watched stocks for quiet-hour notification");
                return;
            }
        };
        if stocks.is_empty() {
            return;
        }

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut fanned_out = 0usize;
        for (stock_code, stock_name) in stocks {
            let payload = serde_json::json!({
                "no_event": true,
                "window": window_label,
                "date": today,
            });
            let event = AlertEvent { kind, stock_code, stock_name, payload, target_user_id: None };
            match self.dispatcher.dispatch(&event).await {
                Ok(n) => fanned_out += n,
                Err(e) => warn!(error = %e, "quiet-hour dispatch failed"),
            }
        }
        info!(window = window_label, delivered = fanned_out, "quiet-hour fallback fanned out");
    }

    /// One scheduling pulse: ping every enabled worker, record which
    /// cadence groups executed, and fall back to a quiet-hour alert for any
    /// group that has gone past its window without an executed pass.
    pub async fn tick(&self) -> Vec<CheckResult> {
        let futures = self.endpoints.iter().map(|ep| self.ping(ep));
        let results = futures_util::future::join_all(futures).await;

        let now = Instant::now();
        {
            let mut last = self.last_executed.lock();
            for result in &results {
                if result.executed {
                    last.insert(result.worker, now);
                }
            }
        }

        let mut kinds_to_fire: Vec<(EventKind, &'static str)> = Vec::new();
        for endpoint in &self.endpoints {
            let Some((window, kind)) = quiet_hour_window(endpoint.cadence) else { continue };
            let elapsed = {
                let last = self.last_executed.lock();
                last.get(endpoint.name).map(|t| now.duration_since(*t)).unwrap_or(Duration::ZERO)
            };
            if elapsed > window && !kinds_to_fire.iter().any(|(k, _)| *k == kind) {
                debug!(worker = endpoint.name, elapsed_secs = elapsed.as_secs(), "cadence group quiet past window");
                kinds_to_fire.push((kind, cadence_label(endpoint.cadence)));
            }
        }
        for (kind, label) in kinds_to_fire {
            self.fire_quiet_hour(kind, label).await;
        }

        results
    }

    /// Run the scheduling loop forever on `interval`. Returns the join
    /// handle so the owning binary can abort it on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                for result in self.tick().await {
                    if result.executed {
                        info!(worker = result.worker, "scheduled pass executed");
                    } else {
                        debug!(worker = result.worker, reason = ?result.reason, "no pass executed this pulse");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyTransport;
    use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    struct RecordingTransport {
        sent: Arc<SyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotifyTransport for RecordingTransport {
        async fn send(&self, user_id: &str, _message: &str) -> Result<()> {
            self.sent.lock().push(user_id.to_string());
            Ok(())
        }
    }

    async fn test_scheduler() -> (Scheduler, Arc<SyncMutex<Vec<String>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("sched.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.0).await.unwrap();
        user_config
            .update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }])
            .await
            .unwrap();
        user_config.update_services("u1", &ServiceFlags { chart: true, news: true, ..Default::default() }).await.unwrap();

        let sent = Arc::new(SyncMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent: sent.clone() });
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, transport, vec![], Duration::from_secs(86_400)));
        let scheduler = Scheduler::new(pool, dispatcher, Duration::from_secs(600), Duration::from_millis(200));
        (scheduler, sent, dir)
    }

    #[tokio::test]
    async fn tick_against_unreachable_workers_does_not_fire_immediately() {
        let (scheduler, sent, _dir) = test_scheduler().await;
        let results = scheduler.tick().await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| !r.executed));
        // Freshly constructed: last_executed was seeded to "now", so no
        // cadence group is stale yet.
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn fire_quiet_hour_notifies_each_watched_stock() {
        let (scheduler, sent, _dir) = test_scheduler().await;
        scheduler.fire_quiet_hour(EventKind::Chart, "market_close").await;
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(sent.lock()[0], "u1");
    }

    #[test]
    fn quiet_hour_window_skips_weekly() {
        assert!(quiet_hour_window(Cadence::Weekly).is_none());
        assert!(quiet_hour_window(Cadence::Hourly).is_some());
        assert!(quiet_hour_window(Cadence::MarketClose).is_some());
    }
}
