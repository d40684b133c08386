//! C11 — per-user service supervisor.
//!
//! Starts and stops exactly the worker processes a user's service flags
//! (C5) name, nothing more. Each running worker is a real child process
//! (`tokio::process::Child`), pinned to its user via `HYPERASSET_USER_ID`,
//! polled for readiness at `GET /health` up to 60s, and tracked crash-safe
//! in the `service_registry` table so a supervisor restart can recover its
//! view of the world. A child that exits unexpectedly is restarted up to
//! `MAX_RESTARTS`; past that the user is notified with `kind=error`.

use crate::config::AppConfig;
use crate::db::Pool;
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use crate::user_config::UserConfigManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ServiceStatus {
    fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceRow {
    pub service_name: String,
    pub user_id: String,
    pub status: String,
    pub port: u16,
    pub pid: Option<i64>,
    pub error_count: i64,
}

type ChildKey = (String, String);

pub struct Supervisor {
    pool: Arc<Pool>,
    user_config: Arc<UserConfigManager>,
    dispatcher: Arc<Dispatcher>,
    client: reqwest::Client,
    children: Mutex<HashMap<ChildKey, Child>>,
    health_poll_timeout: Duration,
    max_restarts: u32,
    binary_dir: PathBuf,
}

fn binary_name(service: &str) -> String {
    format!("worker-{service}")
}

impl Supervisor {
    pub fn new(
        pool: Arc<Pool>,
        user_config: Arc<UserConfigManager>,
        dispatcher: Arc<Dispatcher>,
        health_poll_timeout: Duration,
        max_restarts: u32,
        binary_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            user_config,
            dispatcher,
            client: reqwest::Client::new(),
            children: Mutex::new(HashMap::new()),
            health_poll_timeout,
            max_restarts,
            binary_dir,
        }
    }

    async fn upsert_registry(&self, service_name: &str, user_id: &str, status: ServiceStatus, port: u16, pid: Option<u32>) -> crate::error::Result<()> {
        let (service_name, user_id, status_s, pid) = (service_name.to_string(), user_id.to_string(), status.as_str().to_string(), pid.map(|p| p as i64));
        let started_at = chrono::Utc::now().to_rfc3339();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO service_registry (service_name, user_id, status, port, pid, started_at, last_health_check, error_count, description)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, '')
                     ON CONFLICT(service_name, user_id) DO UPDATE SET
                        status = excluded.status, port = excluded.port, pid = excluded.pid,
                        last_health_check = excluded.last_health_check",
                    rusqlite::params![service_name, user_id, status_s, port, pid, started_at],
                )
            })
            .await?;
        Ok(())
    }

    async fn bump_error_count(&self, service_name: &str, user_id: &str) -> crate::error::Result<i64> {
        let (sn, uid) = (service_name.to_string(), user_id.to_string());
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE service_registry SET error_count = error_count + 1 WHERE service_name = ?1 AND user_id = ?2",
                    rusqlite::params![sn, uid],
                )?;
                conn.query_row(
                    "SELECT error_count FROM service_registry WHERE service_name = ?1 AND user_id = ?2",
                    rusqlite::params![sn, uid],
                    |r| r.get(0),
                )
            })
            .await
    }

    async fn poll_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + self.health_poll_timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = self.client.get(&url).timeout(Duration::from_secs(2)).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }

    async fn spawn_one(&self, service_name: &str, user_id: &str, port: u16) -> crate::error::Result<()> {
        let key = (service_name.to_string(), user_id.to_string());
        if self.children.lock().contains_key(&key) {
            return Ok(());
        }

        self.upsert_registry(service_name, user_id, ServiceStatus::Starting, port, None).await?;

        let path = self.binary_dir.join(binary_name(service_name));
        let child = Command::new(&path)
            .env("HYPERASSET_USER_ID", user_id)
            .env("HYPERASSET_PORT", port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| crate::error::Error::Connection(format!("failed to spawn {}: {e}", path.display())))?;

        let pid = child.id();
        self.children.lock().insert(key, child);

        if self.poll_health(port).await {
            self.upsert_registry(service_name, user_id, ServiceStatus::Running, port, pid).await?;
            info!(service_name, user_id, port, "worker became healthy");
        } else {
            self.upsert_registry(service_name, user_id, ServiceStatus::Failed, port, pid).await?;
            warn!(service_name, user_id, port, "worker failed health check within deadline");
        }
        Ok(())
    }

    /// Start exactly the workers whose service flag is enabled for
    /// `user_id`. Already-running workers for that user are left alone.
    pub async fn start_user_services(&self, user_id: &str) -> crate::error::Result<Vec<ServiceRow>> {
        let config = self.user_config.get_user_config(user_id).await?;
        let flags = &config.services;
        let enabled: Vec<&str> = [
            ("news", flags.news),
            ("disclosure", flags.disclosure),
            ("chart", flags.chart),
            ("report", flags.report),
            ("flow", flags.flow),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();

        for endpoint in AppConfig::worker_endpoints() {
            if enabled.contains(&endpoint.name) {
                if let Err(e) = self.spawn_one(endpoint.name, user_id, endpoint.port).await {
                    error!(service = endpoint.name, user_id, error = %e, "failed to start worker");
                }
            }
        }

        self.get_user_services(user_id).await
    }

    pub async fn stop_user_services(&self, user_id: &str) -> crate::error::Result<()> {
        let keys: Vec<ChildKey> = {
            let children = self.children.lock();
            children.keys().filter(|(_, uid)| uid == user_id).cloned().collect()
        };
        for (service_name, uid) in keys {
            let mut child = self.children.lock().remove(&(service_name.clone(), uid.clone()));
            if let Some(child) = &mut child {
                let _ = child.kill().await;
            }
            let port = AppConfig::worker_endpoints().into_iter().find(|w| w.name == service_name).map(|w| w.port).unwrap_or(0);
            self.upsert_registry(&service_name, &uid, ServiceStatus::Stopped, port, None).await?;
        }
        Ok(())
    }

    pub async fn get_user_services(&self, user_id: &str) -> crate::error::Result<Vec<ServiceRow>> {
        let uid = user_id.to_string();
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT service_name, user_id, status, port, pid, error_count FROM service_registry WHERE user_id = ?1",
                )?;
                let rows = stmt
                    .query_map([&uid], |r| {
                        Ok(ServiceRow {
                            service_name: r.get(0)?,
                            user_id: r.get(1)?,
                            status: r.get(2)?,
                            port: r.get::<_, i64>(3)? as u16,
                            pid: r.get(4)?,
                            error_count: r.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Poll every tracked child for an unexpected exit; restart up to
    /// `max_restarts`, otherwise report a hard failure via C6.
    pub async fn reap_and_restart(&self) {
        let exited: Vec<(ChildKey, u16)> = {
            let mut children = self.children.lock();
            let mut out = Vec::new();
            let endpoints = AppConfig::worker_endpoints();
            children.retain(|(service_name, _user_id), child| {
                match child.try_wait() {
                    Ok(Some(_status)) => {
                        let port = endpoints.iter().find(|w| &w.name == service_name).map(|w| w.port).unwrap_or(0);
                        out.push(((service_name.clone(), _user_id.clone()), port));
                        false
                    }
                    _ => true,
                }
            });
            out
        };

        for ((service_name, user_id), port) in exited {
            let error_count = self.bump_error_count(&service_name, &user_id).await.unwrap_or(0);
            if (error_count as u32) <= self.max_restarts {
                warn!(service_name, user_id, error_count, "worker exited unexpectedly, restarting");
                if let Err(e) = self.spawn_one(&service_name, &user_id, port).await {
                    error!(service_name, user_id, error = %e, "restart attempt failed");
                }
            } else {
                error!(service_name, user_id, error_count, "worker exceeded max restarts, reporting hard failure");
                let event = AlertEvent {
                    kind: EventKind::Error,
                    stock_code: String::new(),
                    stock_name: String::new(),
                    payload: serde_json::json!({
                        "message": format!("{service_name} worker exceeded {} restarts and is no longer running", self.max_restarts),
                        "service": service_name,
                    }),
                    target_user_id: Some(user_id.clone()),
                };
                if let Err(e) = self.dispatcher.dispatch(&event).await {
                    error!(error = %e, "failed to dispatch hard-failure alert");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_config::{ServiceFlags, StockEntry};

    #[tokio::test]
    async fn registry_roundtrip_reports_started_services() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("sup.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.8).await.unwrap();
        user_config.update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "s".into(), enabled: true }]).await.unwrap();
        user_config.update_services("u1", &ServiceFlags { news: true, ..Default::default() }).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config.clone(), Arc::new(crate::notify::NullTransport), vec![], Duration::from_secs(86_400)));
        let supervisor = Supervisor::new(pool, user_config, dispatcher, Duration::from_millis(50), 3, dir.path().to_path_buf());

        supervisor.upsert_registry("news", "u1", ServiceStatus::Running, 8001, Some(123)).await.unwrap();
        let rows = supervisor.get_user_services("u1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "running");
    }
}
