//! C1 — relational store adapter.
//!
//! A small bounded pool of `rusqlite::Connection`s (size ≤ 3 by default,
//! +2 overflow), each wrapped with its creation time and last-use instant
//! so a background janitor can recycle connections that have gone idle or
//! outlived their lifetime. Every blocking SQLite call runs on a `tokio`
//! blocking-pool thread via `spawn_blocking`, matching the teacher's own
//! `Arc<Mutex<Connection>>` idiom (`vault/vault_db.rs`) but generalized into
//! a pool with retry.

pub mod schema;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Only a locked/busy database is worth retrying. Syntax errors,
/// constraint violations, and everything else are caller bugs or data
/// problems no amount of backoff will fix.
fn is_transient_sqlite_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(ffi.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

struct ManagedConnection {
    conn: Connection,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub capacity: usize,
}

pub struct Pool {
    path: String,
    idle: Mutex<Vec<ManagedConnection>>,
    in_use: std::sync::atomic::AtomicUsize,
    capacity: usize,
    max_idle: Duration,
    max_lifetime: Duration,
}

impl Pool {
    pub fn open(path: &str, base_size: u32, overflow: u32, max_idle: Duration, max_lifetime: Duration) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            path: path.to_string(),
            idle: Mutex::new(Vec::new()),
            in_use: std::sync::atomic::AtomicUsize::new(0),
            capacity: (base_size + overflow).max(1) as usize,
            max_idle,
            max_lifetime,
        });
        Ok(pool)
    }

    fn new_connection(&self) -> Result<ManagedConnection> {
        let conn = Connection::open(&self.path).map_err(Error::from)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        let now = Instant::now();
        Ok(ManagedConnection { conn, created_at: now, last_used: now })
    }

    async fn checkout(&self) -> Result<ManagedConnection> {
        let mut idle = self.idle.lock().await;
        while let Some(mc) = idle.pop() {
            let now = Instant::now();
            if now.duration_since(mc.created_at) > self.max_lifetime
                || now.duration_since(mc.last_used) > self.max_idle
            {
                debug!("dropping expired pooled connection");
                continue;
            }
            self.in_use.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            return Ok(mc);
        }
        drop(idle);
        self.in_use.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.new_connection()
    }

    async fn checkin(&self, mut mc: ManagedConnection) {
        self.in_use.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        mc.last_used = Instant::now();
        let mut idle = self.idle.lock().await;
        if idle.len() < self.capacity {
            idle.push(mc);
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await;
        PoolStats {
            idle: idle.len(),
            in_use: self.in_use.load(std::sync::atomic::Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Run `f` against a checked-out connection on a blocking thread,
    /// retrying up to 3 times with exponential backoff on transient
    /// connection errors. Syntax/constraint errors fail fast (first
    /// attempt).
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0u32;
        loop {
            let mc = self.checkout().await?;
            let f = f.clone();
            let result = tokio::task::spawn_blocking(move || {
                let out = f(&mc.conn);
                (mc, out)
            })
            .await
            .map_err(|e| Error::Connection(format!("pool worker panicked: {e}")));

            match result {
                Ok((mc, Ok(value))) => {
                    self.checkin(mc).await;
                    return Ok(value);
                }
                Ok((mc, Err(e))) => {
                    self.checkin(mc).await;
                    if !is_transient_sqlite_error(&e) || attempt >= 2 {
                        return Err(Error::from(e));
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                    warn!(attempt, ?backoff, "retrying transient db error");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn execute(&self, sql: &str, params: Vec<rusqlite::types::Value>) -> Result<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute(&sql, rusqlite::params_from_iter(params.iter())))
            .await
    }

    pub async fn execute_many(&self, sql: &str, rows: Vec<Vec<rusqlite::types::Value>>) -> Result<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut affected = 0;
            for row in &rows {
                affected += conn.execute(&sql, rusqlite::params_from_iter(row.iter()))?;
            }
            Ok(affected)
        })
        .await
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(schema::SCHEMA_SQL)).await
    }

    /// Spawn the background janitor that closes idle/expired connections.
    /// Runs until the returned handle is aborted (process shutdown).
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut idle = pool.idle.lock().await;
                let now = Instant::now();
                let before = idle.len();
                idle.retain(|mc| {
                    now.duration_since(mc.created_at) <= pool.max_lifetime
                        && now.duration_since(mc.last_used) <= pool.max_idle
                });
                if idle.len() != before {
                    debug!(closed = before - idle.len(), "janitor recycled idle connections");
                }
            }
        })
    }

    /// Drain all idle connections deterministically. Called from the
    /// process shutdown hook; in-flight `with_conn` calls finish naturally
    /// since `checkin` is a no-op once the pool has been dropped by the
    /// caller holding the last `Arc`.
    pub async fn drain(&self) {
        let mut idle = self.idle.lock().await;
        idle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> (Arc<Pool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = Pool::open(
            path.to_str().unwrap(),
            3,
            2,
            Duration::from_secs(600),
            Duration::from_secs(1800),
        )
        .unwrap();
        pool.ensure_schema().await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn execute_and_fetch_roundtrip() {
        let (pool, _dir) = test_pool().await;
        pool.execute(
            "INSERT INTO user_profiles (user_id, username, phone_number, news_similarity_threshold, news_impact_threshold) VALUES (?1, ?2, ?3, ?4, ?5)",
            vec![
                rusqlite::types::Value::Text("u1".into()),
                rusqlite::types::Value::Text("tester".into()),
                rusqlite::types::Value::Text("010".into()),
                rusqlite::types::Value::Real(0.7),
                rusqlite::types::Value::Real(0.8),
            ],
        )
        .await
        .unwrap();

        let count: i64 = pool
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM user_profiles", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn syntax_error_fails_fast() {
        let (pool, _dir) = test_pool().await;
        let start = Instant::now();
        let err = pool.execute("NOT VALID SQL", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(Instant::now().duration_since(start) < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn stats_reports_capacity() {
        let (pool, _dir) = test_pool().await;
        let stats = pool.stats().await;
        assert_eq!(stats.capacity, 5);
    }
}
