//! C8 — institutional/program flow pattern engine.
//!
//! Ingests end-of-day flow rows and 5-minute program-trade ticks, then
//! evaluates the composite-strong rule: institutional net buying on at
//! least 3 of the last 5 business days, AND today's program net volume at
//! least 2.5x its trailing 30-day average. Ingestion is serialized
//! per-ticker through `KeyedLocks` so a late-arriving EOD row for one
//! ticker never blocks another ticker's ingestion. `pattern_signal` writes
//! are idempotent (`INSERT OR IGNORE` on `(ref_time, ticker)`) so the
//! dispatch fires exactly once per evaluation window, first writer wins.

use crate::db::Pool;
use crate::error::Result;
use crate::keyed_lock::KeyedLocks;
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use crate::time_util;
use chrono::NaiveDate;
use chrono_tz::Tz;
use rusqlite::OptionalExtension;
use std::sync::Arc;
use tracing::debug;

pub const INSTITUTIONAL_LOOKBACK_DAYS: u32 = 5;
pub const INSTITUTIONAL_MIN_POSITIVE_DAYS: usize = 3;
pub const PROGRAM_STRONG_MULTIPLIER: f64 = 2.5;
pub const PROGRAM_AVG_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct EodFlowRow {
    pub trade_date: NaiveDate,
    pub ticker: String,
    pub inst_net: f64,
    pub foreign_net: f64,
    pub individual_net: f64,
    pub total_value: f64,
    pub close_price: f64,
    pub volume: i64,
}

#[derive(Debug, Clone)]
pub struct ProgramTick {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub ticker: String,
    pub net_volume: i64,
    pub net_value: f64,
    pub side: String,
    pub price: f64,
    pub total_volume: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    pub daily_inst_strong: bool,
    pub rt_prog_strong: bool,
    pub inst_buy_days: usize,
    pub prog_volume: i64,
    pub prog_ratio: f64,
}

impl EvaluationResult {
    pub fn composite_strong(&self) -> bool {
        self.daily_inst_strong && self.rt_prog_strong
    }
}

pub struct FlowEngine {
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    locks: KeyedLocks<String>,
    market_tz: Tz,
}

impl FlowEngine {
    pub fn new(pool: Arc<Pool>, dispatcher: Arc<Dispatcher>, market_tz: Tz) -> Self {
        Self { pool, dispatcher, locks: KeyedLocks::new(), market_tz }
    }

    pub async fn ingest_eod(&self, row: EodFlowRow) -> Result<()> {
        let _guard = self.locks.lock(row.ticker.clone()).await;
        let date_s = row.trade_date.format("%Y-%m-%d").to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO eod_flow
                        (trade_date, ticker, inst_net, foreign_net, individual_net, total_value, close_price, volume)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(trade_date, ticker) DO UPDATE SET
                        inst_net = excluded.inst_net, foreign_net = excluded.foreign_net,
                        individual_net = excluded.individual_net, total_value = excluded.total_value,
                        close_price = excluded.close_price, volume = excluded.volume",
                    rusqlite::params![
                        date_s, row.ticker, row.inst_net, row.foreign_net,
                        row.individual_net, row.total_value, row.close_price, row.volume,
                    ],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn ingest_program_tick(&self, tick: ProgramTick) -> Result<()> {
        let _guard = self.locks.lock(tick.ticker.clone()).await;
        let ts_s = tick.ts.to_rfc3339();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO program_flow (ts, ticker, net_volume, net_value, side, price, total_volume)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(ts, ticker) DO UPDATE SET
                        net_volume = excluded.net_volume, net_value = excluded.net_value,
                        side = excluded.side, price = excluded.price, total_volume = excluded.total_volume",
                    rusqlite::params![ts_s, tick.ticker, tick.net_volume, tick.net_value, tick.side, tick.price, tick.total_volume],
                )
            })
            .await?;
        Ok(())
    }

    async fn institutional_strong(&self, ticker: &str, reference_date: NaiveDate) -> Result<(bool, usize)> {
        let days = time_util::recent_business_days(reference_date, INSTITUTIONAL_LOOKBACK_DAYS);
        let start = days.first().copied().unwrap_or(reference_date).format("%Y-%m-%d").to_string();
        let end = reference_date.format("%Y-%m-%d").to_string();
        let ticker = ticker.to_string();

        let positive_days: i64 = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM eod_flow WHERE ticker = ?1 AND trade_date BETWEEN ?2 AND ?3 AND inst_net > 0",
                    rusqlite::params![ticker, start, end],
                    |r| r.get(0),
                )
            })
            .await?;

        let positive_days = positive_days as usize;
        Ok((positive_days >= INSTITUTIONAL_MIN_POSITIVE_DAYS, positive_days))
    }

    async fn program_strong(&self, ticker: &str, reference_date: NaiveDate) -> Result<(bool, i64, f64)> {
        let today_s = reference_date.format("%Y-%m-%d").to_string();
        let window_start = (reference_date - chrono::Duration::days(PROGRAM_AVG_WINDOW_DAYS as i64))
            .format("%Y-%m-%d")
            .to_string();
        let ticker1 = ticker.to_string();
        let ticker2 = ticker.to_string();

        let today_volume: Option<i64> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT SUM(net_volume) FROM program_flow WHERE ticker = ?1 AND ts LIKE ?2 || '%'",
                    rusqlite::params![ticker1, today_s],
                    |r| r.get(0),
                )
                .optional()
                .map(|v| v.flatten())
            })
            .await?;
        let today_volume = today_volume.unwrap_or(0);

        let today_s2 = today_s.clone();
        let avg_volume: Option<f64> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT AVG(daily_net) FROM (
                        SELECT SUM(net_volume) AS daily_net FROM program_flow
                        WHERE ticker = ?1 AND ts >= ?2 AND ts < ?3 GROUP BY substr(ts, 1, 10)
                     )",
                    rusqlite::params![ticker2, window_start, today_s2],
                    |r| r.get(0),
                )
                .optional()
                .map(|v| v.flatten())
            })
            .await?;
        let avg_volume = avg_volume.unwrap_or(0.0);

        let ratio = if avg_volume.abs() > f64::EPSILON { today_volume as f64 / avg_volume } else { 0.0 };
        Ok((avg_volume > 0.0 && today_volume as f64 >= PROGRAM_STRONG_MULTIPLIER * avg_volume, today_volume, ratio))
    }

    /// Evaluate both rules for `ticker` as of `reference_date`, persist a
    /// `pattern_signal` row if this is the first evaluation for this
    /// `(ref_time, ticker)` pair, and dispatch a `kind=flow` alert when
    /// composite-strong. Returns the evaluation even when the row already
    /// existed, so callers can log without re-dispatching.
    pub async fn evaluate(&self, ticker: &str, stock_name: &str, reference_date: NaiveDate) -> Result<EvaluationResult> {
        let (daily_inst_strong, inst_buy_days) = self.institutional_strong(ticker, reference_date).await?;
        let (rt_prog_strong, prog_volume, prog_ratio) = self.program_strong(ticker, reference_date).await?;

        let result = EvaluationResult { daily_inst_strong, rt_prog_strong, inst_buy_days, prog_volume, prog_ratio };

        let ref_time = reference_date.format("%Y-%m-%d").to_string();
        let trigger_inputs = serde_json::json!({
            "inst_buy_days": inst_buy_days,
            "prog_volume": prog_volume,
            "prog_ratio": prog_ratio,
        })
        .to_string();

        let (tk, rt, dis, rps, ibd, pv, pr, ti) = (
            ticker.to_string(), ref_time.clone(), daily_inst_strong as i64, rt_prog_strong as i64,
            inst_buy_days as i64, prog_volume, prog_ratio, trigger_inputs,
        );
        let inserted = self
            .pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO pattern_signal
                        (ref_time, ticker, daily_inst_strong, rt_prog_strong, inst_buy_days, prog_volume, prog_ratio, trigger_inputs)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![rt, tk, dis, rps, ibd, pv, pr, ti],
                )
            })
            .await?;

        if inserted == 0 {
            debug!(ticker, ref_time, "pattern_signal already recorded for this window, skipping dispatch");
            return Ok(result);
        }

        if result.composite_strong() {
            let payload = serde_json::json!({
                "daily_inst_strong": result.daily_inst_strong,
                "rt_prog_strong": result.rt_prog_strong,
                "inst_buy_days": result.inst_buy_days,
                "prog_volume": result.prog_volume,
                "prog_ratio": result.prog_ratio,
            });
            let event = AlertEvent {
                kind: EventKind::Flow,
                stock_code: ticker.to_string(),
                stock_name: stock_name.to_string(),
                payload,
                target_user_id: None,
            };
            self.dispatcher.dispatch(&event).await?;
        }

        Ok(result)
    }

    pub fn market_tz(&self) -> Tz {
        self.market_tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
    use std::time::Duration;

    async fn test_engine() -> (FlowEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("flow.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.5).await.unwrap();
        user_config.update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }]).await.unwrap();
        user_config.update_services("u1", &ServiceFlags { flow: true, ..Default::default() }).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, Arc::new(crate::notify::NullTransport), vec![], Duration::from_secs(86_400)));
        let engine = FlowEngine::new(pool, dispatcher, chrono_tz::Asia::Seoul);
        (engine, dir)
    }

    #[tokio::test]
    async fn institutional_strong_requires_three_of_five_days() {
        let (engine, _dir) = test_engine().await;
        let monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let days = time_util::recent_business_days(monday, 5);
        for (i, day) in days.iter().enumerate() {
            let inst_net = if i < 2 { -100.0 } else { 100.0 };
            engine
                .ingest_eod(EodFlowRow {
                    trade_date: *day,
                    ticker: "005930".into(),
                    inst_net,
                    foreign_net: 0.0,
                    individual_net: 0.0,
                    total_value: 1000.0,
                    close_price: 70000.0,
                    volume: 100,
                })
                .await
                .unwrap();
        }
        let (strong, _) = engine.institutional_strong("005930", monday).await.unwrap();
        assert!(strong);
    }

    #[tokio::test]
    async fn pattern_signal_is_idempotent_per_window() {
        let (engine, _dir) = test_engine().await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let first = engine.evaluate("005930", "삼성전자", date).await.unwrap();
        let second = engine.evaluate("005930", "삼성전자", date).await.unwrap();
        assert_eq!(first.inst_buy_days, second.inst_buy_days);
    }
}
