//! C7 — realtime chart condition engine.
//!
//! Maintains one `IndicatorState` per stock (see `chart::indicators`) and,
//! on every tick, evaluates the eight named conditions against the
//! previous/current snapshot pair. A firing writes a `chart_condition_hit`
//! row (PK `(stock_code, date, time)` enforces invariant iii: at most one
//! hit per stock per timestamp) and dispatches a `kind=chart` alert whose
//! payload includes a past-case lookup: the most recent prior firing of the
//! same condition for the same stock, strictly before a business-day cutoff
//! (spec.md §9 open question — resolved to business days per the spec's own
//! steer; see DESIGN.md), enriched with its subsequent 5-trading-day
//! realized return.

pub mod indicators;

use crate::db::Pool;
use crate::error::Result;
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use crate::time_util;
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use indicators::{IndicatorState, Snapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GoldenCross,
    DeadCross,
    BollingerTouch,
    Ma20Touch,
    RsiCondition,
    VolumeSurge,
    MacdGoldenCross,
    SupportResistanceBreak,
}

impl Condition {
    pub fn all() -> [Condition; 8] {
        [
            Condition::GoldenCross,
            Condition::DeadCross,
            Condition::BollingerTouch,
            Condition::Ma20Touch,
            Condition::RsiCondition,
            Condition::VolumeSurge,
            Condition::MacdGoldenCross,
            Condition::SupportResistanceBreak,
        ]
    }

    pub fn column(self) -> &'static str {
        match self {
            Condition::GoldenCross => "golden_cross",
            Condition::DeadCross => "dead_cross",
            Condition::BollingerTouch => "bollinger_touch",
            Condition::Ma20Touch => "ma20_touch",
            Condition::RsiCondition => "rsi_condition",
            Condition::VolumeSurge => "volume_surge",
            Condition::MacdGoldenCross => "macd_golden_cross",
            Condition::SupportResistanceBreak => "support_resistance_break",
        }
    }
}

fn evaluate(prev: &Snapshot, cur: &Snapshot, epsilon: f64) -> Vec<Condition> {
    let mut fired = Vec::new();

    if prev.ma5 <= prev.ma20 && cur.ma5 > cur.ma20 {
        fired.push(Condition::GoldenCross);
    }
    if prev.ma5 >= prev.ma20 && cur.ma5 < cur.ma20 {
        fired.push(Condition::DeadCross);
    }
    if cur.bb_upper > 0.0 && ((cur.price - cur.bb_upper).abs() / cur.bb_upper) < epsilon {
        fired.push(Condition::BollingerTouch);
    } else if cur.bb_lower > 0.0 && ((cur.price - cur.bb_lower).abs() / cur.bb_lower) < epsilon {
        fired.push(Condition::BollingerTouch);
    }
    if cur.ma20 > 0.0 && ((cur.price - cur.ma20).abs() / cur.ma20) < epsilon {
        fired.push(Condition::Ma20Touch);
    }
    if cur.rsi >= 70.0 || cur.rsi <= 30.0 {
        fired.push(Condition::RsiCondition);
    }
    if cur.volume_ma5 > 0.0 && cur.volume > 3.0 * cur.volume_ma5 {
        fired.push(Condition::VolumeSurge);
    }
    if prev.macd <= prev.macd_signal && cur.macd > cur.macd_signal {
        fired.push(Condition::MacdGoldenCross);
    }
    if cur.price > cur.rolling_high_20 || cur.price < cur.rolling_low_20 {
        fired.push(Condition::SupportResistanceBreak);
    }

    fired
}

#[derive(Debug, Clone, Serialize)]
pub struct PastCase {
    pub date: String,
    pub time: String,
    pub close_price: f64,
    pub forward_return: Option<f64>,
}

/// Subsequent-N-trading-day price series, the external collaborator named
/// in spec.md §1 (the broker's price/quotes API) or a relational fallback.
#[async_trait]
pub trait PriceHistorySource: Send + Sync {
    /// Closing prices for `stock_code` on the `n` trading days strictly
    /// after `from_date`, oldest first.
    async fn forward_prices(&self, stock_code: &str, from_date: NaiveDate, n: u32) -> Result<Vec<f64>>;
}

pub struct NullPriceHistorySource;

#[async_trait]
impl PriceHistorySource for NullPriceHistorySource {
    async fn forward_prices(&self, _stock_code: &str, _from_date: NaiveDate, _n: u32) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

pub struct ChartEngine {
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    price_history: Arc<dyn PriceHistorySource>,
    state: Mutex<HashMap<String, IndicatorState>>,
    epsilon: f64,
    market_tz: Tz,
}

impl ChartEngine {
    pub fn new(
        pool: Arc<Pool>,
        dispatcher: Arc<Dispatcher>,
        price_history: Arc<dyn PriceHistorySource>,
        epsilon: f64,
        market_tz: Tz,
    ) -> Self {
        Self { pool, dispatcher, price_history, state: Mutex::new(HashMap::new()), epsilon, market_tz }
    }

    /// Consume one realtime tick. Writes any fired conditions and
    /// dispatches alerts; returns the list of conditions that fired (empty
    /// before the 26-observation bootstrap completes).
    pub async fn on_tick(&self, stock_code: &str, stock_name: &str, ts: chrono::DateTime<chrono::Utc>, price: f64, volume: f64) -> Result<Vec<Condition>> {
        let (prev, cur, bootstrapped) = {
            let mut state = self.state.lock();
            let entry = state.entry(stock_code.to_string()).or_default();
            let (prev, cur) = entry.push(price, volume);
            (prev, cur, entry.is_bootstrapped())
        };

        if !bootstrapped {
            debug!(stock_code, "indicator warmup in progress, suppressing firings");
            return Ok(Vec::new());
        }
        let Some(prev) = prev else { return Ok(Vec::new()) };

        let fired = evaluate(&prev, &cur, self.epsilon);
        if fired.is_empty() {
            return Ok(fired);
        }

        let local = ts.with_timezone(&self.market_tz);
        let date = local.date_naive();
        let time = local.format("%H:%M:%S").to_string();

        self.persist_hit(stock_code, date, &time, &cur, &fired).await?;

        for condition in &fired {
            let past_case = self.past_case_lookup(stock_code, *condition, date).await.ok().flatten();
            let payload = serde_json::json!({
                "condition": condition.column(),
                "close_price": cur.price,
                "volume": cur.volume,
                "ma5": cur.ma5,
                "ma20": cur.ma20,
                "rsi": cur.rsi,
                "bb_upper": cur.bb_upper,
                "bb_lower": cur.bb_lower,
                "macd": cur.macd,
                "macd_signal": cur.macd_signal,
                "past_case": past_case,
                "past_case_return": past_case.as_ref().and_then(|p| p.forward_return),
            });
            let event = AlertEvent {
                kind: EventKind::Chart,
                stock_code: stock_code.to_string(),
                stock_name: stock_name.to_string(),
                payload,
                target_user_id: None,
            };
            let _ = self.dispatcher.dispatch(&event).await?;
        }

        Ok(fired)
    }

    async fn persist_hit(&self, stock_code: &str, date: NaiveDate, time: &str, snap: &Snapshot, fired: &[Condition]) -> Result<()> {
        let details = serde_json::json!({
            "ma5": snap.ma5, "ma20": snap.ma20, "rsi": snap.rsi,
            "bb_upper": snap.bb_upper, "bb_lower": snap.bb_lower,
            "macd": snap.macd, "macd_signal": snap.macd_signal,
        });
        let flags: HashMap<&'static str, bool> =
            Condition::all().into_iter().map(|c| (c.column(), fired.contains(&c))).collect();

        let stock_code = stock_code.to_string();
        let date_s = date.format("%Y-%m-%d").to_string();
        let time_s = time.to_string();
        let price = snap.price;
        let volume = snap.volume as i64;
        let details_s = details.to_string();

        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO chart_condition_hit
                        (stock_code, hit_date, hit_time, close_price, volume,
                         golden_cross, dead_cross, bollinger_touch, ma20_touch,
                         rsi_condition, volume_surge, macd_golden_cross, support_resistance_break, details)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                     ON CONFLICT(stock_code, hit_date, hit_time) DO NOTHING",
                    rusqlite::params![
                        stock_code, date_s, time_s, price, volume,
                        flags["golden_cross"] as i64, flags["dead_cross"] as i64,
                        flags["bollinger_touch"] as i64, flags["ma20_touch"] as i64,
                        flags["rsi_condition"] as i64, flags["volume_surge"] as i64,
                        flags["macd_golden_cross"] as i64, flags["support_resistance_break"] as i64,
                        details_s,
                    ],
                )
            })
            .await?;
        Ok(())
    }

    /// Most recent prior occurrence of `condition` for `stock_code` whose
    /// date is strictly before `cutoff_date` minus 5 business days,
    /// enriched with the subsequent 5-trading-day realized return.
    async fn past_case_lookup(&self, stock_code: &str, condition: Condition, reference_date: NaiveDate) -> Result<Option<PastCase>> {
        let cutoff = time_util::subtract_business_days(reference_date, 5);
        let column = condition.column().to_string();
        let code = stock_code.to_string();
        let cutoff_s = cutoff.format("%Y-%m-%d").to_string();

        let row: Option<(String, String, f64)> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT hit_date, hit_time, close_price FROM chart_condition_hit
                         WHERE stock_code = ?1 AND {column} = 1 AND hit_date < ?2
                         ORDER BY hit_date DESC, hit_time DESC LIMIT 1"
                    ),
                    rusqlite::params![code, cutoff_s],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
            })
            .await?;

        let Some((date_s, time_s, close_price)) = row else { return Ok(None) };
        let from_date = NaiveDate::parse_from_str(&date_s, "%Y-%m-%d").unwrap_or(reference_date);
        let forward = self.price_history.forward_prices(stock_code, from_date, 5).await.unwrap_or_default();
        let forward_return = forward.last().map(|last| (last - close_price) / close_price);

        Ok(Some(PastCase { date: date_s, time: time_s, close_price, forward_return }))
    }
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
    use std::time::Duration;

    async fn test_engine() -> (ChartEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("chart.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.5).await.unwrap();
        user_config.update_stocks("u1", &[StockEntry { stock_code: "006800".into(), stock_name: "미래에셋증권".into(), enabled: true }]).await.unwrap();
        user_config.update_services("u1", &ServiceFlags { chart: true, ..Default::default() }).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, Arc::new(crate::notify::NullTransport), vec![], Duration::from_secs(86_400)));
        let engine = ChartEngine::new(pool, dispatcher, Arc::new(NullPriceHistorySource), 0.001, chrono_tz::Asia::Seoul);
        (engine, dir)
    }

    #[tokio::test]
    async fn fewer_than_26_ticks_never_fires() {
        let (engine, _dir) = test_engine().await;
        let mut ts = chrono::Utc::now();
        for i in 0..25 {
            let fired = engine.on_tick("006800", "name", ts, 100.0 + i as f64, 1000.0).await.unwrap();
            assert!(fired.is_empty());
            ts += chrono::Duration::minutes(1);
        }
    }

    #[tokio::test]
    async fn golden_cross_fires_and_persists() {
        let (engine, _dir) = test_engine().await;
        let mut ts = chrono::Utc::now();
        // Push a declining-then-flat series to bootstrap with ma5 < ma20, then a jump to cross.
        for _ in 0..30 {
            engine.on_tick("006800", "name", ts, 100.0, 1000.0).await.unwrap();
            ts += chrono::Duration::minutes(1);
        }
        let fired = engine.on_tick("006800", "name", ts, 130.0, 1000.0).await.unwrap();
        assert!(fired.contains(&Condition::GoldenCross));
    }
}
