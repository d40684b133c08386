//! Cross-component integration tests exercising full request flows against
//! real storage (no mocked pool), preferring real SQLite over fakes.

use chrono::NaiveDate;
use hyperasset_core::chart::{ChartEngine, Condition, NullPriceHistorySource};
use hyperasset_core::db::Pool;
use hyperasset_core::dedup::DedupFilter;
use hyperasset_core::flow::{EodFlowRow, FlowEngine, ProgramTick};
use hyperasset_core::notify::{Dispatcher, NotifyTransport};
use hyperasset_core::time_util::recent_business_days;
use hyperasset_core::user_config::{ServiceFlags, StockEntry, UserConfigManager};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait::async_trait]
impl NotifyTransport for RecordingTransport {
    async fn send(&self, user_id: &str, message: &str) -> hyperasset_core::Result<()> {
        self.sent.lock().push((user_id.to_string(), message.to_string()));
        Ok(())
    }
}

async fn fresh_pool(dir: &tempfile::TempDir, name: &str) -> Arc<Pool> {
    let pool = Pool::open(dir.path().join(name).to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
    pool.ensure_schema().await.unwrap();
    pool
}

/// Golden cross fires, writes a hit row, and dispatches to the one user
/// with the stock enabled and chart alerts on -- but not to a second user
/// who has the stock enabled with chart alerts off.
#[tokio::test]
async fn golden_cross_dispatches_only_to_subscribed_users() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir, "e2e1.db").await;

    let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
    user_config.upsert_profile("u_watch", "watcher", "010-1", 0.7, 0.8).await.unwrap();
    user_config
        .update_stocks("u_watch", &[StockEntry { stock_code: "006800".into(), stock_name: "미래에셋증권".into(), enabled: true }])
        .await
        .unwrap();
    user_config.update_services("u_watch", &ServiceFlags { chart: true, ..Default::default() }).await.unwrap();

    user_config.upsert_profile("u_quiet", "quiet", "010-2", 0.7, 0.8).await.unwrap();
    user_config
        .update_stocks("u_quiet", &[StockEntry { stock_code: "006800".into(), stock_name: "미래에셋증권".into(), enabled: true }])
        .await
        .unwrap();
    user_config.update_services("u_quiet", &ServiceFlags { chart: false, ..Default::default() }).await.unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(RecordingTransport { sent: sent.clone() });
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, transport, vec![], Duration::from_secs(86_400)));
    let engine = ChartEngine::new(pool, dispatcher, Arc::new(NullPriceHistorySource), 0.001, chrono_tz::Asia::Seoul);

    let mut ts = chrono::Utc::now();
    for _ in 0..30 {
        engine.on_tick("006800", "미래에셋증권", ts, 100.0, 1000.0).await.unwrap();
        ts += chrono::Duration::minutes(1);
    }
    let fired = engine.on_tick("006800", "미래에셋증권", ts, 130.0, 1000.0).await.unwrap();
    assert!(fired.contains(&Condition::GoldenCross));

    let delivered = sent.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "u_watch");
}

/// Composite flow signal (institutional strong + program strong) writes
/// one pattern_signal row and dispatches exactly once.
#[tokio::test]
async fn composite_flow_signal_dispatches_once() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir, "e2e2.db").await;

    let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
    user_config.upsert_profile("u1", "tester", "010-3", 0.7, 0.8).await.unwrap();
    user_config
        .update_stocks("u1", &[StockEntry { stock_code: "006800".into(), stock_name: "미래에셋증권".into(), enabled: true }])
        .await
        .unwrap();
    user_config.update_services("u1", &ServiceFlags { flow: true, ..Default::default() }).await.unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(RecordingTransport { sent: sent.clone() });
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, transport, vec![], Duration::from_secs(86_400)));
    let engine = FlowEngine::new(pool, dispatcher, chrono_tz::Asia::Seoul);

    let reference_date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
    let days = recent_business_days(reference_date, 5);
    // D-4, D-3, D-2 net-buy (index 0,1,2 of the 5-day window), D-1 and D negative.
    for (i, day) in days.iter().enumerate() {
        let inst_net = if i < 3 { 500.0 } else { -200.0 };
        engine
            .ingest_eod(EodFlowRow {
                trade_date: *day,
                ticker: "006800".into(),
                inst_net,
                foreign_net: 0.0,
                individual_net: 0.0,
                total_value: 1_000_000.0,
                close_price: 8_500.0,
                volume: 50_000,
            })
            .await
            .unwrap();
    }

    // 30-day average program volume baseline of ~1000/day, then day D's
    // total at 2.6x that average (2600).
    let baseline_start = reference_date - chrono::Duration::days(29);
    let mut day = baseline_start;
    while day < reference_date {
        engine
            .ingest_program_tick(ProgramTick {
                ts: day.and_hms_opt(10, 0, 0).unwrap().and_utc(),
                ticker: "006800".into(),
                net_volume: 1000,
                net_value: 1_000_000.0,
                side: "BUY".into(),
                price: 8_500.0,
                total_volume: 10_000,
            })
            .await
            .unwrap();
        day += chrono::Duration::days(1);
    }
    engine
        .ingest_program_tick(ProgramTick {
            ts: reference_date.and_hms_opt(10, 0, 0).unwrap().and_utc(),
            ticker: "006800".into(),
            net_volume: 2600,
            net_value: 2_600_000.0,
            side: "BUY".into(),
            price: 8_600.0,
            total_volume: 20_000,
        })
        .await
        .unwrap();

    let first = engine.evaluate("006800", "미래에셋증권", reference_date).await.unwrap();
    assert!(first.daily_inst_strong);
    assert!(first.rt_prog_strong);
    assert!(first.composite_strong());

    // Re-evaluating the same (ref_time, ticker) must not double-dispatch:
    // the pattern_signal row already exists (PK first-writer-wins).
    let second = engine.evaluate("006800", "미래에셋증권", reference_date).await.unwrap();
    assert_eq!(second.inst_buy_days, first.inst_buy_days);

    assert_eq!(sent.lock().len(), 1, "composite signal must dispatch exactly once across repeated evaluations");
}

/// Two near-identical news items for the same stock collide in SimHash and
/// only the first is admitted; a different stock_code with the same text
/// is NOT treated as a duplicate (a match requires both the Hamming match
/// AND the same stock_code).
#[tokio::test]
async fn news_dedup_drops_second_identical_item_same_stock_only() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir, "e2e4.db").await;
    let log_path = dir.path().join("dupes.csv");
    let filter = DedupFilter::new(pool, 3, 48, Some(log_path.clone()));

    let title = "삼성전자 1분기 실적 발표";
    let content = "삼성전자가 1분기 실적을 발표했다 영업이익이 전년 대비 증가했다";

    let first = filter.check_and_register("n1", "005930", title, content, "https://example.com/a").await;
    assert!(!first.is_duplicate);

    let second = filter.check_and_register("n2", "005930", title, content, "https://example.com/b").await;
    assert!(second.is_duplicate);
    assert_eq!(second.matched.as_ref().map(|m| m.id.as_str()), Some("n1"));

    // Same text, different stock: must not collide.
    let third = filter.check_and_register("n3", "000660", title, content, "https://example.com/c").await;
    assert!(!third.is_duplicate);

    assert!(log_path.exists(), "a duplicate log line must be written on match");
    let log_contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_contents.contains("n1"));
}

/// Boundary: fewer than 26 ticks never fires a condition even when the
/// underlying series would otherwise satisfy a rule (e.g. a sharp jump).
#[tokio::test]
async fn chart_engine_suppresses_firings_before_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir, "e2e3.db").await;
    let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.8, "hyperclova".into()));
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, Arc::new(hyperasset_core::notify::NullTransport), vec![], Duration::from_secs(86_400)));
    let engine = ChartEngine::new(pool, dispatcher, Arc::new(NullPriceHistorySource), 0.001, chrono_tz::Asia::Seoul);

    let mut ts = chrono::Utc::now();
    let mut any_fired = false;
    for i in 0..20 {
        let fired = engine.on_tick("000660", "SK하이닉스", ts, 100.0 + (i as f64) * 10.0, 1000.0).await.unwrap();
        any_fired |= !fired.is_empty();
        ts += chrono::Duration::minutes(1);
    }
    assert!(!any_fired, "no condition may fire before the 26-tick bootstrap completes");
}
