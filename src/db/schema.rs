//! Relational schema, applied idempotently at pool construction.
//!
//! WAL mode plus the `IF NOT EXISTS` guards follow the teacher's
//! `signals/db_storage.rs` convention.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    phone_number TEXT NOT NULL UNIQUE,
    news_similarity_threshold REAL NOT NULL DEFAULT 0.7,
    news_impact_threshold REAL NOT NULL DEFAULT 0.8,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS user_stocks (
    user_id TEXT NOT NULL,
    stock_code TEXT NOT NULL,
    stock_name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (user_id, stock_code)
);
CREATE INDEX IF NOT EXISTS idx_user_stocks_stock ON user_stocks(stock_code, enabled);

CREATE TABLE IF NOT EXISTS user_model (
    user_id TEXT PRIMARY KEY,
    model_tag TEXT NOT NULL DEFAULT 'hyperclova',
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS user_services (
    user_id TEXT PRIMARY KEY,
    news INTEGER NOT NULL DEFAULT 0,
    disclosure INTEGER NOT NULL DEFAULT 0,
    chart INTEGER NOT NULL DEFAULT 0,
    report INTEGER NOT NULL DEFAULT 0,
    flow INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS eod_flow (
    trade_date TEXT NOT NULL,
    ticker TEXT NOT NULL,
    inst_net REAL NOT NULL,
    foreign_net REAL NOT NULL,
    individual_net REAL NOT NULL,
    total_value REAL NOT NULL,
    close_price REAL NOT NULL,
    volume INTEGER NOT NULL,
    inserted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (trade_date, ticker)
);
CREATE INDEX IF NOT EXISTS idx_eod_flow_ticker_date ON eod_flow(ticker, trade_date DESC);

CREATE TABLE IF NOT EXISTS program_flow (
    ts TEXT NOT NULL,
    ticker TEXT NOT NULL,
    net_volume INTEGER NOT NULL,
    net_value REAL NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    total_volume INTEGER NOT NULL,
    PRIMARY KEY (ts, ticker)
);
CREATE INDEX IF NOT EXISTS idx_program_flow_ticker_ts ON program_flow(ticker, ts DESC);

CREATE TABLE IF NOT EXISTS pattern_signal (
    ref_time TEXT NOT NULL,
    ticker TEXT NOT NULL,
    daily_inst_strong INTEGER NOT NULL,
    rt_prog_strong INTEGER NOT NULL,
    inst_buy_days INTEGER NOT NULL,
    prog_volume INTEGER NOT NULL,
    prog_ratio REAL NOT NULL,
    trigger_inputs TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (ref_time, ticker)
);

CREATE TABLE IF NOT EXISTS chart_condition_hit (
    stock_code TEXT NOT NULL,
    hit_date TEXT NOT NULL,
    hit_time TEXT NOT NULL,
    close_price REAL NOT NULL,
    volume INTEGER NOT NULL,
    golden_cross INTEGER NOT NULL DEFAULT 0,
    dead_cross INTEGER NOT NULL DEFAULT 0,
    bollinger_touch INTEGER NOT NULL DEFAULT 0,
    ma20_touch INTEGER NOT NULL DEFAULT 0,
    rsi_condition INTEGER NOT NULL DEFAULT 0,
    volume_surge INTEGER NOT NULL DEFAULT 0,
    macd_golden_cross INTEGER NOT NULL DEFAULT 0,
    support_resistance_break INTEGER NOT NULL DEFAULT 0,
    details TEXT NOT NULL,
    PRIMARY KEY (stock_code, hit_date, hit_time)
);
CREATE INDEX IF NOT EXISTS idx_chart_hit_stock_date ON chart_condition_hit(stock_code, hit_date DESC);

CREATE TABLE IF NOT EXISTS news_item (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    content_excerpt TEXT NOT NULL,
    url TEXT NOT NULL,
    source TEXT NOT NULL,
    publish_time TEXT NOT NULL,
    stock_code TEXT NOT NULL,
    impact_score REAL NOT NULL,
    reasoning TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_news_stock_time ON news_item(stock_code, publish_time DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_news_url_recent ON news_item(url, stock_code);

CREATE TABLE IF NOT EXISTS disclosure_item (
    rcept_no TEXT PRIMARY KEY,
    corp_code TEXT NOT NULL,
    stock_code TEXT NOT NULL,
    report_name TEXT NOT NULL,
    filer TEXT NOT NULL,
    receipt_date TEXT NOT NULL,
    raw_note TEXT,
    impact_score REAL NOT NULL,
    sentiment_label TEXT NOT NULL,
    sentiment_reason TEXT NOT NULL,
    expected_impact_direction TEXT NOT NULL,
    horizon_tag TEXT NOT NULL,
    keywords TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_disclosure_stock_date ON disclosure_item(stock_code, receipt_date DESC);

-- Consolidated delivery log, shared by every dispatcher event kind
-- (spec.md §9 open question: "consolidate to a single table").
CREATE TABLE IF NOT EXISTS delivery_log (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    user_id TEXT NOT NULL,
    event_digest TEXT NOT NULL,
    status TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    message_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_user_digest_time ON delivery_log(user_id, event_digest, sent_at DESC);

-- C3's banded SimHash index. `fingerprint`/`band0..3` are the signed-i64
-- views of the unsigned 64-bit SimHash and its four 16-bit windows; a
-- lookup matches rows sharing any band value for the same stock_code
-- before paying for a full Hamming-distance comparison.
CREATE TABLE IF NOT EXISTS dedup_fingerprint (
    id TEXT PRIMARY KEY,
    stock_code TEXT NOT NULL,
    fingerprint INTEGER NOT NULL,
    band0 INTEGER NOT NULL,
    band1 INTEGER NOT NULL,
    band2 INTEGER NOT NULL,
    band3 INTEGER NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    inserted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_dedup_stock_band0 ON dedup_fingerprint(stock_code, band0);
CREATE INDEX IF NOT EXISTS idx_dedup_stock_band1 ON dedup_fingerprint(stock_code, band1);
CREATE INDEX IF NOT EXISTS idx_dedup_stock_band2 ON dedup_fingerprint(stock_code, band2);
CREATE INDEX IF NOT EXISTS idx_dedup_stock_band3 ON dedup_fingerprint(stock_code, band3);
CREATE INDEX IF NOT EXISTS idx_dedup_inserted_at ON dedup_fingerprint(inserted_at);

-- Weekly-keywords helper for C2's vector metadata (one row per
-- stock_code/week_start, the importance vector stored alongside the
-- embeddings table itself -- this row is the relational side-channel
-- for admin inspection).
CREATE TABLE IF NOT EXISTS weekly_keywords (
    stock_code TEXT NOT NULL,
    week_start TEXT NOT NULL,
    keywords TEXT NOT NULL,
    importance TEXT NOT NULL,
    PRIMARY KEY (stock_code, week_start)
);

-- C11's child-process registry. Keyed by (service_name, user_id) rather
-- than service_name alone -- the supervisor is per-user, so the same
-- worker type runs once per subscribed user, each its own child process.
CREATE TABLE IF NOT EXISTS service_registry (
    service_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    port INTEGER NOT NULL,
    pid INTEGER,
    started_at TEXT,
    last_health_check TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (service_name, user_id)
);
"#;
