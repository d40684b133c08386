//! C3 — near-duplicate filter.
//!
//! 64-bit SimHash fingerprint over whitespace-tokenized `title + content`,
//! banded into four 16-bit windows so a candidate match only needs an exact
//! hash hit on one band before paying for a full Hamming-distance
//! comparison — the same banding trick as classic LSH SimHash dedup
//! pipelines. A match is a fingerprint within `HAMMING_THRESHOLD` bits of an
//! existing row. Rows live in the relational store (C1) so a restart never
//! forgets what it has already seen, and are mirrored to a CSV duplicate
//! log for audit; any inconsistency here should never block ingestion, so
//! every public method fails open.

use crate::db::Pool;
use crate::error::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

const BAND_COUNT: usize = 4;
const BAND_BITS: usize = 16;

fn tokenize(title: &str, content: &str) -> Vec<String> {
    let mut combined = String::with_capacity(title.len() + content.len() + 1);
    combined.push_str(title);
    combined.push(' ');
    combined.push_str(content);
    combined
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn token_hash(token: &str) -> u64 {
    // FNV-1a 64-bit — deterministic, dependency-free, and stable across
    // runs (unlike `std::hash::RandomState`, which must not leak into a
    // fingerprint that is persisted and compared across process restarts).
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// 64-bit SimHash over the token multiset: each token contributes +1/-1 to
/// each bit position of its hash, and the fingerprint bit is set wherever
/// the accumulated weight is positive.
fn simhash(tokens: &[String]) -> u64 {
    let mut weights = [0i32; 64];
    for token in tokens {
        let h = token_hash(token);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }
    let mut fp: u64 = 0;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            fp |= 1 << bit;
        }
    }
    fp
}

fn bands_of(fingerprint: u64) -> [i64; BAND_COUNT] {
    let mut out = [0i64; BAND_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((fingerprint >> (i * BAND_BITS)) & 0xFFFF) as i64;
    }
    out
}

fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[derive(Debug, Clone)]
pub struct DedupMatch {
    pub id: String,
    pub distance: u32,
    pub title: String,
    pub url: String,
    pub inserted_at: String,
}

#[derive(Debug, Clone)]
pub struct DedupCheck {
    pub is_duplicate: bool,
    pub matched: Option<DedupMatch>,
    pub fingerprint: u64,
}

pub struct DedupFilter {
    pool: Arc<Pool>,
    hamming_threshold: u32,
    ttl_hours: i64,
    log_path: Option<PathBuf>,
}

impl DedupFilter {
    pub fn new(pool: Arc<Pool>, hamming_threshold: u32, ttl_hours: i64, log_path: Option<PathBuf>) -> Self {
        Self { pool, hamming_threshold, ttl_hours, log_path }
    }

    /// Check `title`/`content` against the index, scoped to `stock_code`,
    /// and if novel, insert a fresh row under `id`. Empty input is treated
    /// as non-duplicate (nothing to fingerprint) rather than erroring; any
    /// storage error is also treated as non-duplicate (fail-open — dedup
    /// is best-effort, never a reason to drop a real item).
    pub async fn check_and_register(&self, id: &str, stock_code: &str, title: &str, content: &str, url: &str) -> DedupCheck {
        let tokens = tokenize(title, content);
        if tokens.is_empty() {
            warn!(id, "empty dedup input, admitting without fingerprinting");
            return DedupCheck { is_duplicate: false, matched: None, fingerprint: 0 };
        }
        let fingerprint = simhash(&tokens);

        match self.find_match(stock_code, fingerprint).await {
            Ok(Some(m)) => {
                self.log_duplicate(id, &m.id, fingerprint);
                DedupCheck { is_duplicate: true, matched: Some(m), fingerprint }
            }
            Ok(None) => {
                if let Err(e) = self.register(id, stock_code, fingerprint, title, url).await {
                    warn!(error = %e, id, "failed to persist dedup row, admitting item");
                }
                DedupCheck { is_duplicate: false, matched: None, fingerprint }
            }
            Err(e) => {
                warn!(error = %e, id, "dedup lookup failed, admitting without fingerprinting");
                DedupCheck { is_duplicate: false, matched: None, fingerprint }
            }
        }
    }

    async fn find_match(&self, stock_code: &str, fingerprint: u64) -> Result<Option<DedupMatch>> {
        let bands = bands_of(fingerprint);
        let stock_code = stock_code.to_string();
        let threshold = self.hamming_threshold;

        let candidates: Vec<(String, i64, String, String, String)> = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, fingerprint, title, url, inserted_at FROM dedup_fingerprint
                     WHERE stock_code = ?1 AND (band0 = ?2 OR band1 = ?3 OR band2 = ?4 OR band3 = ?5)",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![stock_code, bands[0], bands[1], bands[2], bands[3]], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        for (cand_id, cand_fp, title, url, inserted_at) in candidates {
            let distance = hamming_distance(cand_fp as u64, fingerprint);
            if distance <= threshold {
                return Ok(Some(DedupMatch { id: cand_id, distance, title, url, inserted_at }));
            }
        }
        Ok(None)
    }

    async fn register(&self, id: &str, stock_code: &str, fingerprint: u64, title: &str, url: &str) -> Result<()> {
        let bands = bands_of(fingerprint);
        let (id, stock_code, title, url) = (id.to_string(), stock_code.to_string(), title.to_string(), url.to_string());
        let fp_signed = fingerprint as i64;
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO dedup_fingerprint (id, stock_code, fingerprint, band0, band1, band2, band3, title, url)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![id, stock_code, fp_signed, bands[0], bands[1], bands[2], bands[3], title, url],
                )
            })
            .await?;
        Ok(())
    }

    fn log_duplicate(&self, id: &str, matched_id: &str, fingerprint: u64) {
        let Some(path) = &self.log_path else { return };
        let line = format!("{},{},{},{}\n", chrono::Utc::now().to_rfc3339(), id, matched_id, fingerprint);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            error!(error = %e, path = %path.display(), "failed to append duplicate log, continuing");
        }
    }

    /// Remove rows older than the configured TTL. Safe to call from a
    /// periodic janitor task.
    pub async fn vacuum_expired(&self) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(self.ttl_hours)).to_rfc3339();
        self.pool
            .with_conn(move |conn| conn.execute("DELETE FROM dedup_fingerprint WHERE inserted_at < ?1", [&cutoff]))
            .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.pool
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM dedup_fingerprint", [], |r| r.get::<_, i64>(0)))
            .await
            .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_filter() -> (DedupFilter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("dedup.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();
        (DedupFilter::new(pool, 3, 48, None), dir)
    }

    #[tokio::test]
    async fn identical_text_is_duplicate() {
        let (filter, _dir) = test_filter().await;
        let first = filter.check_and_register("n1", "005930", "Samsung posts record profit", "quarterly earnings beat estimates", "https://x/1").await;
        assert!(!first.is_duplicate);
        let second = filter.check_and_register("n2", "005930", "Samsung posts record profit", "quarterly earnings beat estimates", "https://x/2").await;
        assert!(second.is_duplicate);
        assert_eq!(second.matched.as_ref().unwrap().id, "n1");
        assert_eq!(second.matched.as_ref().unwrap().distance, 0);
    }

    #[tokio::test]
    async fn near_duplicate_within_threshold_matches() {
        let (filter, _dir) = test_filter().await;
        filter.check_and_register("n1", "005930", "Samsung posts record quarterly profit today", "details inside the report", "u1").await;
        let result = filter.check_and_register("n2", "005930", "Samsung posts record quarterly profit", "details inside that report", "u2").await;
        assert!(result.is_duplicate);
    }

    #[tokio::test]
    async fn unrelated_text_is_not_duplicate() {
        let (filter, _dir) = test_filter().await;
        filter.check_and_register("n1", "005930", "Samsung posts record profit", "earnings beat estimates", "u1").await;
        let result = filter.check_and_register("n2", "005930", "Local weather turns rainy this weekend", "forecast for the coastal region", "u2").await;
        assert!(!result.is_duplicate);
    }

    #[tokio::test]
    async fn same_text_different_stock_is_not_duplicate() {
        let (filter, _dir) = test_filter().await;
        filter.check_and_register("n1", "005930", "Samsung posts record profit", "quarterly earnings beat estimates", "u1").await;
        let result = filter.check_and_register("n2", "000660", "Samsung posts record profit", "quarterly earnings beat estimates", "u2").await;
        assert!(!result.is_duplicate);
    }

    #[tokio::test]
    async fn empty_input_is_admitted_without_crashing() {
        let (filter, _dir) = test_filter().await;
        let result = filter.check_and_register("n1", "005930", "", "", "u1").await;
        assert!(!result.is_duplicate);
    }

    #[tokio::test]
    async fn vacuum_removes_nothing_before_ttl() {
        let (filter, _dir) = test_filter().await;
        filter.check_and_register("n1", "005930", "some headline", "some body", "u1").await;
        assert_eq!(filter.vacuum_expired().await.unwrap(), 0);
        assert_eq!(filter.len().await.unwrap(), 1);
    }
}
