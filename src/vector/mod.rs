//! C2 — vector store adapter.
//!
//! No example repo in the corpus carries a production vector-database
//! client (Chroma has none, and pulling in `qdrant-client`/`pinecone-rs`
//! would be a fabricated dependency with no grounding anywhere in the
//! pack — see DESIGN.md). This adapter is `rusqlite`-backed: one table per
//! named collection storing `(id, document, metadata_json, embedding_blob)`,
//! with k-NN implemented as an in-process scan over deserialized `Vec<f32>`
//! vectors. That is workable at this system's scale (embeddings numbering
//! in the thousands-to-low-millions per collection) and keeps the adapter
//! "agnostic to the model" per spec: callers inject an embedding function.

use crate::db::Pool;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    HighImpactNews,
    PastEvents,
    DailyNews,
    Keywords,
}

impl Collection {
    pub fn table_name(self) -> &'static str {
        match self {
            Collection::HighImpactNews => "vec_high_impact_news",
            Collection::PastEvents => "vec_past_events",
            Collection::DailyNews => "vec_daily_news",
            Collection::Keywords => "vec_keywords",
        }
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub document: String,
    pub metadata: serde_json::Value,
    pub distance: f32,
    pub similarity: f32,
}

pub struct VectorStore {
    pool: Arc<Pool>,
    embedder: Arc<dyn Embedder>,
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (na * nb))
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl VectorStore {
    pub fn new(pool: Arc<Pool>, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for c in [
            Collection::HighImpactNews,
            Collection::PastEvents,
            Collection::DailyNews,
            Collection::Keywords,
        ] {
            let table = c.table_name().to_string();
            self.pool
                .with_conn(move |conn| {
                    conn.execute_batch(&format!(
                        "CREATE TABLE IF NOT EXISTS {table} (
                            id TEXT PRIMARY KEY,
                            document TEXT NOT NULL,
                            metadata TEXT NOT NULL,
                            embedding BLOB NOT NULL,
                            inserted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                        );"
                    ))
                })
                .await?;
        }
        Ok(())
    }

    /// Write a document. On id collision the write is rejected (per spec,
    /// the caller must retry with a salted id — this adapter does not
    /// retry on the caller's behalf).
    pub async fn add_document(
        &self,
        collection: Collection,
        id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let embedding = self.embedder.embed(text).await?;
        let table = collection.table_name().to_string();
        let id = id.to_string();
        let text = text.to_string();
        let metadata_json = serde_json::to_string(&metadata)?;
        let blob = encode_embedding(&embedding);

        let existing: i64 = self
            .pool
            .with_conn({
                let table = table.clone();
                let id = id.clone();
                move |conn| conn.query_row(&format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"), [&id], |r| r.get(0))
            })
            .await?;
        if existing > 0 {
            return Err(Error::Duplicate(format!("id {id} already exists in {table}")));
        }

        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    &format!("INSERT INTO {table} (id, document, metadata, embedding) VALUES (?1, ?2, ?3, ?4)"),
                    rusqlite::params![id, text, metadata_json, blob],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn search_similar(&self, query_text: &str, collection: Collection, k: usize) -> Result<Vec<SearchHit>> {
        let query_embedding = self.embedder.embed(query_text).await?;
        let table = collection.table_name().to_string();

        let rows: Vec<(String, String, String, Vec<u8>)> = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT id, document, metadata, embedding FROM {table}"))?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut scored: Vec<SearchHit> = rows
            .into_iter()
            .map(|(id, document, metadata_json, blob)| {
                let embedding = decode_embedding(&blob);
                let distance = cosine_distance(&query_embedding, &embedding);
                // Cosine distance ranges [0, 2] (cosine similarity in
                // [-1, 1]): below 1 it's the usual complement, above 1
                // the complement against 2 so a fully anti-correlated
                // pair still lands at 0 rather than clamping early.
                let similarity = if distance <= 1.0 { 1.0 - distance } else { (2.0 - distance).max(0.0) };
                let metadata = serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
                SearchHit { id, document, metadata, distance, similarity }
            })
            .collect();

        scored.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Admin/inspection only — not used in hot paths. Returns documents in
    /// insertion order (sqlite's implicit rowid order).
    pub async fn get_all_documents(&self, collection: Collection, limit: usize) -> Result<Vec<SearchHit>> {
        let table = collection.table_name().to_string();
        let rows: Vec<(String, String, String)> = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT id, document, metadata FROM {table} ORDER BY rowid ASC LIMIT ?1"))?;
                let rows = stmt
                    .query_map([limit as i64], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, document, metadata_json)| SearchHit {
                id,
                document,
                metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                distance: 0.0,
                similarity: 1.0,
            })
            .collect())
    }

    /// Purge `daily_news` documents older than `cutoff` (ISO-8601 string
    /// compare works because timestamps are stored zero-padded RFC3339).
    pub async fn purge_daily_news_before(&self, cutoff: &str) -> Result<usize> {
        let cutoff = cutoff.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM vec_daily_news WHERE json_extract(metadata, '$.timestamp') < ?1",
                    [&cutoff],
                )
            })
            .await
    }

    /// Weekly keyword helper: one document per (stock_code, week_start),
    /// storing the keyword list plus a parallel importance vector.
    pub async fn store_weekly_keywords(
        &self,
        stock_code: &str,
        week_start: &str,
        keywords: &[String],
        importance: &[f32],
    ) -> Result<()> {
        let keywords_json = serde_json::to_string(keywords)?;
        let importance_json = serde_json::to_string(importance)?;
        let stock_code = stock_code.to_string();
        let week_start = week_start.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO weekly_keywords (stock_code, week_start, keywords, importance)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(stock_code, week_start) DO UPDATE SET keywords = excluded.keywords, importance = excluded.importance",
                    rusqlite::params![stock_code, week_start, keywords_json, importance_json],
                )
            })
            .await?;
        Ok(())
    }
}

pub struct NullEmbedder;

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // Deterministic stand-in used only where no real embedding model is
        // wired up (e.g. tests): a cheap bag-of-bytes hash projected into a
        // small fixed-width vector.
        let mut v = vec![0f32; 32];
        for (i, b) in text.bytes().enumerate() {
            v[i % 32] += b as f32;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_store() -> (VectorStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(
            dir.path().join("vec.db").to_str().unwrap(),
            3,
            2,
            Duration::from_secs(600),
            Duration::from_secs(1800),
        )
        .unwrap();
        let store = VectorStore::new(pool, Arc::new(NullEmbedder));
        store.ensure_schema().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (store, _dir) = test_store().await;
        store
            .add_document(Collection::DailyNews, "a1", "hello world", serde_json::json!({"stock_code": "005930"}))
            .await
            .unwrap();
        let err = store
            .add_document(Collection::DailyNews, "a1", "different text", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[tokio::test]
    async fn search_similar_orders_by_distance() {
        let (store, _dir) = test_store().await;
        store
            .add_document(Collection::PastEvents, "p1", "samsung earnings beat expectations", serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_document(Collection::PastEvents, "p2", "weather forecast for tomorrow", serde_json::json!({}))
            .await
            .unwrap();

        let hits = store.search_similar("samsung earnings report", Collection::PastEvents, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    /// Anti-correlated embeddings push cosine distance past 1 (into
    /// [1, 2]); similarity must graduate via `2 - distance`, not collapse
    /// straight to 0 the way a naive `(1 - distance).max(0)` would.
    #[test]
    fn similarity_graduates_past_unit_distance() {
        let a = [1.0f32, 0.0];
        let b = [-1.0f32, 0.0];
        let distance = cosine_distance(&a, &b);
        assert!((distance - 2.0).abs() < 1e-6, "opposite unit vectors should have cosine distance 2, got {distance}");

        let similarity = if distance <= 1.0 { 1.0 - distance } else { (2.0 - distance).max(0.0) };
        assert!((similarity - 0.0).abs() < 1e-6);

        // A mildly anti-correlated pair (distance just over 1) must still
        // report a small positive similarity rather than exactly 0.
        let c = [1.0f32, 0.1];
        let d = [-1.0f32, 0.2];
        let distance2 = cosine_distance(&c, &d);
        assert!(distance2 > 1.0, "expected distance > 1 for this pair, got {distance2}");
        let similarity2 = if distance2 <= 1.0 { 1.0 - distance2 } else { (2.0 - distance2).max(0.0) };
        assert!(similarity2 > 0.0, "similarity should graduate above 0 for distance {distance2}, got {similarity2}");
    }
}
