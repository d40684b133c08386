//! News ingestion path (spec.md §4.9 "News path").

use crate::db::Pool;
use crate::dedup::DedupFilter;
use crate::error::Result;
use crate::llm::providers::ModelTag;
use crate::llm::{AnalysisKind, LlmGateway};
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use crate::vector::{Collection, VectorStore};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RawNewsItem {
    pub title: String,
    pub content: String,
    pub url: String,
    pub source: String,
    pub publish_time: chrono::DateTime<chrono::Utc>,
}

/// The external news-feed endpoint the pipeline fetches from. A real
/// implementation wraps whatever wire service the stock belongs to;
/// injected here so the pipeline's own logic is independently testable.
#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_latest(&self, stock_code: &str) -> Result<Vec<RawNewsItem>>;
}

#[derive(Debug, Deserialize)]
struct ScoringResponse {
    impact_score: f64,
    reasoning: String,
    #[serde(default)]
    keywords: Vec<String>,
}

pub struct NewsPipeline {
    pool: Arc<Pool>,
    dedup: Arc<DedupFilter>,
    vector: Arc<VectorStore>,
    llm: Arc<LlmGateway>,
    dispatcher: Arc<Dispatcher>,
    source: Arc<dyn NewsSource>,
    high_impact_routing_threshold: f64,
}

impl NewsPipeline {
    pub fn new(
        pool: Arc<Pool>,
        dedup: Arc<DedupFilter>,
        vector: Arc<VectorStore>,
        llm: Arc<LlmGateway>,
        dispatcher: Arc<Dispatcher>,
        source: Arc<dyn NewsSource>,
        high_impact_routing_threshold: f64,
    ) -> Self {
        Self { pool, dedup, vector, llm, dispatcher, source, high_impact_routing_threshold }
    }

    pub fn vector(&self) -> &Arc<VectorStore> {
        &self.vector
    }

    fn build_prompt(item: &RawNewsItem, stock_code: &str, past_context: &[String]) -> String {
        let context = if past_context.is_empty() {
            "No similar historical events on record.".to_string()
        } else {
            past_context.join("\n- ")
        };
        format!(
            "Stock: {stock_code}\nHeadline: {}\nBody: {}\n\nSimilar past events:\n- {context}\n\n\
             Respond as JSON: {{\"impact_score\": <0..1>, \"reasoning\": <string>, \"keywords\": [<string>]}}",
            item.title, item.content,
        )
    }

    fn parse_response(raw: &str) -> ScoringResponse {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "failed to parse llm scoring response, using neutral fallback");
            ScoringResponse { impact_score: 0.5, reasoning: "unscored: malformed model response".into(), keywords: Vec::new() }
        })
    }

    /// Process one stock's latest items. Never propagates a single item's
    /// failure to the caller — a bad item is logged and skipped.
    pub async fn process_stock(&self, stock_code: &str, stock_name: &str, model_tag_hint: Option<&str>) -> Result<usize> {
        let items = self.source.fetch_latest(stock_code).await?;
        let model_tag = model_tag_hint.map(ModelTag::parse).unwrap_or(ModelTag::Hyperclova);
        let mut processed = 0usize;

        for item in items {
            let id = Uuid::new_v4().to_string();
            let check = self.dedup.check_and_register(&id, stock_code, &item.title, &item.content, &item.url).await;
            if check.is_duplicate {
                continue;
            }

            let query_text = format!("{} {}", item.title, item.content);
            let past_context: Vec<String> = match self.vector.search_similar(&query_text, Collection::PastEvents, 3).await {
                Ok(hits) => hits.into_iter().map(|h| h.document).collect(),
                Err(e) => {
                    warn!(error = %e, "past-events lookup failed, continuing without historical context");
                    Vec::new()
                }
            };

            let prompt = Self::build_prompt(&item, stock_code, &past_context);
            let response = match self.llm.generate(model_tag, AnalysisKind::News, &prompt, 512).await {
                Ok(text) => Self::parse_response(&text),
                Err(e) => {
                    warn!(error = %e, id, "llm scoring failed, skipping item");
                    continue;
                }
            };

            if let Err(e) = self.persist(&id, &item, stock_code, &response).await {
                warn!(error = %e, id, "failed to persist news item, continuing");
                continue;
            }

            let collection = if response.impact_score >= self.high_impact_routing_threshold {
                Collection::HighImpactNews
            } else {
                Collection::DailyNews
            };
            let metadata = serde_json::json!({
                "stock_code": stock_code,
                "timestamp": item.publish_time.to_rfc3339(),
                "impact_score": response.impact_score,
            });
            if let Err(e) = self.vector.add_document(collection, &id, &query_text, metadata).await {
                warn!(error = %e, id, "failed to index news item in vector store");
            }

            let payload = serde_json::json!({
                "title": item.title,
                "impact_score": response.impact_score,
                "reasoning": response.reasoning,
                "url": item.url,
                "keywords": response.keywords,
            });
            let event = AlertEvent { kind: EventKind::News, stock_code: stock_code.to_string(), stock_name: stock_name.to_string(), payload, target_user_id: None };
            if let Err(e) = self.dispatcher.dispatch(&event).await {
                warn!(error = %e, id, "dispatch failed for news item");
            }

            processed += 1;
        }

        Ok(processed)
    }

    async fn persist(&self, id: &str, item: &RawNewsItem, stock_code: &str, response: &ScoringResponse) -> Result<()> {
        let (id, title, content, url, source, publish_time, stock_code, impact_score, reasoning) = (
            id.to_string(),
            item.title.clone(),
            item.content.clone(),
            item.url.clone(),
            item.source.clone(),
            item.publish_time.to_rfc3339(),
            stock_code.to_string(),
            response.impact_score,
            response.reasoning.clone(),
        );
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO news_item (id, title, content_excerpt, url, source, publish_time, stock_code, impact_score, reasoning)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![id, title, content, url, source, publish_time, stock_code, impact_score, reasoning],
                )
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::LlmProvider;
    use crate::user_config::{ServiceFlags, StockEntry, UserConfigManager};
    use crate::vector::NullEmbedder;
    use std::time::Duration;

    struct FixedSource {
        items: Vec<RawNewsItem>,
    }

    #[async_trait]
    impl NewsSource for FixedSource {
        async fn fetch_latest(&self, _stock_code: &str) -> Result<Vec<RawNewsItem>> {
            Ok(self.items.clone())
        }
    }

    struct FixedProvider;

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn tag(&self) -> ModelTag {
            ModelTag::Hyperclova
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<String> {
            Ok(r#"{"impact_score": 0.9, "reasoning": "strong earnings beat", "keywords": ["earnings"]}"#.to_string())
        }
    }

    async fn setup(items: Vec<RawNewsItem>) -> (NewsPipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("news.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let vector = Arc::new(VectorStore::new(pool.clone(), Arc::new(NullEmbedder)));
        vector.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.5, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.5).await.unwrap();
        user_config.update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }]).await.unwrap();
        user_config.update_services("u1", &ServiceFlags { news: true, ..Default::default() }).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, Arc::new(crate::notify::NullTransport), vec![], Duration::from_secs(86_400)));
        let dedup = Arc::new(DedupFilter::new(pool.clone(), 3, 48, None));
        let llm = Arc::new(LlmGateway::new(vec![Box::new(FixedProvider)], vec!["hyperclova".into()], Duration::from_secs(5), 1, 16, None));
        let source = Arc::new(FixedSource { items });

        let pipeline = NewsPipeline::new(pool, dedup, vector, llm, dispatcher, source, 0.5);
        (pipeline, dir)
    }

    #[tokio::test]
    async fn high_impact_item_routes_and_dispatches() {
        let (pipeline, _dir) = setup(vec![RawNewsItem {
            title: "Samsung beats earnings estimates".into(),
            content: "quarterly profit record".into(),
            url: "https://example.com/a".into(),
            source: "reuters".into(),
            publish_time: chrono::Utc::now(),
        }])
        .await;

        let n = pipeline.process_stock("005930", "삼성전자", None).await.unwrap();
        assert_eq!(n, 1);

        let hits = pipeline.vector().get_all_documents(Collection::HighImpactNews, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_item_is_skipped() {
        let item = RawNewsItem {
            title: "Samsung beats earnings estimates".into(),
            content: "quarterly profit record".into(),
            url: "https://example.com/a".into(),
            source: "reuters".into(),
            publish_time: chrono::Utc::now(),
        };
        let (pipeline, _dir) = setup(vec![item.clone(), item]).await;
        let n = pipeline.process_stock("005930", "삼성전자", None).await.unwrap();
        assert_eq!(n, 1);
    }
}
