//! Disclosure (regulatory filing) ingestion path (spec.md §4.9 "Disclosure path").

use crate::db::Pool;
use crate::error::Result;
use crate::llm::providers::ModelTag;
use crate::llm::{AnalysisKind, LlmGateway};
use crate::notify::{AlertEvent, Dispatcher, EventKind};
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RawDisclosure {
    pub rcept_no: String,
    pub corp_code: String,
    pub report_name: String,
    pub filer: String,
    pub receipt_date: chrono::NaiveDate,
    pub raw_note: Option<String>,
}

#[async_trait]
pub trait DisclosureSource: Send + Sync {
    async fn fetch_latest(&self, stock_code: &str) -> Result<Vec<RawDisclosure>>;
}

#[derive(Debug, Deserialize)]
struct DisclosureAnalysis {
    impact_score: f64,
    sentiment_label: String,
    sentiment_reason: String,
    expected_impact_direction: String,
    horizon_tag: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    summary: String,
}

impl Default for DisclosureAnalysis {
    fn default() -> Self {
        Self {
            impact_score: 0.5,
            sentiment_label: "neutral".into(),
            sentiment_reason: "unscored: malformed model response".into(),
            expected_impact_direction: "unknown".into(),
            horizon_tag: "unknown".into(),
            keywords: Vec::new(),
            summary: String::new(),
        }
    }
}

pub struct DisclosurePipeline {
    pool: Arc<Pool>,
    llm: Arc<LlmGateway>,
    dispatcher: Arc<Dispatcher>,
    source: Arc<dyn DisclosureSource>,
}

impl DisclosurePipeline {
    pub fn new(pool: Arc<Pool>, llm: Arc<LlmGateway>, dispatcher: Arc<Dispatcher>, source: Arc<dyn DisclosureSource>) -> Self {
        Self { pool, llm, dispatcher, source }
    }

    fn build_prompt(item: &RawDisclosure, stock_code: &str) -> String {
        format!(
            "Stock: {stock_code}\nFiling: {}\nFiler: {}\nNote: {}\n\n\
             Respond as JSON: {{\"impact_score\": <0..1>, \"sentiment_label\": <string>, \
             \"sentiment_reason\": <string>, \"expected_impact_direction\": <\"up\"|\"down\"|\"neutral\">, \
             \"horizon_tag\": <\"short_term\"|\"mid_term\"|\"long_term\">, \"keywords\": [<string>], \
             \"summary\": <string, 1-2 sentences>}}",
            item.report_name,
            item.filer,
            item.raw_note.as_deref().unwrap_or("(none)"),
        )
    }

    async fn already_seen(&self, rcept_no: &str) -> Result<bool> {
        let rcept_no = rcept_no.to_string();
        let exists: Option<i64> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row("SELECT 1 FROM disclosure_item WHERE rcept_no = ?1", [&rcept_no], |r| r.get(0)).optional()
            })
            .await?;
        Ok(exists.is_some())
    }

    /// Process one stock's latest filings. A malformed LLM response or a
    /// single persistence failure is logged and skipped, not propagated.
    pub async fn process_stock(&self, stock_code: &str, stock_name: &str, model_tag_hint: Option<&str>) -> Result<usize> {
        let filings = self.source.fetch_latest(stock_code).await?;
        let model_tag = model_tag_hint.map(ModelTag::parse).unwrap_or(ModelTag::Hyperclova);
        let mut processed = 0usize;

        for filing in filings {
            match self.already_seen(&filing.rcept_no).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, rcept_no = %filing.rcept_no, "duplicate check failed, skipping filing");
                    continue;
                }
            }

            let prompt = Self::build_prompt(&filing, stock_code);
            let analysis = match self.llm.generate(model_tag, AnalysisKind::Disclosure, &prompt, 512).await {
                Ok(text) => serde_json::from_str::<DisclosureAnalysis>(&text).unwrap_or_else(|e| {
                    warn!(error = %e, rcept_no = %filing.rcept_no, "failed to parse disclosure analysis, using neutral fallback");
                    DisclosureAnalysis::default()
                }),
                Err(e) => {
                    warn!(error = %e, rcept_no = %filing.rcept_no, "llm analysis failed, skipping filing");
                    continue;
                }
            };

            if let Err(e) = self.persist(stock_code, &filing, &analysis).await {
                warn!(error = %e, rcept_no = %filing.rcept_no, "failed to persist disclosure item, continuing");
                continue;
            }

            let payload = serde_json::json!({
                "report_name": filing.report_name,
                "impact_score": analysis.impact_score,
                "sentiment_label": analysis.sentiment_label,
                "sentiment_reason": analysis.sentiment_reason,
                "expected_impact_direction": analysis.expected_impact_direction,
                "horizon_tag": analysis.horizon_tag,
                "keywords": analysis.keywords,
                "summary": analysis.summary,
            });
            let event = AlertEvent { kind: EventKind::Disclosure, stock_code: stock_code.to_string(), stock_name: stock_name.to_string(), payload, target_user_id: None };
            if let Err(e) = self.dispatcher.dispatch(&event).await {
                warn!(error = %e, rcept_no = %filing.rcept_no, "dispatch failed for disclosure item");
            }

            processed += 1;
        }

        Ok(processed)
    }

    async fn persist(&self, stock_code: &str, filing: &RawDisclosure, analysis: &DisclosureAnalysis) -> Result<()> {
        let (rcept_no, corp_code, stock_code, report_name, filer, receipt_date, raw_note) = (
            filing.rcept_no.clone(),
            filing.corp_code.clone(),
            stock_code.to_string(),
            filing.report_name.clone(),
            filing.filer.clone(),
            filing.receipt_date.format("%Y-%m-%d").to_string(),
            filing.raw_note.clone(),
        );
        let keywords_json = serde_json::to_string(&analysis.keywords)?;
        let (impact_score, sentiment_label, sentiment_reason, expected_impact_direction, horizon_tag, summary) = (
            analysis.impact_score,
            analysis.sentiment_label.clone(),
            analysis.sentiment_reason.clone(),
            analysis.expected_impact_direction.clone(),
            analysis.horizon_tag.clone(),
            analysis.summary.clone(),
        );

        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO disclosure_item
                        (rcept_no, corp_code, stock_code, report_name, filer, receipt_date, raw_note,
                         impact_score, sentiment_label, sentiment_reason, expected_impact_direction, horizon_tag, keywords, summary)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                    rusqlite::params![
                        rcept_no, corp_code, stock_code, report_name, filer, receipt_date, raw_note,
                        impact_score, sentiment_label, sentiment_reason, expected_impact_direction, horizon_tag, keywords_json, summary,
                    ],
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
    use std::time::Duration;

    struct FixedSource {
        filings: Vec<RawDisclosure>,
    }

    #[async_trait]
    impl DisclosureSource for FixedSource {
        async fn fetch_latest(&self, _stock_code: &str) -> Result<Vec<RawDisclosure>> {
            Ok(self.filings.clone())
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
            Ok(r#"{"impact_score": 0.8, "sentiment_label": "positive", "sentiment_reason": "buyback announced",
                   "expected_impact_direction": "up", "horizon_tag": "short_term", "keywords": ["buyback"],
                   "summary": "Samsung announced a share buyback program."}"#.to_string())
        }
    }

    async fn setup(filings: Vec<RawDisclosure>) -> (DisclosurePipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("disclosure.db").to_str().unwrap(), 3, 2, Duration::from_secs(600), Duration::from_secs(1800)).unwrap();
        pool.ensure_schema().await.unwrap();

        let user_config = Arc::new(UserConfigManager::new(pool.clone(), Duration::from_secs(300), 0.7, 0.5, "hyperclova".into()));
        user_config.upsert_profile("u1", "tester", "010", 0.7, 0.5).await.unwrap();
        user_config.update_stocks("u1", &[StockEntry { stock_code: "005930".into(), stock_name: "삼성전자".into(), enabled: true }]).await.unwrap();
        user_config.update_services("u1", &ServiceFlags { disclosure: true, ..Default::default() }).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), user_config, Arc::new(crate::notify::NullTransport), vec![], Duration::from_secs(86_400)));
        let llm = Arc::new(LlmGateway::new(vec![Box::new(FixedProvider)], vec!["hyperclova".into()], Duration::from_secs(5), 1, 16, None));
        let source = Arc::new(FixedSource { filings });

        let pipeline = DisclosurePipeline::new(pool, llm, dispatcher, source);
        (pipeline, dir)
    }

    #[tokio::test]
    async fn new_filing_is_persisted_and_dispatched() {
        let (pipeline, _dir) = setup(vec![RawDisclosure {
            rcept_no: "20240101000001".into(),
            corp_code: "00126380".into(),
            report_name: "Share buyback decision".into(),
            filer: "Samsung Electronics".into(),
            receipt_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            raw_note: None,
        }])
        .await;

        let n = pipeline.process_stock("005930", "삼성전자", None).await.unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn same_rcept_no_is_skipped_on_replay() {
        let filing = RawDisclosure {
            rcept_no: "20240101000001".into(),
            corp_code: "00126380".into(),
            report_name: "Share buyback decision".into(),
            filer: "Samsung Electronics".into(),
            receipt_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            raw_note: None,
        };
        let (pipeline, _dir) = setup(vec![filing.clone()]).await;
        pipeline.process_stock("005930", "삼성전자", None).await.unwrap();

        let pipeline2 = DisclosurePipeline::new(
            pipeline.pool.clone(),
            pipeline.llm.clone(),
            pipeline.dispatcher.clone(),
            Arc::new(FixedSource { filings: vec![filing] }),
        );
        let n = pipeline2.process_stock("005930", "삼성전자", None).await.unwrap();
        assert_eq!(n, 0);
    }
}
