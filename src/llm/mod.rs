//! C4 — LLM gateway.
//!
//! Shared two-tier cache (Redis, then a local `lru::LruCache`) in front of a
//! provider registry with an ordered fallback chain. A per-cache-key lock
//! (`KeyedLocks`) ensures concurrent callers asking the same question at the
//! same moment pay for one generation, not N.

pub mod providers;

use crate::error::{Error, Result};
use crate::keyed_lock::KeyedLocks;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use providers::{LlmProvider, ModelTag};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const COMPRESS_THRESHOLD_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    News,
    Flow,
    Chart,
    Disclosure,
    Report,
}

impl AnalysisKind {
    pub fn ttl(self) -> Duration {
        match self {
            AnalysisKind::News => Duration::from_secs(1800),
            AnalysisKind::Flow => Duration::from_secs(3600),
            AnalysisKind::Chart => Duration::from_secs(7200),
            AnalysisKind::Disclosure => Duration::from_secs(14_400),
            AnalysisKind::Report => Duration::from_secs(86_400),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CachedResult {
    text: String,
    served_by: String,
}

pub struct LlmGateway {
    providers: Vec<Box<dyn LlmProvider>>,
    fallback_order: Vec<ModelTag>,
    timeout: Duration,
    max_retries: u32,
    locks: KeyedLocks<String>,
    redis: Option<Mutex<redis::aio::ConnectionManager>>,
    local_cache: Mutex<lru::LruCache<String, CachedResult>>,
}

impl LlmGateway {
    pub fn new(
        providers: Vec<Box<dyn LlmProvider>>,
        fallback_order: Vec<String>,
        timeout: Duration,
        max_retries: u32,
        local_cache_max_size: usize,
        redis_conn: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        Self {
            providers,
            fallback_order: fallback_order.iter().map(|s| ModelTag::parse(s)).collect(),
            timeout,
            max_retries,
            locks: KeyedLocks::new(),
            redis: redis_conn.map(Mutex::new),
            local_cache: Mutex::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(local_cache_max_size.max(1)).unwrap(),
            )),
        }
    }

    fn cache_key(model_tag: ModelTag, prompt: &str, max_tokens: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_tag.as_str().as_bytes());
        hasher.update(prompt.as_bytes());
        hasher.update(max_tokens.to_le_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    fn encode(result: &CachedResult) -> Result<Vec<u8>> {
        let raw = rmp_serde::to_vec(result)
            .map_err(|e| Error::Serialization(format!("msgpack encode: {e}")))?;
        if raw.len() > COMPRESS_THRESHOLD_BYTES {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&raw)
                .map_err(|e| Error::Serialization(format!("gzip encode: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::Serialization(format!("gzip finish: {e}")))?;
            let mut framed = vec![1u8];
            framed.extend(compressed);
            Ok(framed)
        } else {
            let mut framed = vec![0u8];
            framed.extend(raw);
            Ok(framed)
        }
    }

    fn decode(bytes: &[u8]) -> Result<CachedResult> {
        let Some((&flag, rest)) = bytes.split_first() else {
            return Err(Error::Serialization("empty cache payload".into()));
        };
        let raw = if flag == 1 {
            let mut decoder = GzDecoder::new(rest);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Serialization(format!("gzip decode: {e}")))?;
            out
        } else {
            rest.to_vec()
        };
        rmp_serde::from_slice(&raw).map_err(|e| Error::Serialization(format!("msgpack decode: {e}")))
    }

    async fn cache_get(&self, key: &str) -> Option<CachedResult> {
        if let Some(hit) = self.local_cache.lock().get(key) {
            return Some(CachedResult { text: hit.text.clone(), served_by: hit.served_by.clone() });
        }
        let Some(redis) = &self.redis else { return None };
        let mut conn = redis.lock().clone();
        let bytes: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .unwrap_or(None);
        bytes.and_then(|b| Self::decode(&b).ok())
    }

    async fn cache_put(&self, key: &str, value: &CachedResult, ttl: Duration) {
        self.local_cache.lock().put(key.to_string(), CachedResult {
            text: value.text.clone(),
            served_by: value.served_by.clone(),
        });

        let Some(redis) = &self.redis else { return };
        let Ok(encoded) = Self::encode(value) else { return };
        let mut conn = redis.lock().clone();
        let result: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs())
            .arg(encoded)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "redis cache write failed, continuing with local cache only");
        }
    }

    /// Resolve a response for `prompt` under the given model tag, consulting
    /// cache first and falling back across providers on failure.
    pub async fn generate(
        &self,
        model_tag: ModelTag,
        kind: AnalysisKind,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let key = Self::cache_key(model_tag, prompt, max_tokens);
        let _guard = self.locks.lock(key.clone()).await;

        if let Some(cached) = self.cache_get(&key).await {
            debug!(cache_key = %key, served_by = %cached.served_by, "llm cache hit");
            return Ok(cached.text);
        }

        let mut order = vec![model_tag];
        order.extend(self.fallback_order.iter().copied().filter(|t| *t != model_tag));

        let mut last_err = None;
        for tag in order {
            let Some(provider) = self.providers.iter().find(|p| p.tag() == tag) else { continue };
            if !provider.is_available() {
                continue;
            }

            let mut attempt = 0u32;
            loop {
                match provider.generate(prompt, max_tokens, self.timeout).await {
                    Ok(text) => {
                        let result = CachedResult { text: text.clone(), served_by: tag.as_str().to_string() };
                        self.cache_put(&key, &result, kind.ttl()).await;
                        return Ok(text);
                    }
                    Err(e) if e.is_retryable() && attempt < self.max_retries => {
                        attempt += 1;
                        warn!(provider = tag.as_str(), attempt, "retrying llm call");
                        tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                    }
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: model_tag.as_str().to_string(),
            message: "no available provider".into(),
        }))
    }
}

pub fn resolve_model_tag(user_model_tag: Option<&str>) -> ModelTag {
    user_model_tag.map(ModelTag::parse).unwrap_or(ModelTag::Hyperclova)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        tag: ModelTag,
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn tag(&self) -> ModelTag {
            self.tag
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(Error::Timeout(Duration::from_secs(0)))
            } else {
                Ok("ok response".to_string())
            }
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_caches() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = FlakyProvider { tag: ModelTag::Hyperclova, calls: calls.clone(), fail_times: 1 };
        let gateway = LlmGateway::new(
            vec![Box::new(provider)],
            vec!["hyperclova".into()],
            Duration::from_secs(5),
            3,
            16,
            None,
        );

        let result = gateway.generate(ModelTag::Hyperclova, AnalysisKind::News, "hello", 64).await.unwrap();
        assert_eq!(result, "ok response");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // second call with identical args should hit the local cache, not the provider
        let cached = gateway.generate(ModelTag::Hyperclova, AnalysisKind::News, "hello", 64).await.unwrap();
        assert_eq!(cached, "ok response");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let a = LlmGateway::cache_key(ModelTag::Chatgpt, "prompt text", 128);
        let b = LlmGateway::cache_key(ModelTag::Chatgpt, "prompt text", 128);
        let c = LlmGateway::cache_key(ModelTag::Chatgpt, "different", 128);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn encode_decode_roundtrip_small_and_large() {
        let small = CachedResult { text: "short".into(), served_by: "hyperclova".into() };
        let encoded = LlmGateway::encode(&small).unwrap();
        let decoded = LlmGateway::decode(&encoded).unwrap();
        assert_eq!(decoded.text, "short");

        let large = CachedResult { text: "x".repeat(4096), served_by: "claude".into() };
        let encoded = LlmGateway::encode(&large).unwrap();
        assert_eq!(encoded[0], 1);
        let decoded = LlmGateway::decode(&encoded).unwrap();
        assert_eq!(decoded.text.len(), 4096);
    }
}
