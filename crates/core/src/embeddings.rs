use crate::config::RagSettings;
use crate::error::ServiceError;
use crate::models::Node;
use crate::tokenizer::truncate_to_tokens;
use crate::traits::Embedder;
use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenizers::Tokenizer;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Deterministic character-trigram embedder for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        "hashed-trigram"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::backend(
                "embeddings",
                format!("{status}: {body}"),
            ));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(ServiceError::backend(
                "embeddings",
                format!(
                    "returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            ));
        }
        parsed.data.sort_by_key(|entry| entry.index);

        Ok(parsed
            .data
            .into_iter()
            .map(|entry| entry.embedding)
            .collect())
    }
}

/// Truncating, batching, retrying front for an [`Embedder`], with a bounded query cache.
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    tokenizer: Tokenizer,
    max_tokens: usize,
    batch_size: usize,
    batch_delay: Duration,
    max_attempts: usize,
    initial_backoff_ms: u64,
    normalize: bool,
    query_cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl EmbeddingClient {
    /// `tokenizer` must match the embedding model so truncation lands on its token boundaries.
    pub fn new(embedder: Arc<dyn Embedder>, tokenizer: Tokenizer, settings: &RagSettings) -> Self {
        Self {
            embedder,
            tokenizer,
            max_tokens: settings.embed_max_tokens,
            batch_size: settings.embed_batch_size(),
            batch_delay: settings.embed_batch_delay(),
            max_attempts: settings.embed_max_attempts.max(1),
            initial_backoff_ms: settings.embed_initial_backoff_ms,
            normalize: settings.normalize_embeddings,
            query_cache: NonZeroUsize::new(settings.query_cache_capacity)
                .map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn model(&self) -> &str {
        self.embedder.model()
    }

    pub fn truncate(&self, text: &str) -> Result<String, ServiceError> {
        truncate_to_tokens(&self.tokenizer, text, self.max_tokens)
    }

    /// Truncates node texts in place and attaches one vector per node.
    pub async fn embed_nodes(&self, nodes: &mut [Node]) -> Result<(), ServiceError> {
        if nodes.is_empty() {
            return Ok(());
        }

        for node in nodes.iter_mut() {
            node.text = self.truncate(&node.text)?;
        }

        let batch_count = nodes.len().div_ceil(self.batch_size);
        for (batch_index, batch) in nodes.chunks_mut(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|node| node.text.clone()).collect();
            let vectors = self.embed_with_retry(&texts).await?;

            for (node, vector) in batch.iter_mut().zip(vectors) {
                node.embedding = Some(vector);
            }

            if batch_index + 1 < batch_count && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        info!(
            nodes = nodes.len(),
            batches = batch_count,
            model = self.model(),
            "embedded nodes"
        );
        Ok(())
    }

    /// Embeds a single query, reusing a cached vector for identical text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let truncated = self.truncate(text)?;

        if let Some(hit) = self.cached(&truncated) {
            debug!("query embedding cache hit");
            return Ok(hit);
        }

        let vector = self
            .embed_with_retry(std::slice::from_ref(&truncated))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::backend("embeddings", "no vector returned for query"))?;

        if let Some(cache) = &self.query_cache {
            if let Ok(mut guard) = cache.lock() {
                guard.put(truncated, vector.clone());
            }
        }

        Ok(vector)
    }

    fn cached(&self, text: &str) -> Option<Vec<f32>> {
        let cache = self.query_cache.as_ref()?;
        let mut guard = cache.lock().ok()?;
        guard.get(text).cloned()
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let attempts = AtomicUsize::new(0);
        let attempts_ref = &attempts;
        let embedder = &self.embedder;

        // delays of initial, 2*initial, 4*initial, ...
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.initial_backoff_ms / 2)
            .take(self.max_attempts - 1);

        let result = Retry::start(strategy, move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            embedder.embed_batch(texts).await.map_err(|error| {
                warn!(attempt, %error, "embedding request failed");
                error
            })
        })
        .await;

        let mut vectors = match result {
            Ok(vectors) => vectors,
            Err(last) => {
                return Err(ServiceError::RetriesExhausted {
                    backend: "embeddings".to_string(),
                    attempts: attempts.load(Ordering::SeqCst),
                    last: Box::new(last),
                })
            }
        };

        if vectors.len() != texts.len() {
            return Err(ServiceError::backend(
                "embeddings",
                format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }

        if self.normalize {
            for vector in vectors.iter_mut() {
                l2_normalize(vector);
            }
        }

        Ok(vectors)
    }
}
