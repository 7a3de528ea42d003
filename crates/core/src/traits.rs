use crate::error::{IngestError, SearchError, ServiceError};
use crate::models::{Document, ScoredRecord, StoredRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Produces page-level documents from a file on disk.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<Vec<Document>, IngestError>;
}

/// Hosted document parsing; any failure is treated as "no output" by callers.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<Vec<Document>, ServiceError>;
}

/// One vector per input text, order-preserving.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankScore>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<String, ServiceError>;
}

/// Similarity-indexed record store scored by cosine distance.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn describe(&self) -> String;

    /// Insert or replace records by id.
    async fn upsert(&self, records: &[StoredRecord]) -> Result<(), SearchError>;

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, SearchError>;

    /// Nearest `k` records with their cosine distance, closest first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>, SearchError>;

    async fn count(&self) -> Result<usize, SearchError>;
}
