use crate::embeddings::EmbeddingClient;
use crate::models::RetrievalCandidate;
use crate::traits::{Reranker, VectorIndex};
use crate::SearchError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Two-stage retrieval: oversampled cosine recall, then best-effort cross-encoder rerank.
pub struct Retriever {
    embeddings: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    reranker: Option<Arc<dyn Reranker>>,
    oversample: usize,
}

impl Retriever {
    pub fn new(
        embeddings: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        reranker: Option<Arc<dyn Reranker>>,
        oversample: usize,
    ) -> Self {
        Self {
            embeddings,
            index,
            reranker,
            oversample: oversample.max(1),
        }
    }

    /// Nearest neighbours scored `1 - cosine distance`, closest first.
    pub async fn recall(
        &self,
        question: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        let vector = self.embeddings.embed_query(question).await?;
        let hits = self.index.query(&vector, limit).await?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievalCandidate {
                text: hit.record.text,
                meta: hit.record.metadata,
                score: 1.0 - hit.distance,
            })
            .collect())
    }

    pub async fn query(
        &self,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .recall(question, top_k.saturating_mul(self.oversample))
            .await?;
        debug!(candidates = candidates.len(), top_k, "recall finished");

        Ok(self.rerank(question, candidates, top_k).await)
    }

    async fn rerank(
        &self,
        question: &str,
        mut candidates: Vec<RetrievalCandidate>,
        top_k: usize,
    ) -> Vec<RetrievalCandidate> {
        let Some(reranker) = &self.reranker else {
            candidates.truncate(top_k);
            return candidates;
        };
        if candidates.is_empty() {
            return candidates;
        }

        let texts: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.text.clone())
            .collect();

        // every candidate gets a rerank score so no similarity score survives into the sort
        match reranker.rerank(question, &texts, candidates.len()).await {
            Ok(scores) => {
                for score in scores {
                    if let Some(candidate) = candidates.get_mut(score.index) {
                        candidate.score = score.relevance_score;
                    }
                }
                candidates.sort_by(|left, right| right.score.total_cmp(&left.score));
            }
            Err(error) => {
                warn!(%error, "rerank failed, keeping similarity order");
            }
        }

        candidates.truncate(top_k);
        candidates
    }
}
