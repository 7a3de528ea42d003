use crate::chunking::{Chunker, ChunkingConfig};
use crate::config::{RagSettings, ServiceConfig, EMBEDDING_KEY_ENV, GENERATION_KEY_ENV};
use crate::embeddings::{EmbeddingClient, RemoteEmbedder};
use crate::error::{ConfigError, IngestError};
use crate::extractor::{CloudParser, LopdfExtractor, PageAwareExtractor, PageMatchSettings};
use crate::generator::{Generator, RemoteChatModel};
use crate::models::{
    AnswerOutcome, Citation, IngestReport, Metadata, PageRef, QueryRequest, QueryResponse,
    RetrievalCandidate, StoreStats,
};
use crate::rerank::RemoteReranker;
use crate::retriever::Retriever;
use crate::safety::{apology_answer, insufficient_answer, refusal_answer, SafetyFilter, DISCLAIMER};
use crate::store::{StoreSettings, VectorStore};
use crate::stores::{LocalStore, QdrantStore};
use crate::tokenizer::load_model_tokenizer;
use crate::traits::{ChatModel, DocumentExtractor, DocumentParser, Embedder, Reranker, VectorIndex};
use crate::SearchError;
use chrono::Utc;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokenizers::Tokenizer;
use tracing::{error, info};

/// The collaborators a pipeline is assembled from.
pub struct PipelineParts {
    pub extractor: Arc<dyn DocumentExtractor>,
    pub embedder: Arc<dyn Embedder>,
    /// Tokenizer of the embedding model, shared by chunk sizing and truncation.
    pub tokenizer: Tokenizer,
    pub index: Arc<dyn VectorIndex>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub chat: Arc<dyn ChatModel>,
    pub collection: String,
}

/// Ingestion and question answering over one vector collection.
pub struct RagPipeline {
    settings: RagSettings,
    collection: String,
    extractor: Arc<dyn DocumentExtractor>,
    chunker: Chunker,
    embeddings: Arc<EmbeddingClient>,
    store: VectorStore,
    retriever: Retriever,
    safety: SafetyFilter,
    generator: Generator,
}

impl RagPipeline {
    pub fn new(settings: RagSettings, parts: PipelineParts) -> Result<Self, IngestError> {
        settings.validate()?;

        let embeddings = Arc::new(EmbeddingClient::new(
            parts.embedder,
            parts.tokenizer.clone(),
            &settings,
        ));
        let retriever = Retriever::new(
            Arc::clone(&embeddings),
            Arc::clone(&parts.index),
            parts.reranker,
            settings.oversample,
        );

        Ok(Self {
            chunker: Chunker::new(ChunkingConfig::from(&settings), parts.tokenizer)?,
            store: VectorStore::new(parts.index, StoreSettings::from(&settings)),
            safety: SafetyFilter::new(&settings)?,
            generator: Generator::new(parts.chat, &settings),
            extractor: parts.extractor,
            collection: parts.collection,
            embeddings,
            retriever,
            settings,
        })
    }

    /// Builds remote clients and the configured store after checking credentials.
    pub async fn from_config(
        settings: RagSettings,
        services: &ServiceConfig,
    ) -> Result<Self, IngestError> {
        services.validate()?;
        let embedding_key = services
            .embedding_key()
            .ok_or_else(|| ConfigError::Missing(EMBEDDING_KEY_ENV.to_string()))?;
        let generation_key = services
            .generation_key()
            .ok_or_else(|| ConfigError::Missing(GENERATION_KEY_ENV.to_string()))?;

        let parser: Option<Arc<dyn DocumentParser>> = match services.parsing_key() {
            Some(key) => Some(Arc::new(CloudParser::new(
                services.parsing_base_url.as_str(),
                key,
                secs(settings.parse_timeout_secs),
            )?)),
            None => {
                info!("no parsing credential, documents use local extraction");
                None
            }
        };
        let extractor = PageAwareExtractor::new(
            parser,
            Arc::new(LopdfExtractor),
            PageMatchSettings::from(&settings),
        );

        let tokenizer = load_model_tokenizer(
            &services.embedding_model,
            services.embedding_tokenizer.as_deref(),
        )
        .await?;
        let embedder = RemoteEmbedder::new(
            &services.inference_base_url,
            embedding_key,
            services.embedding_model.as_str(),
            secs(settings.embed_timeout_secs),
        )?;
        let reranker: Option<Arc<dyn Reranker>> = match services.rerank_key() {
            Some(key) => Some(Arc::new(RemoteReranker::new(
                &services.inference_base_url,
                key,
                services.rerank_model.as_str(),
                secs(settings.rerank_timeout_secs),
            )?)),
            None => None,
        };
        let chat = RemoteChatModel::new(
            &services.inference_base_url,
            generation_key,
            services.chat_model.as_str(),
            secs(settings.generation_timeout_secs),
        )?;

        let index: Arc<dyn VectorIndex> = match services.qdrant_url.as_deref() {
            Some(url) => Arc::new(QdrantStore::new(url, services.collection.as_str())),
            None => Arc::new(LocalStore::open(&services.store_path, &services.collection).await?),
        };

        Self::new(
            settings,
            PipelineParts {
                extractor: Arc::new(extractor),
                embedder: Arc::new(embedder),
                tokenizer,
                index,
                reranker,
                chat: Arc::new(chat),
                collection: services.collection.clone(),
            },
        )
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    /// Extract, chunk, embed and store one document.
    pub async fn ingest(&self, path: &Path) -> Result<IngestReport, IngestError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

        let documents = self.extractor.extract(path).await?;
        let mut nodes = self.chunker.chunk(&documents);
        self.embeddings.embed_nodes(&mut nodes).await?;
        let stored_vectors = self.store.upsert_nodes(&mut nodes).await?;
        let collection_count = self.store.count().await?;

        info!(
            file = %filename,
            docs = documents.len(),
            nodes = nodes.len(),
            stored_vectors,
            collection_count,
            "ingestion finished"
        );

        Ok(IngestReport {
            filename,
            docs_count: documents.len(),
            nodes_count: nodes.len(),
            stored_vectors,
            collection_count,
            ingested_at: Utc::now(),
        })
    }

    /// Answers a question; every failure resolves to a standardized answer.
    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        let question = request.question.trim();
        if question.is_empty() {
            return bare(
                format!("Question must not be empty. {DISCLAIMER}"),
                AnswerOutcome::Refused,
            );
        }
        if self.safety.is_banned_intent(question) {
            info!("banned intent, refusing before retrieval");
            return bare(refusal_answer(), AnswerOutcome::Refused);
        }

        let redacted = self.safety.redact_pii(question);
        let top_k = match request.top_k {
            0 => self.settings.default_top_k,
            requested => requested,
        };

        let candidates = match self.retriever.query(&redacted, top_k).await {
            Ok(candidates) => candidates,
            Err(failure) => {
                error!(error = %failure, "retrieval failed");
                return bare(apology_answer(), AnswerOutcome::RetrievalFailed);
            }
        };

        let contexts = self.safety.filter(candidates);
        if !self.safety.passes_gate(&contexts) {
            info!(contexts = contexts.len(), "no context above the relevance gate");
            return respond(
                insufficient_answer(),
                AnswerOutcome::InsufficientContext,
                contexts,
                request.include_context,
            );
        }

        let generated = self.generator.answer(&redacted, &contexts).await;
        let outcome = if generated.failed {
            AnswerOutcome::GenerationFailed
        } else {
            AnswerOutcome::Answered
        };
        respond(generated.text, outcome, contexts, request.include_context)
    }

    pub async fn stats(&self) -> Result<StoreStats, SearchError> {
        Ok(StoreStats {
            store: self.store.index().describe(),
            collection: self.collection.clone(),
            vector_count: self.store.count().await?,
        })
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn bare(answer: String, outcome: AnswerOutcome) -> QueryResponse {
    QueryResponse {
        answer,
        outcome,
        contexts: None,
        citations: None,
    }
}

fn respond(
    answer: String,
    outcome: AnswerOutcome,
    contexts: Vec<RetrievalCandidate>,
    include_context: bool,
) -> QueryResponse {
    if !include_context {
        return bare(answer, outcome);
    }

    QueryResponse {
        answer,
        outcome,
        citations: Some(citations(&contexts)),
        contexts: Some(contexts),
    }
}

pub fn citations(contexts: &[RetrievalCandidate]) -> Vec<Citation> {
    contexts
        .iter()
        .enumerate()
        .map(|(index, context)| Citation {
            id: index + 1,
            page: Some(citation_page(&context.meta, index + 1)),
            section: context.meta.section(),
        })
        .collect()
}

/// Page label, then a textual page key, then chunk sequence, then position.
fn citation_page(meta: &Metadata, position: usize) -> PageRef {
    if let Some(page) = meta.page_number() {
        return PageRef::Number(page);
    }

    let label = ["page", "page_number"].iter().find_map(|key| {
        meta.extra
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    });
    if let Some(label) = label {
        return PageRef::Label(label.to_string());
    }

    PageRef::Number(
        meta.seq
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX)),
    )
}
