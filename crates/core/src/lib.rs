pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod retriever;
pub mod safety;
pub mod store;
pub mod stores;
pub mod tokenizer;
pub mod traits;

pub use chunking::{normalize_whitespace, Chunker, ChunkingConfig};
pub use config::{RagSettings, ServiceConfig};
pub use embeddings::{
    EmbeddingClient, HashingEmbedder, RemoteEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, IngestError, SearchError, ServiceError};
pub use extractor::{CloudParser, PageAwareExtractor, PageText, PdfExtractor};
pub use generator::{Generator, RemoteChatModel};
pub use ingest::{discover_pdf_files, ingest_folder, FolderReport, SkippedPdf};
pub use models::{
    AnswerOutcome, Citation, Document, IngestReport, Metadata, Node, PageRef, QueryRequest,
    QueryResponse, RetrievalCandidate, StoreStats,
};
pub use pipeline::{PipelineParts, RagPipeline};
pub use rerank::RemoteReranker;
pub use retriever::Retriever;
pub use safety::{SafetyFilter, DISCLAIMER};
pub use store::VectorStore;
pub use stores::{LocalStore, QdrantStore};
pub use tokenizer::{load_model_tokenizer, truncate_to_tokens, word_tokenizer};
pub use traits::{ChatModel, DocumentExtractor, DocumentParser, Embedder, Reranker, VectorIndex};
