use crate::config::RagSettings;
use crate::error::IngestError;
use crate::models::{Document, Node};
use text_splitter::{ChunkConfig, TextSplitter};
use tokenizers::Tokenizer;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
}

impl From<&RagSettings> for ChunkingConfig {
    fn from(value: &RagSettings) -> Self {
        Self {
            chunk_tokens: value.chunk_size,
            overlap_tokens: value.chunk_overlap,
        }
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Token-bounded splitter that prefers paragraph, then sentence, then word boundaries.
pub struct Chunker {
    splitter: TextSplitter<Tokenizer>,
}

impl Chunker {
    /// Sizes chunks with `tokenizer`, which should be the embedding model's own.
    pub fn new(config: ChunkingConfig, tokenizer: Tokenizer) -> Result<Self, IngestError> {
        if config.chunk_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let chunk_config = ChunkConfig::new(config.chunk_tokens)
            .with_overlap(config.overlap_tokens)
            .map_err(|error| IngestError::InvalidChunkConfig(error.to_string()))?
            .with_sizer(tokenizer);

        Ok(Self {
            splitter: TextSplitter::new(chunk_config),
        })
    }

    /// Splits every document into nodes numbered `1..=N` across the whole call.
    pub fn chunk(&self, documents: &[Document]) -> Vec<Node> {
        let mut nodes = Vec::new();

        for document in documents {
            let page_label = document.metadata.page_number();
            for piece in self.splitter.chunks(&document.text) {
                if piece.trim().is_empty() {
                    continue;
                }

                let mut metadata = document.metadata.clone();
                metadata.page_label = page_label;
                metadata.seq = u32::try_from(nodes.len() + 1).ok();

                nodes.push(Node {
                    text: piece.to_string(),
                    metadata,
                    embedding: None,
                });
            }
        }

        nodes
    }
}
