use crate::error::{ConfigError, ServiceError};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokenizers::Tokenizer;
use tracing::info;

/// BERT-style normalization and pre-tokenization with an empty WordPiece vocabulary,
/// so every word and punctuation mark counts as a single token.
const WORD_TOKENIZER_JSON: &str = r###"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": {
    "type": "BertNormalizer",
    "clean_text": true,
    "handle_chinese_chars": true,
    "strip_accents": null,
    "lowercase": true
  },
  "pre_tokenizer": { "type": "BertPreTokenizer" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordPiece",
    "unk_token": "[UNK]",
    "continuing_subword_prefix": "##",
    "max_input_chars_per_word": 100,
    "vocab": { "[UNK]": 0 }
  }
}"###;

/// Vocabulary-free tokenizer for offline runs with the hashing embedder.
pub fn word_tokenizer() -> Result<Tokenizer, ConfigError> {
    static TOKENIZER: OnceLock<Result<Tokenizer, String>> = OnceLock::new();

    match TOKENIZER.get_or_init(|| {
        Tokenizer::from_bytes(WORD_TOKENIZER_JSON)
            .map_err(|error| format!("failed to initialize word tokenizer: {error}"))
    }) {
        Ok(tokenizer) => Ok(tokenizer.clone()),
        Err(error) => Err(ConfigError::Invalid {
            key: "tokenizer".to_string(),
            details: error.clone(),
        }),
    }
}

/// Loads the embedding model's tokenizer from `file`, or from the Hugging Face hub by model id.
pub async fn load_model_tokenizer(
    model: &str,
    file: Option<&Path>,
) -> Result<Tokenizer, ConfigError> {
    let model = model.to_string();
    let file: Option<PathBuf> = file.map(Path::to_path_buf);

    let loaded = tokio::task::spawn_blocking(move || {
        let result = match &file {
            Some(path) => Tokenizer::from_file(path),
            None => Tokenizer::from_pretrained(&model, None),
        };
        result.map_err(|error| ConfigError::Invalid {
            key: "embedding_model".to_string(),
            details: format!("failed to load tokenizer for {model}: {error}"),
        })
    })
    .await
    .map_err(|error| ConfigError::Invalid {
        key: "embedding_model".to_string(),
        details: format!("tokenizer loader panicked: {error}"),
    })??;

    info!(vocab = loaded.get_vocab_size(true), "loaded embedding tokenizer");
    Ok(loaded)
}

/// Cuts `text` after its `max_tokens`-th model token; text within budget is returned unchanged.
pub fn truncate_to_tokens(
    tokenizer: &Tokenizer,
    text: &str,
    max_tokens: usize,
) -> Result<String, ServiceError> {
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|error| ServiceError::backend("tokenizer", error.to_string()))?;

    if encoding.len() <= max_tokens {
        return Ok(text.to_string());
    }
    if max_tokens == 0 {
        return Ok(String::new());
    }

    // offsets are byte spans into the original text
    let mut end = encoding.get_offsets()[max_tokens - 1].1.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    Ok(text[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Small WordPiece model that splits "glomerular" into three subwords.
    fn subword_tokenizer() -> Tokenizer {
        let json = WORD_TOKENIZER_JSON.replace(
            r#""vocab": { "[UNK]": 0 }"#,
            r###""vocab": {
                "[UNK]": 0, "glom": 1, "##er": 2, "##ular": 3,
                "filtration": 4, "rate": 5, "##s": 6, ".": 7
            }"###,
        );
        Tokenizer::from_bytes(json).expect("test vocabulary parses")
    }

    #[test]
    fn word_tokenizer_counts_words_and_punctuation() {
        let tokenizer = word_tokenizer().expect("tokenizer");
        let encoding = tokenizer
            .encode("Metformin lowers HbA1c, gently.", false)
            .expect("encodes");
        assert_eq!(encoding.len(), 6);
    }

    #[test]
    fn truncation_keeps_short_text_unchanged() {
        let tokenizer = word_tokenizer().expect("tokenizer");
        let text = "Metformin is first-line therapy for type 2 diabetes.";
        assert_eq!(truncate_to_tokens(&tokenizer, text, 440).unwrap(), text);
    }

    #[test]
    fn truncation_returns_prefix_aligned_to_model_tokens() {
        let tokenizer = subword_tokenizer();
        let text = "Glomerular filtration rates. ".repeat(4);

        // glom ##er ##ular filtration rate ##s . = 7 tokens per sentence
        let cut_after_subword = truncate_to_tokens(&tokenizer, &text, 9).unwrap();
        assert_eq!(cut_after_subword, "Glomerular filtration rates. Glomer");

        let truncated = truncate_to_tokens(&tokenizer, &text, 10).unwrap();
        assert_eq!(truncated, "Glomerular filtration rates. Glomerular");

        let full_ids = tokenizer.encode(text.as_str(), false).unwrap().get_ids().to_vec();
        let kept_ids = tokenizer.encode(truncated.as_str(), false).unwrap().get_ids().to_vec();
        assert_eq!(kept_ids, full_ids[..10].to_vec());
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let tokenizer = word_tokenizer().expect("tokenizer");
        let text = "β-blockers reduce mortality après infarction";

        let truncated = truncate_to_tokens(&tokenizer, text, 2).unwrap();

        assert_eq!(truncated, "β-");
    }

    #[tokio::test]
    async fn missing_tokenizer_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        let result = load_model_tokenizer("BAAI/bge-large-en-v1.5", Some(missing.as_path())).await;
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }
}
