use crate::error::ConfigError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const MAX_EMBED_BATCH: usize = 128;

/// Policy constants for every pipeline stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub embed_max_tokens: usize,
    pub embed_batch_size: usize,
    pub embed_batch_delay_ms: u64,
    pub embed_max_attempts: usize,
    pub embed_initial_backoff_ms: u64,
    pub normalize_embeddings: bool,
    pub query_cache_capacity: usize,

    pub store_batch_size: usize,
    pub min_chunk_chars: usize,
    pub min_chunk_words: usize,

    pub oversample: usize,
    pub default_top_k: usize,
    pub relevance_threshold: f64,
    pub max_urls: usize,
    pub dedup_prefix_chars: usize,

    pub page_match_prefix_chars: usize,
    pub page_match_probe_words: usize,
    pub page_match_min_overlap: f64,

    pub temperature: f32,
    pub max_output_tokens: u32,

    pub parse_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub rerank_timeout_secs: u64,
    pub generation_timeout_secs: u64,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            chunk_size: 440,
            chunk_overlap: 40,
            embed_max_tokens: 440,
            embed_batch_size: 50,
            embed_batch_delay_ms: 300,
            embed_max_attempts: 3,
            embed_initial_backoff_ms: 1_000,
            normalize_embeddings: true,
            query_cache_capacity: 64,
            store_batch_size: 100,
            min_chunk_chars: 160,
            min_chunk_words: 25,
            oversample: 3,
            default_top_k: 5,
            relevance_threshold: 0.55,
            max_urls: 5,
            dedup_prefix_chars: 250,
            page_match_prefix_chars: 800,
            page_match_probe_words: 80,
            page_match_min_overlap: 0.15,
            temperature: 0.2,
            max_output_tokens: 400,
            parse_timeout_secs: 600,
            embed_timeout_secs: 30,
            rerank_timeout_secs: 15,
            generation_timeout_secs: 40,
        }
    }
}

impl RagSettings {
    /// Reads an optional settings file, then `MEDRAG_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix("MEDRAG").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be greater than zero"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(invalid(
                "chunk_overlap",
                format!(
                    "{} must be smaller than chunk_size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            ));
        }
        if self.embed_max_tokens == 0 {
            return Err(invalid("embed_max_tokens", "must be greater than zero"));
        }
        if self.embed_max_attempts == 0 {
            return Err(invalid("embed_max_attempts", "must be at least 1"));
        }
        if self.oversample == 0 {
            return Err(invalid("oversample", "must be at least 1"));
        }
        if self.store_batch_size == 0 {
            return Err(invalid("store_batch_size", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(invalid("relevance_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.page_match_min_overlap) {
            return Err(invalid("page_match_min_overlap", "must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn embed_batch_size(&self) -> usize {
        self.embed_batch_size.clamp(1, MAX_EMBED_BATCH)
    }

    pub fn embed_batch_delay(&self) -> Duration {
        Duration::from_millis(self.embed_batch_delay_ms)
    }
}

fn invalid(key: &str, details: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        details: details.into(),
    }
}

/// Credentials, endpoints and model identifiers for the external services.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub embedding_api_key: Option<String>,
    pub parsing_api_key: Option<String>,
    pub generation_api_key: Option<String>,
    pub rerank_api_key: Option<String>,
    pub inference_base_url: String,
    pub parsing_base_url: String,
    pub embedding_model: String,
    /// Local `tokenizer.json` for the embedding model; fetched from the hub by model id when unset.
    pub embedding_tokenizer: Option<PathBuf>,
    pub rerank_model: String,
    pub chat_model: String,
    pub store_path: PathBuf,
    pub collection: String,
    pub qdrant_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            embedding_api_key: None,
            parsing_api_key: None,
            generation_api_key: None,
            rerank_api_key: None,
            inference_base_url: "https://api.together.xyz/v1".to_string(),
            parsing_base_url: "https://api.cloud.llamaindex.ai/api/parsing".to_string(),
            embedding_model: "BAAI/bge-large-en-v1.5".to_string(),
            embedding_tokenizer: None,
            rerank_model: "Salesforce/Llama-Rank-v1".to_string(),
            chat_model: "meta-llama/Llama-3.1-8B-Instruct-Turbo".to_string(),
            store_path: PathBuf::from("./vector_db"),
            collection: "medical_rag".to_string(),
            qdrant_url: None,
        }
    }
}

pub const EMBEDDING_KEY_ENV: &str = "TOGETHER_API_KEY";
pub const PARSING_KEY_ENV: &str = "LLAMA_CLOUD_API_KEY";
pub const GENERATION_KEY_ENV: &str = "GENERATION_API_KEY";
pub const RERANK_KEY_ENV: &str = "RERANK_API_KEY";

impl ServiceConfig {
    /// Rerank credential, falling back to the embedding provider's key.
    pub fn rerank_key(&self) -> Option<&str> {
        present(&self.rerank_api_key).or_else(|| present(&self.embedding_api_key))
    }

    pub fn generation_key(&self) -> Option<&str> {
        present(&self.generation_api_key).or_else(|| present(&self.embedding_api_key))
    }

    pub fn embedding_key(&self) -> Option<&str> {
        present(&self.embedding_api_key)
    }

    pub fn parsing_key(&self) -> Option<&str> {
        present(&self.parsing_api_key)
    }

    /// Environment names of credentials that are absent; the parsing key is optional.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.embedding_key().is_none() {
            missing.push(EMBEDDING_KEY_ENV);
        }
        if self.generation_key().is_none() {
            missing.push(GENERATION_KEY_ENV);
        }
        missing
    }

    /// Fails before any external call when a required credential or endpoint is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.require_embedding()?;
        if self.generation_key().is_none() {
            return Err(ConfigError::Missing(GENERATION_KEY_ENV.to_string()));
        }
        self.validate_urls()?;
        self.validate_store()
    }

    fn require_embedding(&self) -> Result<(), ConfigError> {
        if self.embedding_key().is_none() {
            return Err(ConfigError::Missing(EMBEDDING_KEY_ENV.to_string()));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::Missing("embedding_model".to_string()));
        }
        Ok(())
    }

    fn validate_urls(&self) -> Result<(), ConfigError> {
        let mut urls = vec![
            ("inference_base_url", self.inference_base_url.as_str()),
            ("parsing_base_url", self.parsing_base_url.as_str()),
        ];
        if let Some(qdrant) = self.qdrant_url.as_deref() {
            urls.push(("qdrant_url", qdrant));
        }
        for (key, value) in urls {
            Url::parse(value).map_err(|error| invalid(key, error.to_string()))?;
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<(), ConfigError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Missing("collection".to_string()));
        }
        if self.qdrant_url.is_none() && self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("store_path".to_string()));
        }
        Ok(())
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ServiceConfig {
        ServiceConfig {
            embedding_api_key: Some("embed-key".to_string()),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(RagSettings::default().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let settings = RagSettings {
            chunk_size: 40,
            chunk_overlap: 40,
            ..RagSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "chunk_overlap"
        ));
    }

    #[test]
    fn batch_size_is_clamped() {
        let mut settings = RagSettings {
            embed_batch_size: 0,
            ..RagSettings::default()
        };
        assert_eq!(settings.embed_batch_size(), 1);
        settings.embed_batch_size = 500;
        assert_eq!(settings.embed_batch_size(), MAX_EMBED_BATCH);
    }

    #[test]
    fn missing_embedding_key_is_a_config_error() {
        let config = ServiceConfig {
            embedding_api_key: Some("   ".to_string()),
            ..ServiceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing(key)) if key == EMBEDDING_KEY_ENV
        ));
    }

    #[test]
    fn generation_and_rerank_fall_back_to_embedding_key() {
        let config = configured();
        assert_eq!(config.generation_key(), Some("embed-key"));
        assert_eq!(config.rerank_key(), Some("embed-key"));
        assert!(config.validate().is_ok());
        assert!(config.missing_credentials().is_empty());
    }

    #[test]
    fn malformed_qdrant_url_is_rejected() {
        let config = ServiceConfig {
            qdrant_url: Some("not a url".to_string()),
            ..configured()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "qdrant_url"
        ));
    }

    #[test]
    fn settings_load_without_file_uses_defaults() {
        let settings = RagSettings::load(None).expect("defaults should load");
        assert_eq!(settings.chunk_size, 440);
        assert!((settings.relevance_threshold - 0.55).abs() < f64::EPSILON);
    }
}
