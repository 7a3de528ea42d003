use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata carried from a parsed document through chunking, storage and retrieval.
///
/// Keys the pipeline reasons about are typed fields; anything else a parser
/// reports (`page`, `page_number`, `section_header`, ...) lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_label: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Page label, falling back to the alternate page keys some parsers emit.
    pub fn page_number(&self) -> Option<u32> {
        self.page_label.or_else(|| {
            ["page", "page_number"]
                .iter()
                .find_map(|key| self.extra.get(*key).and_then(positive_page))
        })
    }

    pub fn section(&self) -> Option<String> {
        ["section_header", "heading", "title"].iter().find_map(|key| {
            self.extra
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    }
}

fn positive_page(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    u32::try_from(number).ok().filter(|page| *page > 0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub metadata: Metadata,
}

/// A chunk of a document; the unit of embedding and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub text: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// A stored record returned by a nearest-neighbour query, with its cosine distance.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: StoredRecord,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub text: String,
    pub meta: Metadata,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Number(u32),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub page: Option<PageRef>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    Answered,
    Refused,
    InsufficientContext,
    RetrievalFailed,
    GenerationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_include_context")]
    pub include_context: bool,
}

fn default_top_k() -> usize {
    5
}

fn default_include_context() -> bool {
    true
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, top_k: usize) -> Self {
        Self {
            question: question.into(),
            top_k,
            include_context: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub outcome: AnswerOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Vec<RetrievalCandidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub filename: String,
    pub docs_count: usize,
    pub nodes_count: usize,
    pub stored_vectors: usize,
    pub collection_count: usize,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub store: String,
    pub collection: String,
    pub vector_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_number_falls_back_to_alternate_keys() {
        let mut metadata = Metadata::for_source("a.pdf");
        metadata.extra.insert("page_number".to_string(), json!("4"));
        assert_eq!(metadata.page_number(), Some(4));

        metadata.extra.insert("page".to_string(), json!(2));
        assert_eq!(metadata.page_number(), Some(2));

        metadata.page_label = Some(7);
        assert_eq!(metadata.page_number(), Some(7));
    }

    #[test]
    fn zero_or_garbage_pages_are_ignored() {
        let mut metadata = Metadata::for_source("a.pdf");
        metadata.extra.insert("page".to_string(), json!(0));
        metadata.extra.insert("page_number".to_string(), json!("n/a"));
        assert_eq!(metadata.page_number(), None);
    }

    #[test]
    fn metadata_round_trips_extra_keys_flat() {
        let raw = json!({
            "source": "guide.pdf",
            "page_label": 3,
            "type": "text",
            "section_header": "Dosing in renal impairment"
        });
        let metadata: Metadata = serde_json::from_value(raw).expect("metadata should parse");
        assert_eq!(metadata.page_label, Some(3));
        assert_eq!(metadata.doc_type.as_deref(), Some("text"));
        assert_eq!(
            metadata.section().as_deref(),
            Some("Dosing in renal impairment")
        );
    }
}
