use crate::chunking::normalize_whitespace;
use crate::config::RagSettings;
use crate::models::{Node, StoredRecord};
use crate::traits::VectorIndex;
use crate::SearchError;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Digest of whitespace-normalized text; the content half of a record id.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn record_id(source: &str, cid: &str) -> String {
    format!("{source}::{cid}")
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub batch_size: usize,
    pub min_chars: usize,
    pub min_words: usize,
}

impl From<&RagSettings> for StoreSettings {
    fn from(value: &RagSettings) -> Self {
        Self {
            batch_size: value.store_batch_size.max(1),
            min_chars: value.min_chunk_chars,
            min_words: value.min_chunk_words,
        }
    }
}

impl StoreSettings {
    fn is_trivial(&self, normalized: &str) -> bool {
        normalized.chars().count() < self.min_chars
            && normalized.split_whitespace().count() < self.min_words
    }
}

/// Content-addressed front for a [`VectorIndex`].
pub struct VectorStore {
    index: Arc<dyn VectorIndex>,
    settings: StoreSettings,
}

impl VectorStore {
    pub fn new(index: Arc<dyn VectorIndex>, settings: StoreSettings) -> Self {
        Self { index, settings }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Stores embedded nodes not already present and returns how many were new.
    ///
    /// Nodes without an embedding, with blank text, or too short to carry signal
    /// are skipped. Surviving nodes get their `cid` set.
    pub async fn upsert_nodes(&self, nodes: &mut [Node]) -> Result<usize, SearchError> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();

        for node in nodes.iter_mut() {
            let Some(embedding) = node.embedding.as_ref() else {
                continue;
            };
            let text = normalize_whitespace(&node.text);
            if text.is_empty() || self.settings.is_trivial(&text) {
                continue;
            }

            let cid = content_hash(&text);
            let id = record_id(&node.metadata.source, &cid);
            node.metadata.cid = Some(cid);

            // first occurrence wins within one call
            if !seen.insert(id.clone()) {
                continue;
            }

            records.push(StoredRecord {
                id,
                embedding: embedding.clone(),
                text,
                metadata: node.metadata.clone(),
            });
        }

        if records.is_empty() {
            info!("no storable nodes in batch");
            return Ok(0);
        }

        let mut stored = 0;
        for (batch_index, batch) in records.chunks(self.settings.batch_size).enumerate() {
            let ids: Vec<String> = batch.iter().map(|record| record.id.clone()).collect();
            let existing = self.index.existing_ids(&ids).await?;
            let fresh: Vec<StoredRecord> = batch
                .iter()
                .filter(|record| !existing.contains(&record.id))
                .cloned()
                .collect();

            if fresh.is_empty() {
                debug!(batch = batch_index + 1, "batch already stored");
                continue;
            }

            self.index.upsert(&fresh).await?;
            stored += fresh.len();
            info!(batch = batch_index + 1, items = fresh.len(), "stored batch");
        }

        info!(stored, collection = %self.index.describe(), "upsert finished");
        Ok(stored)
    }

    pub async fn count(&self) -> Result<usize, SearchError> {
        self.index.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, ScoredRecord, StoredRecord};
    use crate::stores::LocalStore;
    use crate::SearchError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Local index that records the size of every upsert call.
    struct CountingIndex {
        inner: LocalStore,
        upserts: Mutex<Vec<usize>>,
    }

    impl CountingIndex {
        fn new() -> Self {
            Self {
                inner: LocalStore::in_memory(),
                upserts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn upsert(&self, records: &[StoredRecord]) -> Result<(), SearchError> {
            self.upserts.lock().unwrap().push(records.len());
            self.inner.upsert(records).await
        }

        async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, SearchError> {
            self.inner.existing_ids(ids).await
        }

        async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>, SearchError> {
            self.inner.query(vector, k).await
        }

        async fn count(&self) -> Result<usize, SearchError> {
            self.inner.count().await
        }
    }

    const LONG: &str = "Patients with chronic kidney disease need regular monitoring of \
        serum potassium, creatinine and estimated glomerular filtration rate, and \
        medication doses are adjusted as kidney function declines over time.";

    fn node(source: &str, text: &str, embedding: Option<Vec<f32>>) -> Node {
        Node {
            text: text.to_string(),
            metadata: Metadata::for_source(source),
            embedding,
        }
    }

    fn store() -> VectorStore {
        VectorStore::new(
            Arc::new(LocalStore::in_memory()),
            StoreSettings::from(&RagSettings::default()),
        )
    }

    #[test]
    fn content_hash_ignores_whitespace_layout() {
        assert_eq!(content_hash("a  b\n c"), content_hash("a b c"));
        assert_ne!(content_hash("a b c"), content_hash("a b d"));
    }

    #[tokio::test]
    async fn trivial_and_unembedded_nodes_are_skipped() {
        let store = store();
        let mut nodes = vec![
            node("a.pdf", "too short", Some(vec![1.0, 0.0])),
            node("a.pdf", LONG, None),
            node("a.pdf", "   ", Some(vec![1.0, 0.0])),
        ];

        assert_eq!(store.upsert_nodes(&mut nodes).await.expect("upsert"), 0);
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn re_ingesting_identical_content_is_a_no_op() {
        let store = store();
        let mut first = vec![node("a.pdf", LONG, Some(vec![1.0, 0.0]))];
        let mut second = first.clone();

        assert_eq!(store.upsert_nodes(&mut first).await.expect("upsert"), 1);
        assert_eq!(store.upsert_nodes(&mut second).await.expect("upsert"), 0);
        assert_eq!(store.count().await.expect("count"), 1);
        assert!(first[0].metadata.cid.is_some());
    }

    #[tokio::test]
    async fn same_text_from_different_sources_is_stored_twice() {
        let store = store();
        let mut nodes = vec![
            node("a.pdf", LONG, Some(vec![1.0, 0.0])),
            node("b.pdf", LONG, Some(vec![1.0, 0.0])),
            node("b.pdf", &format!("  {LONG}  "), Some(vec![0.0, 1.0])),
        ];

        assert_eq!(store.upsert_nodes(&mut nodes).await.expect("upsert"), 2);
        let ids = store
            .index()
            .existing_ids(&[
                record_id("a.pdf", &content_hash(LONG)),
                record_id("b.pdf", &content_hash(LONG)),
            ])
            .await
            .expect("lookup");
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn writes_are_split_into_sub_batches() {
        let index = Arc::new(CountingIndex::new());
        let store = VectorStore::new(
            index.clone(),
            StoreSettings {
                batch_size: 2,
                min_chars: 0,
                min_words: 0,
            },
        );
        let mut nodes: Vec<Node> = (0..5)
            .map(|i| node("a.pdf", &format!("chunk {i}"), Some(vec![1.0, 0.0])))
            .collect();

        assert_eq!(store.upsert_nodes(&mut nodes).await.expect("upsert"), 5);
        assert_eq!(store.count().await.expect("count"), 5);
        assert_eq!(*index.upserts.lock().unwrap(), vec![2, 2, 1]);
    }
}
