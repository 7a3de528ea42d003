use crate::models::{ScoredRecord, StoredRecord};
use crate::traits::VectorIndex;
use crate::SearchError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

/// Brute-force cosine index kept in memory and snapshotted to `{dir}/{collection}.json`.
pub struct LocalStore {
    snapshot: Option<PathBuf>,
    records: RwLock<BTreeMap<String, StoredRecord>>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            snapshot: None,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn open(dir: &Path, collection: &str) -> Result<Self, SearchError> {
        tokio::fs::create_dir_all(dir).await?;
        let snapshot = dir.join(format!("{collection}.json"));

        let mut records = BTreeMap::new();
        if tokio::fs::try_exists(&snapshot).await? {
            let bytes = tokio::fs::read(&snapshot).await?;
            let stored: Vec<StoredRecord> = serde_json::from_slice(&bytes)?;
            for record in stored {
                records.insert(record.id.clone(), record);
            }
        }

        info!(path = %snapshot.display(), records = records.len(), "local vector store ready");
        Ok(Self {
            snapshot: Some(snapshot),
            records: RwLock::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<String, StoredRecord>) -> Result<(), SearchError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };

        let rows: Vec<&StoredRecord> = records.values().collect();
        let staging = snapshot.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec(&rows)?).await?;
        tokio::fs::rename(&staging, snapshot).await?;
        Ok(())
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;
    for (a, b) in left.iter().zip(right) {
        dot += f64::from(*a) * f64::from(*b);
        left_norm += f64::from(*a) * f64::from(*a);
        right_norm += f64::from(*b) * f64::from(*b);
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

#[async_trait]
impl VectorIndex for LocalStore {
    fn describe(&self) -> String {
        match &self.snapshot {
            Some(path) => path.display().to_string(),
            None => "memory".to_string(),
        }
    }

    async fn upsert(&self, records: &[StoredRecord]) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut guard = self.records.write().await;
        let expected = guard.values().next().map(|record| record.embedding.len());
        for record in records {
            let expected = expected.unwrap_or(records[0].embedding.len());
            if record.embedding.len() != expected {
                return Err(SearchError::DimensionMismatch {
                    expected,
                    actual: record.embedding.len(),
                });
            }
        }

        // the live map only changes once the snapshot is on disk
        let mut staged = guard.clone();
        for record in records {
            staged.insert(record.id.clone(), record.clone());
        }
        self.persist(&staged).await?;
        *guard = staged;
        Ok(())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, SearchError> {
        let guard = self.records.read().await;
        Ok(ids
            .iter()
            .filter(|id| guard.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>, SearchError> {
        let guard = self.records.read().await;
        if let Some(first) = guard.values().next() {
            if first.embedding.len() != vector.len() {
                return Err(SearchError::DimensionMismatch {
                    expected: first.embedding.len(),
                    actual: vector.len(),
                });
            }
        }

        let mut scored: Vec<ScoredRecord> = guard
            .values()
            .map(|record| ScoredRecord {
                distance: 1.0 - cosine_similarity(vector, &record.embedding),
                record: record.clone(),
            })
            .collect();

        scored.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then_with(|| left.record.id.cmp(&right.record.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn count(&self) -> Result<usize, SearchError> {
        Ok(self.records.read().await.len())
    }
}
