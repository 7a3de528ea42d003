use crate::models::{Metadata, ScoredRecord, StoredRecord};
use crate::traits::VectorIndex;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Qdrant collection configured for cosine distance.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    ready: AtomicBool,
}

/// Qdrant only accepts integer or UUID point ids, so string ids map to UUIDv5.
pub fn point_id(record_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, record_id.as_bytes()).to_string()
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            ready: AtomicBool::new(false),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self, vector_size: usize) -> Result<(), SearchError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let response = self.client.get(self.collection_url()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            let created = self
                .client
                .put(self.collection_url())
                .json(&json!({
                    "vectors": { "size": vector_size, "distance": "Cosine" }
                }))
                .send()
                .await?;
            check_status(created.status())?;
        } else {
            check_status(response.status())?;
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}

fn check_status(status: StatusCode) -> Result<(), SearchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(SearchError::BackendResponse {
            backend: "qdrant".to_string(),
            details: status.to_string(),
        })
    }
}

fn hit_to_record(hit: &Value) -> Result<StoredRecord, SearchError> {
    let payload = hit.pointer("/payload").cloned().unwrap_or(Value::Null);
    let id = payload
        .pointer("/record_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let text = payload
        .pointer("/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let metadata: Metadata = match payload.pointer("/metadata") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Metadata::default(),
    };

    Ok(StoredRecord {
        id,
        embedding: Vec::new(),
        text,
        metadata,
    })
}

#[async_trait]
impl VectorIndex for QdrantStore {
    fn describe(&self) -> String {
        self.collection_url()
    }

    async fn upsert(&self, records: &[StoredRecord]) -> Result<(), SearchError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.ensure_collection(first.embedding.len()).await?;

        let points = records
            .iter()
            .map(|record| {
                if record.embedding.len() != first.embedding.len() {
                    return Err(SearchError::DimensionMismatch {
                        expected: first.embedding.len(),
                        actual: record.embedding.len(),
                    });
                }
                Ok(json!({
                    "id": point_id(&record.id),
                    "vector": record.embedding,
                    "payload": {
                        "record_id": record.id,
                        "text": record.text,
                        "metadata": record.metadata,
                    },
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        check_status(response.status())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, SearchError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let by_point: HashMap<String, &String> =
            ids.iter().map(|id| (point_id(id), id)).collect();
        let response = self
            .client
            .post(format!("{}/points", self.collection_url()))
            .json(&json!({
                "ids": by_point.keys().collect::<Vec<_>>(),
                "with_payload": false,
                "with_vector": false,
            }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(HashSet::new());
        }
        check_status(response.status())?;

        let parsed: Value = response.json().await?;
        Ok(parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| point.pointer("/id").and_then(Value::as_str))
                    .filter_map(|point| by_point.get(point).map(|id| (*id).clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>, SearchError> {
        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check_status(response.status())?;

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        hits.iter()
            .map(|hit| {
                let similarity = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(ScoredRecord {
                    record: hit_to_record(hit)?,
                    distance: 1.0 - similarity,
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<usize, SearchError> {
        let response = self
            .client
            .post(format!("{}/points/count", self.collection_url()))
            .json(&json!({ "exact": true }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        check_status(response.status())?;

        let parsed: Value = response.json().await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}
