//! Qdrant REST gateway.
//!
//! The HTTP client is built lazily on first use and rebuilt after a
//! transport failure; a failing call is retried once on the fresh client and
//! then surfaces as [`StoreError::Unavailable`].

use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::embeddings::Embedding;
use super::store::{HitPayload, ScoredHit, StoreError, VectorStore};
use crate::config::VectorStoreConfig;

pub struct QdrantGateway {
    base_url: String,
    api_key: Option<String>,
    collection: String,
    dimensions: usize,
    timeout: Duration,
    client: Mutex<Option<Client>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<PointHit>,
}

#[derive(Debug, Deserialize)]
struct PointHit {
    id: PointId,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PointId {
    Num(u64),
    Uuid(String),
}

impl QdrantGateway {
    pub fn new(config: &VectorStoreConfig, collection: &str, dimensions: usize) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collection: collection.to_string(),
            dimensions,
            timeout: Duration::from_secs(config.timeout_secs),
            client: Mutex::new(None),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    fn connect(&self) -> Result<Client, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim())
                    .map_err(|e| StoreError::Rejected(format!("invalid api key: {e}")))?,
            );
        }

        log::debug!("connecting to qdrant at {}", self.base_url);

        Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build qdrant client: {e}")))
    }

    fn client(&self) -> Result<Client, StoreError> {
        let mut guard = self
            .client
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("client lock poisoned: {e}")))?;

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }

        guard
            .clone()
            .ok_or_else(|| StoreError::Unavailable("qdrant client not connected".into()))
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.client.lock() {
            *guard = None;
        }
    }

    /// Send a request, reconnecting and retrying once on transport failure.
    fn send<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let client = self.client()?;
        let response = match build(&client).send() {
            Ok(response) => response,
            Err(err) if err.is_connect() || err.is_timeout() || err.is_request() => {
                log::warn!("qdrant request failed ({err}), reconnecting");
                self.reset();
                let client = self.client()?;
                build(&client).send().map_err(|err| {
                    self.reset();
                    StoreError::Unavailable(err.to_string())
                })?
            }
            Err(err) => return Err(StoreError::Unavailable(err.to_string())),
        };

        Ok(response)
    }

    fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());

        if status.is_server_error() {
            Err(StoreError::Unavailable(format!("qdrant returned {status}: {body}")))
        } else {
            Err(StoreError::Rejected(format!("qdrant returned {status}: {body}")))
        }
    }

    fn check_dimensions(&self, vector: &Embedding) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

impl VectorStore for QdrantGateway {
    fn provision(&self) -> Result<(), StoreError> {
        let url = self.collection_url();
        let response = self.send(|client| client.get(&url))?;

        if response.status() == StatusCode::NOT_FOUND {
            log::info!(
                "creating qdrant collection '{}' ({} dims, cosine)",
                self.collection,
                self.dimensions
            );
            let body = json!({
                "vectors": { "size": self.dimensions, "distance": "Cosine" }
            });
            Self::check(self.send(|client| client.put(&url).json(&body))?)?;
            return Ok(());
        }

        Self::check(response)?;
        log::debug!("qdrant collection '{}' already exists", self.collection);
        Ok(())
    }

    fn upsert(&self, id: u64, vector: &Embedding, payload: &HitPayload) -> Result<(), StoreError> {
        self.check_dimensions(vector)?;

        let url = format!("{}/points?wait=true", self.collection_url());
        let body = json!({
            "points": [{ "id": id, "vector": vector.as_slice(), "payload": payload }]
        });

        Self::check(self.send(|client| client.put(&url).json(&body))?)?;
        Ok(())
    }

    fn search(
        &self,
        vector: &Embedding,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredHit>, StoreError> {
        self.check_dimensions(vector)?;

        let url = format!("{}/points/search", self.collection_url());
        let body = json!({
            "vector": vector.as_slice(),
            "limit": limit,
            "score_threshold": score_threshold,
            "with_payload": true,
        });

        let response = Self::check(self.send(|client| client.post(&url).json(&body))?)?;
        let parsed: SearchResponse = response
            .json()
            .map_err(|e| StoreError::Unavailable(format!("malformed search response: {e}")))?;

        let mut hits: Vec<ScoredHit> = parsed
            .result
            .into_iter()
            .filter(|hit| hit.score >= score_threshold)
            .filter_map(|hit| {
                let id = match hit.id {
                    PointId::Num(id) => id,
                    PointId::Uuid(uuid) => {
                        log::warn!("skipping qdrant point with non-numeric id {uuid}");
                        return None;
                    }
                };
                let payload = match hit.payload.map(HitPayload::from_value) {
                    Some(Ok(payload)) => payload,
                    Some(Err(err)) => {
                        log::warn!("skipping qdrant point {id}: {err}");
                        return None;
                    }
                    None => {
                        log::warn!("skipping qdrant point {id}: no payload");
                        return None;
                    }
                };
                Some(ScoredHit {
                    id,
                    payload,
                    score: hit.score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        Ok(hits)
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        let url = format!("{}/points/delete?wait=true", self.collection_url());
        let body = json!({ "points": [id] });

        Self::check(self.send(|client| client.post(&url).json(&body))?)?;
        Ok(())
    }
}
