use crate::error::SearchError;
use crate::models::{IndexPoint, PointPayload, ScoredPoint, StoredPoint};
use crate::store::{CollectionInfo, PointFilter, ScrollPage};
use crate::traits::VectorStore;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "qdrant";

/// Qdrant over its REST API. Collections use cosine distance.
pub struct QdrantStore {
    endpoint: String,
    client: Client,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    score_threshold: Option<f32>,
    filter: Option<Value>,
    with_payload: bool,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ScrollBody {
    filter: Option<Value>,
    limit: usize,
    offset: Option<Uuid>,
    with_payload: bool,
    with_vector: bool,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let endpoint = endpoint.into();
        Url::parse(&endpoint)?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|error| SearchError::Request(format!("invalid api key header: {error}")))?;
            headers.insert("api-key", value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn collection_url(&self, collection: &str, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, collection, suffix)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, SearchError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {body}"),
            });
        }
        Ok(response.json().await?)
    }
}

fn parse_id(value: Option<&Value>) -> Option<Uuid> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// Id and payload of one returned record; records written by other tools
/// (numeric ids, foreign payloads) are skipped.
fn parse_record(record: &Value) -> Option<(Uuid, PointPayload)> {
    let Some(id) = parse_id(record.get("id")) else {
        warn!(id = ?record.get("id"), "skipping point without a uuid id");
        return None;
    };
    let payload = record.get("payload").cloned().unwrap_or(Value::Null);
    match serde_json::from_value::<PointPayload>(payload) {
        Ok(payload) => Some((id, payload)),
        Err(error) => {
            warn!(%id, %error, "skipping point with unexpected payload");
            None
        }
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(&self, name: &str, vector_size: usize) -> Result<(), SearchError> {
        let body = json!({
            "vectors": { "size": vector_size, "distance": "Cosine" }
        });
        self.send(self.client.put(self.collection_url(name, "")).json(&body))
            .await?;
        debug!(collection = name, vector_size, "collection created");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SearchError> {
        let parsed = self
            .send(self.client.get(format!("{}/collections", self.endpoint)))
            .await?;
        let names = parsed
            .pointer("/result/collections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.get("name").and_then(Value::as_str).map(str::to_string))
            .collect::<Vec<_>>();

        let mut collections = Vec::with_capacity(names.len());
        for name in names {
            match self.collection_info(&name).await? {
                Some(info) => collections.push(info),
                None => collections.push(CollectionInfo {
                    name,
                    vector_size: None,
                    points_count: None,
                }),
            }
        }
        Ok(collections)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, SearchError> {
        let response = self.client.get(self.collection_url(name, "")).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {body}"),
            });
        }

        let parsed: Value = response.json().await?;
        Ok(Some(CollectionInfo {
            name: name.to_string(),
            vector_size: parsed
                .pointer("/result/config/params/vectors/size")
                .and_then(Value::as_u64)
                .map(|size| size as usize),
            points_count: parsed.pointer("/result/points_count").and_then(Value::as_u64),
        }))
    }

    async fn upsert(&self, collection: &str, points: &[IndexPoint]) -> Result<(), SearchError> {
        if points.is_empty() {
            return Ok(());
        }

        let points = points
            .iter()
            .map(|point| {
                Ok(json!({
                    "id": point.id,
                    "vector": point.vector,
                    "payload": serde_json::to_value(&point.payload)?,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        self.send(
            self.client
                .put(self.collection_url(collection, "/points?wait=true"))
                .json(&json!({ "points": points })),
        )
        .await?;
        Ok(())
    }

    async fn query_top_k(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        let body = SearchBody {
            vector,
            limit,
            score_threshold,
            filter: filter.filter(|filter| !filter.is_empty()).map(PointFilter::to_json),
            with_payload: true,
        };

        let parsed = self
            .send(
                self.client
                    .post(self.collection_url(collection, "/points/search"))
                    .json(&body),
            )
            .await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .filter_map(|hit| {
                let (id, payload) = parse_record(hit)?;
                let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Some(ScoredPoint { id, score, payload })
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &PointFilter,
        limit: usize,
        offset: Option<Uuid>,
    ) -> Result<ScrollPage, SearchError> {
        let body = ScrollBody {
            filter: (!filter.is_empty()).then(|| filter.to_json()),
            limit,
            offset,
            with_payload: true,
            with_vector: false,
        };

        let parsed = self
            .send(
                self.client
                    .post(self.collection_url(collection, "/points/scroll"))
                    .json(&body),
            )
            .await?;

        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(parse_record)
            .map(|(id, payload)| StoredPoint { id, payload })
            .collect();

        Ok(ScrollPage {
            points,
            next_offset: parse_id(parsed.pointer("/result/next_page_offset")),
        })
    }

    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.send(
            self.client
                .post(self.collection_url(collection, "/points/delete?wait=true"))
                .json(&json!({ "points": ids })),
        )
        .await?;
        Ok(())
    }
}
