use crate::error::SearchError;
use crate::models::{IndexPoint, ScoredPoint, StoredPoint};
use crate::store::{CollectionInfo, PointFilter, ScrollPage};
use crate::traits::VectorStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process store for tests and embedded callers. Points keep their
/// insertion order, which is also the scroll order.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
    upserts: AtomicUsize,
}

struct MemoryCollection {
    vector_size: usize,
    points: Vec<IndexPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful bulk writes.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |collection| collection.points.len())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn payload_value(point: &IndexPoint) -> Result<Value, SearchError> {
    Ok(serde_json::to_value(&point.payload)?)
}

fn matches(filter: Option<&PointFilter>, point: &IndexPoint) -> Result<bool, SearchError> {
    match filter {
        Some(filter) if !filter.is_empty() => Ok(filter.matches(&payload_value(point)?)),
        _ => Ok(true),
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn create_collection(&self, name: &str, vector_size: usize) -> Result<(), SearchError> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(name) {
            return Err(SearchError::Request(format!(
                "collection {name} already exists"
            )));
        }
        collections.insert(
            name.to_string(),
            MemoryCollection {
                vector_size,
                points: Vec::new(),
            },
        );
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SearchError> {
        let collections = self.collections.read().await;
        let mut infos = collections
            .iter()
            .map(|(name, collection)| CollectionInfo {
                name: name.clone(),
                vector_size: Some(collection.vector_size),
                points_count: Some(collection.points.len() as u64),
            })
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, SearchError> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .map(|collection| CollectionInfo {
                name: name.to_string(),
                vector_size: Some(collection.vector_size),
                points_count: Some(collection.points.len() as u64),
            }))
    }

    async fn upsert(&self, collection: &str, points: &[IndexPoint]) -> Result<(), SearchError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;

        if let Some(point) = points
            .iter()
            .find(|point| point.vector.len() != target.vector_size)
        {
            return Err(SearchError::Request(format!(
                "point {} has {} dimensions, collection expects {}",
                point.id,
                point.vector.len(),
                target.vector_size
            )));
        }

        for point in points {
            match target.points.iter_mut().find(|stored| stored.id == point.id) {
                Some(stored) => *stored = point.clone(),
                None => target.points.push(point.clone()),
            }
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
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
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;

        let mut hits = Vec::new();
        for point in &target.points {
            if !matches(filter, point)? {
                continue;
            }
            let score = cosine(vector, &point.vector);
            if score_threshold.is_some_and(|threshold| score < threshold) {
                continue;
            }
            hits.push(ScoredPoint {
                id: point.id,
                score,
                payload: point.payload.clone(),
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &PointFilter,
        limit: usize,
        offset: Option<Uuid>,
    ) -> Result<ScrollPage, SearchError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;

        let mut selected = Vec::new();
        for point in &target.points {
            if matches(Some(filter), point)? {
                selected.push(point);
            }
        }

        let start = match offset {
            Some(offset) => selected
                .iter()
                .position(|point| point.id == offset)
                .unwrap_or(selected.len()),
            None => 0,
        };
        let end = start.saturating_add(limit).min(selected.len());

        Ok(ScrollPage {
            points: selected[start..end]
                .iter()
                .map(|point| StoredPoint {
                    id: point.id,
                    payload: point.payload.clone(),
                })
                .collect(),
            next_offset: selected.get(end).map(|point| point.id),
        })
    }

    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), SearchError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;
        target.points.retain(|point| !ids.contains(&point.id));
        Ok(())
    }
}

/// Store whose every call fails; for exercising error paths.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
#[async_trait]
impl VectorStore for FailingStore {
    async fn create_collection(&self, _name: &str, _vector_size: usize) -> Result<(), SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn collection_info(&self, _name: &str) -> Result<Option<CollectionInfo>, SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn upsert(&self, _collection: &str, _points: &[IndexPoint]) -> Result<(), SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn query_top_k(
        &self,
        _collection: &str,
        _vector: &[f32],
        _limit: usize,
        _score_threshold: Option<f32>,
        _filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn scroll(
        &self,
        _collection: &str,
        _filter: &PointFilter,
        _limit: usize,
        _offset: Option<Uuid>,
    ) -> Result<ScrollPage, SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }

    async fn delete(&self, _collection: &str, _ids: &[Uuid]) -> Result<(), SearchError> {
        Err(SearchError::Request("store offline".to_string()))
    }
}
