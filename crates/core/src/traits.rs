use crate::error::SearchError;
use crate::models::{IndexPoint, ScoredPoint};
use crate::store::{CollectionInfo, PointFilter, ScrollPage};
use async_trait::async_trait;
use uuid::Uuid;

/// Vector store holding one collection of points per corpus. Vectors are
/// compared by cosine similarity.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self, name: &str, vector_size: usize) -> Result<(), SearchError>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SearchError>;

    /// `None` when the collection does not exist.
    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, SearchError>;

    async fn upsert(&self, collection: &str, points: &[IndexPoint]) -> Result<(), SearchError>;

    /// Nearest points, best first.
    async fn query_top_k(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError>;

    async fn scroll(
        &self,
        collection: &str,
        filter: &PointFilter,
        limit: usize,
        offset: Option<Uuid>,
    ) -> Result<ScrollPage, SearchError>;

    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), SearchError>;
}
