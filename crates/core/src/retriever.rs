use crate::error::SearchError;
use crate::models::{ScoredPoint, SearchRequest, SearchResult, StoredPoint, TextOrder};
use crate::store::PointFilter;
use crate::traits::VectorStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error};

pub struct NeighborhoodRetriever {
    store: Arc<dyn VectorStore>,
    collection: String,
    window: u64,
    text_order: TextOrder,
}

impl NeighborhoodRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        window: u64,
        text_order: TextOrder,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            window,
            text_order,
        }
    }

    /// One result per hit above the threshold, best first. Store failures are
    /// logged and produce an empty list.
    pub async fn search(&self, query_vector: &[f32], request: &SearchRequest) -> Vec<SearchResult> {
        match self.try_search(query_vector, request).await {
            Ok(results) => results,
            Err(search_error) => {
                error!(
                    collection = %self.collection,
                    error = %search_error,
                    "search failed; returning no results"
                );
                Vec::new()
            }
        }
    }

    async fn try_search(
        &self,
        query_vector: &[f32],
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let filter = PointFilter::from_search_filters(&request.filters);
        let hits = self
            .store
            .query_top_k(
                &self.collection,
                query_vector,
                request.limit,
                Some(request.score_threshold),
                filter.as_ref(),
            )
            .await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits
            .iter()
            .filter(|hit| hit.score >= request.score_threshold)
        {
            results.push(self.expand(hit).await?);
        }

        debug!(
            hits = hits.len(),
            results = results.len(),
            window = self.window,
            "search expanded"
        );
        Ok(results)
    }

    async fn expand(&self, hit: &ScoredPoint) -> Result<SearchResult, SearchError> {
        let center = hit.payload.chunk_index;
        let lower = center.saturating_sub(self.window);
        let upper = center.saturating_add(self.window);
        let filter = PointFilter::document_window(hit.payload.document_uuid, lower, upper);
        let limit = usize::try_from(upper - lower + 1).unwrap_or(usize::MAX);

        let page = self
            .store
            .scroll(&self.collection, &filter, limit, None)
            .await?;

        let mut points = page.points;
        if points.is_empty() {
            points.push(StoredPoint {
                id: hit.id,
                payload: hit.payload.clone(),
            });
        }
        Ok(merge_window(points, hit.score, self.text_order))
    }
}

/// Folds the window points of one hit into a single result. Ids keep store
/// order; texts follow `order`.
pub fn merge_window(mut points: Vec<StoredPoint>, score: f32, order: TextOrder) -> SearchResult {
    let ids = points.iter().map(|point| point.id).collect();
    let chunks = points
        .iter()
        .map(|point| point.payload.chunk_index)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let file_paths = points
        .iter()
        .map(|point| point.payload.file_path.clone())
        .collect();
    let file_types = points
        .iter()
        .map(|point| point.payload.file_format.clone())
        .collect();

    if order == TextOrder::Chunk {
        points.sort_by_key(|point| point.payload.chunk_index);
    }
    let texts = points
        .iter()
        .map(|point| point.payload.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    SearchResult {
        ids,
        chunks,
        file_paths,
        file_types,
        texts,
        score,
    }
}
