use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Payload `file_type` written for every point produced by the document pipeline.
pub const DOCUMENT_FILE_TYPE: &str = "document";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    ImageText,
    TableText,
}

/// One piece of page content in reading order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentUnit {
    pub kind: ContentKind,
    pub value: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub index: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointPayload {
    pub document_uuid: Uuid,
    pub file_path: String,
    pub file_type: String,
    pub file_format: String,
    pub text: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A stored point returned by a similarity query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: PointPayload,
}

/// A stored point returned by a scroll.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: Uuid,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchFilters {
    /// Payload `file_format` values, any of which may match.
    pub file_types: Vec<String>,
    /// Payload key/value pairs, any of which may match.
    pub metadata: BTreeMap<String, String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.file_types.is_empty() && self.metadata.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub limit: usize,
    pub score_threshold: f32,
    pub filters: SearchFilters,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            limit: 5,
            score_threshold: 0.0,
            filters: SearchFilters::default(),
        }
    }
}

/// How the texts of an expanded neighborhood are concatenated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextOrder {
    /// Sorted by chunk index.
    #[default]
    Chunk,
    /// In the order the store returned the window points.
    Store,
}

/// One top-level hit expanded with its neighboring chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub ids: Vec<Uuid>,
    pub chunks: Vec<u64>,
    pub file_paths: BTreeSet<String>,
    pub file_types: BTreeSet<String>,
    pub texts: String,
    pub score: f32,
}

/// Sizes used by the ingestion pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Points buffered before a bulk write.
    pub write_batch_size: usize,
    /// Chunks embedded per model call.
    pub embed_batch_size: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 100,
            write_batch_size: 100,
            embed_batch_size: 32,
        }
    }
}
