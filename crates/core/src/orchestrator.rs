use crate::config::Settings;
use crate::embeddings::{EmbeddingBatcher, EmbeddingModel};
use crate::error::{ConfigError, IngestError, SearchError};
use crate::extractor::ExtractionContext;
use crate::ingest::{DocumentIngestor, IngestionReport};
use crate::models::{SearchRequest, SearchResult};
use crate::ocr::OcrEngine;
use crate::retriever::NeighborhoodRetriever;
use crate::store::{CollectionInfo, PointFilter};
use crate::traits::VectorStore;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const DELETE_PAGE_SIZE: usize = 256;

/// Entry point tying the store, the embedding model and the ingestion and
/// retrieval pipelines to one collection.
pub struct DocumentService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingBatcher>,
    ingestor: DocumentIngestor,
    retriever: NeighborhoodRetriever,
    collection: String,
}

impl DocumentService {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn VectorStore>,
        model: Arc<dyn EmbeddingModel>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        let collection = settings.store.collection.clone();
        let embedder = Arc::new(EmbeddingBatcher::new(model));
        let ingestor = DocumentIngestor::new(
            store.clone(),
            embedder.clone(),
            ExtractionContext {
                ocr,
                pdf_mode: settings.processing.pdf_mode,
            },
            collection.clone(),
            settings.ingestion_options(),
        );
        let retriever = NeighborhoodRetriever::new(
            store.clone(),
            collection.clone(),
            settings.search.neighbor_window,
            settings.search.text_order,
        );

        Self {
            store,
            embedder,
            ingestor,
            retriever,
            collection,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn embedder(&self) -> &EmbeddingBatcher {
        &self.embedder
    }

    /// Creates the collection sized for the embedding model when it is
    /// missing. Returns whether it was created.
    pub async fn ensure_collection(&self) -> Result<bool, ConfigError> {
        match self.store.collection_info(&self.collection).await? {
            Some(info) => {
                self.check_dimensions(&info)?;
                Ok(false)
            }
            None => {
                self.store
                    .create_collection(&self.collection, self.embedder.dimensions())
                    .await?;
                info!(
                    collection = %self.collection,
                    dimensions = self.embedder.dimensions(),
                    "collection created"
                );
                Ok(true)
            }
        }
    }

    /// Fails when the collection is missing or sized for another model.
    pub async fn check_collection(&self) -> Result<CollectionInfo, ConfigError> {
        let info = self
            .store
            .collection_info(&self.collection)
            .await?
            .ok_or_else(|| ConfigError::MissingCollection(self.collection.clone()))?;
        self.check_dimensions(&info)?;
        Ok(info)
    }

    fn check_dimensions(&self, info: &CollectionInfo) -> Result<(), ConfigError> {
        let expected = self.embedder.dimensions();
        match info.vector_size {
            Some(actual) if actual != expected => Err(ConfigError::DimensionMismatch {
                collection: info.name.clone(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SearchError> {
        self.store.list_collections().await
    }

    /// Indexes one document; a fresh id is generated when none is given.
    pub async fn ingest(
        &self,
        path: &Path,
        document_uuid: Option<Uuid>,
    ) -> Result<Vec<Uuid>, IngestError> {
        let document_uuid = document_uuid.unwrap_or_else(Uuid::new_v4);
        self.ingest_with_cancel(path, document_uuid, &CancellationToken::new())
            .await
    }

    pub async fn ingest_with_cancel(
        &self,
        path: &Path,
        document_uuid: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, IngestError> {
        self.ingestor.ingest(path, document_uuid, cancel).await
    }

    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        self.ingestor
            .ingest_folder(folder, &CancellationToken::new())
            .await
    }

    /// Neighborhood-expanded results for `query`. Never fails; errors are
    /// logged and yield no results.
    pub async fn search(&self, query: &str, request: &SearchRequest) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            debug!("empty query; no results");
            return Vec::new();
        }
        let vector = self.embedder.embed_one(query).await;
        self.retriever.search(&vector, request).await
    }

    /// Removes every point of a document and returns the removed ids.
    pub async fn delete_document(&self, document_uuid: Uuid) -> Result<Vec<Uuid>, SearchError> {
        let filter = PointFilter::document(document_uuid);
        let mut ids = Vec::new();
        let mut offset = None;

        loop {
            let page = self
                .store
                .scroll(&self.collection, &filter, DELETE_PAGE_SIZE, offset)
                .await?;
            ids.extend(page.points.iter().map(|point| point.id));
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        self.store.delete(&self.collection, &ids).await?;
        info!(%document_uuid, points = ids.len(), "document deleted");
        Ok(ids)
    }
}
