use crate::buffer::IndexingBuffer;
use crate::chunking::chunk_text;
use crate::embeddings::EmbeddingBatcher;
use crate::error::IngestError;
use crate::extractor::{Extraction, ExtractionContext, FileFormat};
use crate::models::{IndexPoint, IngestionOptions, PointPayload, DOCUMENT_FILE_TYPE};
use crate::traits::VectorStore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Supported documents under `folder`, recursively, in path order.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(FileFormat::from_extension)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub path: PathBuf,
    pub document_uuid: Uuid,
    pub checksum: String,
    pub point_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub documents: Vec<IngestedDocument>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn point_count(&self) -> usize {
        self.documents
            .iter()
            .map(|document| document.point_ids.len())
            .sum()
    }
}

/// Extract, chunk, embed and index one document at a time.
pub struct DocumentIngestor {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingBatcher>,
    extraction: ExtractionContext,
    collection: String,
    options: IngestionOptions,
}

impl DocumentIngestor {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<EmbeddingBatcher>,
        extraction: ExtractionContext,
        collection: impl Into<String>,
        options: IngestionOptions,
    ) -> Self {
        Self {
            store,
            embedder,
            extraction,
            collection: collection.into(),
            options,
        }
    }

    /// Indexes `path` under `document_uuid` and returns the ids of the stored
    /// points. A document without readable text stores nothing.
    ///
    /// Cancellation is honoured between embedding batches: points flushed so
    /// far stay in the store and the pending remainder is dropped.
    pub async fn ingest(
        &self,
        path: &Path,
        document_uuid: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, IngestError> {
        let format = FileFormat::from_path(path)?;
        let file_size = tokio::fs::metadata(path).await?.len();
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled { flushed: 0 });
        }

        let extraction = {
            let path = path.to_path_buf();
            let context = self.extraction.clone();
            tokio::task::spawn_blocking(move || format.extract(&path, &context))
                .await
                .map_err(|error| IngestError::Task(error.to_string()))??
        };

        let text = match extraction {
            Extraction::Text(text) => text,
            Extraction::Empty => {
                warn!(path = %path.display(), "no readable text; nothing indexed");
                return Ok(Vec::new());
            }
        };

        let chunks = chunk_text(&text, self.options.chunk_size, self.options.chunk_overlap)?;
        let file_path = path.to_string_lossy().to_string();
        let mut buffer = IndexingBuffer::new(
            self.store.clone(),
            self.collection.clone(),
            self.options.write_batch_size,
        );

        for batch in chunks.chunks(self.options.embed_batch_size.max(1)) {
            if cancel.is_cancelled() {
                let dropped = buffer.discard();
                let flushed = buffer.flushed_ids().len();
                warn!(
                    path = %path.display(),
                    flushed,
                    dropped,
                    "ingestion cancelled"
                );
                return Err(IngestError::Cancelled { flushed });
            }

            let texts = batch
                .iter()
                .map(|chunk| chunk.text.clone())
                .collect::<Vec<_>>();
            let vectors = self.embedder.embed_batch(&texts).await;

            for (chunk, vector) in batch.iter().zip(vectors) {
                buffer
                    .add(IndexPoint {
                        id: Uuid::new_v4(),
                        vector,
                        payload: PointPayload {
                            document_uuid,
                            file_path: file_path.clone(),
                            file_type: DOCUMENT_FILE_TYPE.to_string(),
                            file_format: format.label().to_string(),
                            text: chunk.text.clone(),
                            chunk_index: chunk.index,
                            total_chunks: chunk.total,
                            file_size,
                        },
                    })
                    .await?;
            }
        }

        buffer.finalize().await?;
        let point_ids = buffer.into_flushed_ids();

        info!(
            path = %path.display(),
            %document_uuid,
            chunks = chunks.len(),
            points = point_ids.len(),
            "document indexed"
        );
        Ok(point_ids)
    }

    /// Best effort over every supported file under `folder`; failures are
    /// reported per file. Fails only when the folder holds no supported files.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        for path in files {
            if cancel.is_cancelled() {
                report.skipped_files.push(SkippedFile {
                    path,
                    reason: "cancelled".to_string(),
                });
                continue;
            }

            let document_uuid = Uuid::new_v4();
            let outcome = match digest_file(&path) {
                Ok(checksum) => self
                    .ingest(&path, document_uuid, cancel)
                    .await
                    .map(|point_ids| (checksum, point_ids)),
                Err(error) => Err(error),
            };

            match outcome {
                Ok((checksum, point_ids)) => report.documents.push(IngestedDocument {
                    path,
                    document_uuid,
                    checksum,
                    point_ids,
                }),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping document");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PdfMode;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingModel};
    use crate::error::ModelError;
    use crate::ocr::DisabledOcr;
    use crate::store::PointFilter;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    pub(crate) const MANUAL: &str = "The pump starts when the inlet valve opens. \
        Pressure builds in the main chamber. The relief valve limits the pressure. \
        Operators check the gauge every shift. Filters are replaced every thirty days. \
        Seals are inspected during each service.";

    pub(crate) fn small_options() -> IngestionOptions {
        IngestionOptions {
            chunk_size: 60,
            chunk_overlap: 0,
            write_batch_size: 2,
            embed_batch_size: 2,
        }
    }

    pub(crate) fn extraction() -> ExtractionContext {
        ExtractionContext {
            ocr: Arc::new(DisabledOcr),
            pdf_mode: PdfMode::Layout,
        }
    }

    async fn ingestor_with(
        model: Arc<dyn EmbeddingModel>,
        options: IngestionOptions,
    ) -> (Arc<MemoryStore>, DocumentIngestor) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_collection("docs", model.dimensions())
            .await
            .expect("collection should be created");
        let ingestor = DocumentIngestor::new(
            store.clone(),
            Arc::new(EmbeddingBatcher::new(model)),
            extraction(),
            "docs",
            options,
        );
        (store, ingestor)
    }

    /// Cancels its token once it has served `after` calls.
    struct CancellingModel {
        token: CancellationToken,
        after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingModel for CancellingModel {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[test]
    fn discover_files_is_recursive_and_filters_formats() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(nested.join("b.md"), "# notes")?;
        fs::write(nested.join("c.xlsx"), "binary")?;

        let files = discover_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.txt");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn text_document_is_chunked_and_indexed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;
        let (store, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;
        let document = Uuid::new_v4();

        let ids = ingestor
            .ingest(&path, document, &CancellationToken::new())
            .await?;

        let expected = chunk_text(MANUAL, 60, 0)?;
        assert_eq!(ids.len(), expected.len());
        assert_eq!(store.point_count("docs").await, expected.len());

        let page = store
            .scroll("docs", &PointFilter::document(document), 100, None)
            .await?;
        let mut payloads = page
            .points
            .into_iter()
            .map(|point| point.payload)
            .collect::<Vec<_>>();
        payloads.sort_by_key(|payload| payload.chunk_index);

        for (payload, chunk) in payloads.iter().zip(&expected) {
            assert_eq!(payload.text, chunk.text);
            assert_eq!(payload.total_chunks, expected.len() as u64);
            assert_eq!(payload.file_type, DOCUMENT_FILE_TYPE);
            assert_eq!(payload.file_format, "txt");
            assert_eq!(payload.file_size, MANUAL.len() as u64);
            assert_eq!(payload.file_path, path.to_string_lossy());
        }
        Ok(())
    }

    #[tokio::test]
    async fn empty_document_indexes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.md");
        fs::write(&path, "   \n")?;
        let (store, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;

        let ids = ingestor
            .ingest(&path, Uuid::new_v4(), &CancellationToken::new())
            .await?;
        assert!(ids.is_empty());
        assert_eq!(store.upsert_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("sheet.xlsx");
        fs::write(&path, "cells")?;
        let (_, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;

        let result = ingestor
            .ingest(&path, Uuid::new_v4(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_between_batches_keeps_flushed_points() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;
        assert!(chunk_text(MANUAL, 60, 0)?.len() > 4);

        let token = CancellationToken::new();
        let model = Arc::new(CancellingModel {
            token: token.clone(),
            after: 2,
            calls: AtomicUsize::new(0),
        });
        let (store, ingestor) = ingestor_with(model, small_options()).await;

        let result = ingestor.ingest(&path, Uuid::new_v4(), &token).await;

        assert!(matches!(result, Err(IngestError::Cancelled { flushed: 4 })));
        assert_eq!(store.point_count("docs").await, 4);
        Ok(())
    }

    #[tokio::test]
    async fn already_cancelled_token_stops_before_extraction() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;
        let (store, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;

        let token = CancellationToken::new();
        token.cancel();
        let result = ingestor.ingest(&path, Uuid::new_v4(), &token).await;

        assert!(matches!(result, Err(IngestError::Cancelled { flushed: 0 })));
        assert_eq!(store.point_count("docs").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingestion_skips_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("manual.txt"), MANUAL)?;
        let (_, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;

        let report = ingestor
            .ingest_folder(dir.path(), &CancellationToken::new())
            .await?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].checksum, digest_file(&dir.path().join("manual.txt"))?);
        assert!(report.point_count() > 0);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }

    #[tokio::test]
    async fn folder_without_documents_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (_, ingestor) =
            ingestor_with(Arc::new(CharacterNgramEmbedder { dimensions: 16 }), small_options())
                .await;

        let result = ingestor
            .ingest_folder(dir.path(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }
}
