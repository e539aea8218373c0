pub mod answer;
pub mod buffer;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod jobs;
pub mod layout;
pub mod models;
pub mod ocr;
pub mod orchestrator;
pub mod reading_order;
pub mod retriever;
pub mod store;
pub mod stores;
pub mod table;
pub mod traits;

pub use answer::{answer, build_prompt, Answer, CompletionModel, OllamaCompletion};
pub use buffer::IndexingBuffer;
pub use chunking::{chunk_text, normalize_text, normalize_whitespace, split_sentences};
pub use config::{EmbeddingBackend, OcrBackend, PdfMode, Settings, StoreBackend};
pub use embeddings::{
    model_from_settings, CharacterNgramEmbedder, EmbeddingBatcher, EmbeddingModel,
    OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, IngestError, ModelError, SearchError};
pub use extractor::{Extraction, ExtractionContext, FileFormat};
pub use ingest::{discover_files, DocumentIngestor, IngestedDocument, IngestionReport, SkippedFile};
pub use jobs::{IngestionJobs, JobId, JobState, JobStatus};
pub use layout::{LopdfPageSource, PageSource};
pub use models::{
    Chunk, ContentKind, ContentUnit, IndexPoint, IngestionOptions, PointPayload, SearchFilters,
    SearchRequest, SearchResult, TextOrder,
};
pub use ocr::{engine_from_settings, DisabledOcr, HttpOcrEngine, OcrEngine, TesseractOcr};
pub use orchestrator::DocumentService;
pub use reading_order::ReadingOrder;
pub use retriever::NeighborhoodRetriever;
pub use store::{CollectionInfo, PointFilter};
pub use stores::{store_from_settings, MemoryStore, QdrantStore};
pub use traits::VectorStore;
