use crate::error::ConfigError;
use crate::models::{IngestionOptions, SearchRequest, TextOrder};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "CONTEXT_SEARCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub ocr: OcrSettings,
    pub processing: ProcessingSettings,
    pub search: SearchSettings,
    pub completion: CompletionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Qdrant,
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: "documents".to_string(),
            timeout_secs: 30,
        }
    }
}

/// `memory` keeps points in process and loses them on exit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Ngram,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub url: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Ngram,
            url: "http://localhost:11434".to_string(),
            model: "bge-m3".to_string(),
            dimensions: 1024,
            batch_size: 32,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackend {
    Tesseract,
    Http,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcrSettings {
    pub backend: OcrBackend,
    pub language: String,
    pub tesseract_binary: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            backend: OcrBackend::Tesseract,
            language: "eng".to_string(),
            tesseract_binary: "tesseract".to_string(),
            endpoint: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PdfMode {
    #[default]
    Layout,
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Number of points buffered before a bulk write.
    pub batch_size: usize,
    pub pdf_mode: PdfMode,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 100,
            batch_size: 100,
            pdf_mode: PdfMode::Layout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    pub limit: usize,
    pub score_threshold: f32,
    pub neighbor_window: u64,
    pub text_order: TextOrder,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            limit: 5,
            score_threshold: 0.7,
            neighbor_window: 2,
            text_order: TextOrder::Chunk,
        }
    }
}

impl SearchSettings {
    pub fn request(&self) -> SearchRequest {
        SearchRequest {
            limit: self.limit,
            score_threshold: self.score_threshold,
            filters: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompletionSettings {
    pub url: String,
    pub model: String,
    pub prompt: String,
    pub timeout_secs: u64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            prompt: "Answer the question using only the context below.\n\nContext:\n{context}\n\nQuestion: {query}\nAnswer:".to_string(),
            timeout_secs: 120,
        }
    }
}

impl Settings {
    /// Loads settings from `path` (when given) and `CONTEXT_SEARCH_*` variables,
    /// e.g. `CONTEXT_SEARCH_STORE__URL`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.processing.chunk_size,
            chunk_overlap: self.processing.chunk_overlap,
            write_batch_size: self.processing.batch_size,
            embed_batch_size: self.embedding.batch_size,
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let processing = &self.processing;
        if processing.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "processing.chunk_size must be greater than zero".to_string(),
            ));
        }
        if processing.chunk_overlap >= processing.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "processing.chunk_overlap ({}) must be smaller than processing.chunk_size ({})",
                processing.chunk_overlap, processing.chunk_size
            )));
        }
        if processing.batch_size == 0 || self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be greater than zero".to_string(),
            ));
        }
        if self.store.collection.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "store.collection must not be empty".to_string(),
            ));
        }
        if self.ocr.backend == OcrBackend::Http && self.ocr.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "ocr.endpoint is required for the http OCR backend".to_string(),
            ));
        }
        Ok(())
    }
}
