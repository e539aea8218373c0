use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("image crop failed: {0}")]
    ImageCrop(String),

    #[error("table extraction failed: {0}")]
    TableExtraction(String),

    #[error("ocr failed: {0}")]
    Ocr(#[from] ModelError),

    #[error("vector store write failed: {0}")]
    Store(#[from] SearchError),

    #[error("ingestion cancelled after {flushed} points were flushed")]
    Cancelled { flushed: usize },

    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),
}

/// Failures of the model backends: embedding, OCR and text completion.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response from {backend}: {details}")]
    Response { backend: String, details: String },

    #[error("model returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("model returned a {actual}-dimensional vector, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{0} is disabled")]
    Disabled(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("collection {0} does not exist")]
    MissingCollection(String),

    #[error("collection {collection} stores {actual}-dimensional vectors, the embedding model produces {expected}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("vector store unavailable: {0}")]
    Store(#[from] SearchError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
