pub mod memory;
pub mod qdrant;

pub use memory::MemoryStore;
pub use qdrant::QdrantStore;

use crate::config::{StoreBackend, StoreSettings};
use crate::error::SearchError;
use crate::traits::VectorStore;
use std::sync::Arc;
use std::time::Duration;

pub fn store_from_settings(settings: &StoreSettings) -> Result<Arc<dyn VectorStore>, SearchError> {
    Ok(match settings.backend {
        StoreBackend::Qdrant => Arc::new(QdrantStore::new(
            &settings.url,
            settings.api_key.as_deref(),
            Duration::from_secs(settings.timeout_secs),
        )?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    })
}
