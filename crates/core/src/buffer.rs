use crate::error::SearchError;
use crate::models::IndexPoint;
use crate::traits::VectorStore;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Accumulates points and writes them to the store in bulk, once per
/// `batch_size` additions.
///
/// A failed write drops the buffered points; nothing is retried.
pub struct IndexingBuffer {
    store: Arc<dyn VectorStore>,
    collection: String,
    batch_size: usize,
    points: Vec<IndexPoint>,
    flushed: Vec<Uuid>,
    flushes: usize,
}

impl IndexingBuffer {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            collection: collection.into(),
            batch_size,
            points: Vec::with_capacity(batch_size),
            flushed: Vec::new(),
            flushes: 0,
        }
    }

    pub async fn add(&mut self, point: IndexPoint) -> Result<(), SearchError> {
        self.points.push(point);
        if self.points.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes everything buffered. The buffer is empty afterwards whether or
    /// not the write succeeded.
    pub async fn flush(&mut self) -> Result<(), SearchError> {
        if self.points.is_empty() {
            return Ok(());
        }

        let points = std::mem::take(&mut self.points);
        match self.store.upsert(&self.collection, &points).await {
            Ok(()) => {
                self.flushes += 1;
                self.flushed.extend(points.iter().map(|point| point.id));
                debug!(
                    collection = %self.collection,
                    points = points.len(),
                    flushes = self.flushes,
                    "bulk write"
                );
                Ok(())
            }
            Err(write_error) => {
                error!(
                    collection = %self.collection,
                    dropped = points.len(),
                    error = %write_error,
                    "bulk write failed; buffered points dropped"
                );
                Err(write_error)
            }
        }
    }

    /// Flushes the remainder, if any.
    pub async fn finalize(&mut self) -> Result<(), SearchError> {
        self.flush().await?;
        debug!(
            collection = %self.collection,
            total = self.flushed.len(),
            flushes = self.flushes,
            "indexing buffer finalized"
        );
        Ok(())
    }

    /// Drops buffered points without writing them; returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.points.len();
        self.points.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        self.points.len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn flushed_ids(&self) -> &[Uuid] {
        &self.flushed
    }

    pub fn into_flushed_ids(self) -> Vec<Uuid> {
        self.flushed
    }
}
