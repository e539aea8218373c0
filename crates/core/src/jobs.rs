use crate::error::IngestError;
use crate::orchestrator::DocumentService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { point_ids: Vec<Uuid> },
    Failed { error: String },
    Cancelled { flushed: usize },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub document_uuid: Uuid,
    pub path: PathBuf,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    status: JobStatus,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

type JobTable = Arc<RwLock<HashMap<JobId, JobEntry>>>;

pub struct IngestionJobs {
    service: Arc<DocumentService>,
    jobs: JobTable,
}

impl IngestionJobs {
    pub fn new(service: Arc<DocumentService>) -> Self {
        Self {
            service,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts ingesting `path` on the runtime and returns immediately.
    pub async fn submit(&self, path: PathBuf, document_uuid: Option<Uuid>) -> JobId {
        let id = Uuid::new_v4();
        let document_uuid = document_uuid.unwrap_or_else(Uuid::new_v4);
        let cancel = CancellationToken::new();

        self.jobs.write().await.insert(
            id,
            JobEntry {
                status: JobStatus {
                    id,
                    document_uuid,
                    path: path.clone(),
                    state: JobState::Queued,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
                cancel: cancel.clone(),
                handle: None,
            },
        );

        let service = self.service.clone();
        let jobs = self.jobs.clone();
        let handle = tokio::spawn(async move {
            set_state(&jobs, id, JobState::Running).await;
            let outcome = service
                .ingest_with_cancel(&path, document_uuid, &cancel)
                .await;
            let state = match outcome {
                Ok(point_ids) => JobState::Completed { point_ids },
                Err(IngestError::Cancelled { flushed }) => JobState::Cancelled { flushed },
                Err(error) => {
                    warn!(job = %id, path = %path.display(), %error, "ingestion job failed");
                    JobState::Failed {
                        error: error.to_string(),
                    }
                }
            };
            info!(job = %id, state = ?state, "ingestion job finished");
            set_state(&jobs, id, state).await;
        });

        if let Some(entry) = self.jobs.write().await.get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|entry| entry.status.clone())
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobStatus> {
        let mut statuses = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.status.clone())
            .collect::<Vec<_>>();
        statuses.sort_by_key(|status| status.submitted_at);
        statuses
    }

    /// Requests cancellation; returns `false` for unknown or finished jobs.
    pub async fn cancel(&self, id: JobId) -> bool {
        match self.jobs.read().await.get(&id) {
            Some(entry) if !entry.status.state.is_finished() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Forgets finished jobs and returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.status.state.is_finished());
        before - jobs.len()
    }

    /// Waits for the job to finish and returns its final status.
    pub async fn wait(&self, id: JobId) -> Option<JobStatus> {
        let handle = self
            .jobs
            .write()
            .await
            .get_mut(&id)
            .and_then(|entry| entry.handle.take());

        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                set_state(
                    &self.jobs,
                    id,
                    JobState::Failed {
                        error: join_error.to_string(),
                    },
                )
                .await;
            }
        }
        self.status(id).await
    }
}

async fn set_state(jobs: &JobTable, id: JobId, state: JobState) {
    if let Some(entry) = jobs.write().await.get_mut(&id) {
        if state.is_finished() {
            entry.status.finished_at = Some(Utc::now());
        }
        entry.status.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingModel;
    use crate::error::ModelError;
    use crate::ingest::tests::MANUAL;
    use crate::ocr::DisabledOcr;
    use crate::orchestrator::tests::{service_with, test_settings};
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// Announces each call and then holds it until released.
    struct GatedModel {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EmbeddingModel for GatedModel {
        fn name(&self) -> &str {
            "gated"
        }

        fn dimensions(&self) -> usize {
            64
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(texts.iter().map(|_| vec![1.0; 64]).collect())
        }
    }

    async fn jobs() -> IngestionJobs {
        let service = service_with(Arc::new(MemoryStore::new()), &test_settings());
        service
            .ensure_collection()
            .await
            .expect("collection should be created");
        IngestionJobs::new(Arc::new(service))
    }

    #[tokio::test]
    async fn submitted_job_completes_with_point_ids() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;
        let jobs = jobs().await;
        let document = Uuid::new_v4();

        let id = jobs.submit(path.clone(), Some(document)).await;
        let status = jobs.wait(id).await.expect("job should exist");

        assert_eq!(status.document_uuid, document);
        assert_eq!(status.path, path);
        match status.state {
            JobState::Completed { point_ids } => assert!(!point_ids.is_empty()),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(status.finished_at.is_some());
        assert!(!jobs.cancel(id).await, "finished jobs cannot be cancelled");
        assert_eq!(jobs.list().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_job_reports_its_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let jobs = jobs().await;

        let id = jobs.submit(dir.path().join("missing.txt"), None).await;
        let status = jobs.wait(id).await.expect("job should exist");

        assert!(matches!(status.state, JobState::Failed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn running_job_can_be_cancelled() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;

        let mut settings = test_settings();
        settings.embedding.batch_size = 2;
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let service = DocumentService::new(
            &settings,
            Arc::new(MemoryStore::new()),
            Arc::new(GatedModel {
                started: started.clone(),
                release: release.clone(),
            }),
            Arc::new(DisabledOcr),
        );
        service.ensure_collection().await?;
        let jobs = IngestionJobs::new(Arc::new(service));

        let id = jobs.submit(path, None).await;
        started.notified().await;
        assert!(matches!(
            jobs.status(id).await.map(|status| status.state),
            Some(JobState::Running)
        ));
        assert!(jobs.cancel(id).await);
        release.notify_one();

        let status = jobs.wait(id).await.expect("job should exist");
        assert_eq!(status.state, JobState::Cancelled { flushed: 0 });
        Ok(())
    }

    #[tokio::test]
    async fn finished_jobs_can_be_pruned() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        fs::write(&path, MANUAL)?;
        let jobs = jobs().await;

        let id = jobs.submit(path, None).await;
        jobs.wait(id).await;

        assert_eq!(jobs.prune_finished().await, 1);
        assert!(jobs.status(id).await.is_none());
        assert!(jobs.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_job_has_no_status() {
        let jobs = jobs().await;
        let unknown = Uuid::new_v4();
        assert!(jobs.status(unknown).await.is_none());
        assert!(!jobs.cancel(unknown).await);
        assert!(jobs.wait(unknown).await.is_none());
    }

    #[test]
    fn states_serialize_with_a_tag() {
        let value = serde_json::to_value(JobState::Cancelled { flushed: 3 }).expect("serialize");
        assert_eq!(value, serde_json::json!({ "state": "cancelled", "flushed": 3 }));
    }
}
