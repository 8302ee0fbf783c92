use crate::types::GradingJob;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job {0} already exists")]
    Duplicate(Uuid),
}

/// Job record persistence
///
/// Every write replaces the whole record at once, so readers
/// observe either the previous or the next milestone, never a mix.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job
    async fn create(&self, job: &GradingJob) -> Result<(), StoreError>;

    async fn get(&self, id: &Uuid) -> Result<Option<GradingJob>, StoreError>;

    /// Replace the stored record with `job`
    async fn put(&self, job: &GradingJob) -> Result<(), StoreError>;
}

/// In-process store for tests and single-node deployments
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, GradingJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &GradingJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<GradingJob>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn put(&self, job: &GradingJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryJobStore::new();
        let mut job = GradingJob::new(Uuid::new_v4());
        store.create(&job).await.unwrap();

        job.mark_running().unwrap();
        job.append_log("[PHASE] Initializing grading environment...");
        store.put(&job).await.unwrap();

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.log, job.log);
    }

    #[tokio::test]
    async fn test_memory_store_missing_job() {
        let store = MemoryJobStore::new();
        assert!(store.get(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicate_create() {
        let store = MemoryJobStore::new();
        let job = GradingJob::new(Uuid::new_v4());
        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await,
            Err(StoreError::Duplicate(id)) if id == job.id
        ));
    }
}
