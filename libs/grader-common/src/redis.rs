use crate::store::{JobStore, StoreError};
use crate::types::GradingJob;
use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

/// Redis key semantics for job records
/// Keys are deterministic so lookups and progress streams
/// always address the same document the orchestrator writes

pub const JOB_PREFIX: &str = "grader:job";

/// Generate the record key for a job
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Redis-backed job store
/// One JSON document per job, written with SET EX so each
/// update is atomic and the TTL doubles as retention policy
#[derive(Clone)]
pub struct RedisJobStore {
    conn: redis::aio::ConnectionManager,
    ttl_seconds: u64,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl_seconds })
    }

    async fn write(&self, job: &GradingJob, only_if_absent: bool) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(job_key(&job.id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl_seconds);
        if only_if_absent {
            cmd.arg("NX");
        }

        let mut conn = self.conn.clone();
        // SET NX replies nil when the key already exists
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        if reply.is_none() {
            return Err(StoreError::Duplicate(job.id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &GradingJob) -> Result<(), StoreError> {
        self.write(job, true).await
    }

    async fn get(&self, id: &Uuid) -> Result<Option<GradingJob>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(job_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, job: &GradingJob) -> Result<(), StoreError> {
        self.write(job, false).await
    }
}
