use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Everything a job sees about the fire it is running for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub trigger_id: String,
    pub fire_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    /// Copy of the job's data map taken at fire time.
    pub data: BTreeMap<String, String>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        trigger_id: impl Into<String>,
        fire_id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        data: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            trigger_id: trigger_id.into(),
            fire_id: fire_id.into(),
            scheduled_at,
            fired_at,
            data,
            cancel,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Like [`get`](Self::get) but a missing key is a job failure.
    pub fn require(&self, key: &str) -> JobResult<&str> {
        self.get(key)
            .ok_or_else(|| JobError::Failed(format!("missing job data key '{key}'")))
    }

    /// Set when the fire timed out, was cancelled, or the scheduler is
    /// shutting down. Jobs should poll this (or await [`cancelled`]) at
    /// convenient points and return early.
    ///
    /// [`cancelled`]: Self::cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    /// The job observed its cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type JobResult<T = ()> = std::result::Result<T, JobError>;

/// An executable unit of work, resolved by job type at fire time.
///
/// Implementations must be cheap to share: one instance serves every fire of
/// every job with the same type, possibly concurrently.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobResult;
}
