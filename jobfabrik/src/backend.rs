//! The persistent due-job queue.
//!
//! A [`Backend`] stores engine records ([`Job`]) and hands them to poll loops. Claiming a record
//! stamps its lock; [`Backend::complete`] is the single place that lock is released again.
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{Job, JobData, JobId, JobKind};

pub mod memory;

/// How a save decides whether it replaces an existing record.
#[derive(Debug, Clone, PartialEq)]
pub enum Uniqueness {
    /// At most one record of the kind carries this job-name marker.
    JobName(String),
    /// At most one record of the kind carries every one of these data entries.
    Data(JobData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    /// Payload, including the job-name marker.
    pub data: JobData,
    pub next_run_at: DateTime<Utc>,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub unique: Uniqueness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    Exact(String),
    Prefix(String),
}

/// Selects engine records by kind and job-name marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCriteria {
    pub kind: JobKind,
    pub name: NameMatch,
    /// Only match records that still have a next run.
    pub scheduled_only: bool,
}

impl JobCriteria {
    pub fn named(kind: JobKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: NameMatch::Exact(name.into()),
            scheduled_only: false,
        }
    }

    pub fn name_prefix(kind: JobKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            name: NameMatch::Prefix(prefix.into()),
            scheduled_only: true,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        let name_matches = match (&self.name, job.job_name()) {
            (NameMatch::Exact(name), Some(job_name)) => job_name == name,
            (NameMatch::Prefix(prefix), Some(job_name)) => job_name.starts_with(prefix.as_str()),
            (_, None) => false,
        };
        job.kind == self.kind && name_matches && (!self.scheduled_only || job.next_run_at.is_some())
    }
}

/// The outcome of one run, written back when the lock is released.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteJob {
    pub data: JobData,
    pub finished_at: DateTime<Utc>,
    /// `None` for one-shot records, which then count as finished.
    pub next_run_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts the record, or replaces the record matching its [`Uniqueness`].
    async fn save(&self, job: NewJob) -> Result<JobId, BackendError>;
    async fn find(&self, criteria: &JobCriteria) -> Result<Vec<Job>, BackendError>;
    /// Deletes every matching record, returning how many were removed.
    async fn cancel(&self, criteria: &JobCriteria) -> Result<u64, BackendError>;
    /// Claims the earliest due record of `kind` that is unlocked or whose lock is older than
    /// `lock_lifetime`.
    async fn lock_next_due(
        &self,
        kind: JobKind,
        lock_lifetime: TimeDelta,
    ) -> Result<Option<Job>, BackendError>;
    /// Refreshes the lock of a running record.
    async fn touch(&self, id: JobId) -> Result<(), BackendError>;
    async fn complete(&self, id: JobId, completion: CompleteJob) -> Result<(), BackendError>;
    /// Deletes finished one-shot records that last finished before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
}
