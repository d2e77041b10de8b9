//! Intent records and run history.
//!
//! Both live beside the engine records but are never touched by the poll loop: intents are
//! written by [`crate::manager::ScheduleManager`], history by [`crate::job::run::JobRun`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    backend::BackendError,
    job::{JobData, JobKind},
};

pub mod memory;

pub const SYSTEM_USER: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_USER)
    }
}

/// A schedule intent as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub name: String,
    /// The job type, suffixed with a timestamp for one-shot intents.
    pub job_type: String,
    pub interval: String,
    pub data: JobData,
    pub run_only_once: bool,
}

/// A stored schedule intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub job_type: String,
    pub interval: String,
    pub data: JobData,
    pub run_only_once: bool,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt, as appended to the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub name: String,
    pub job_type: JobKind,
    pub interval: Option<String>,
    pub data: JobData,
    pub response: Value,
    pub status_code: String,
    pub status_message: String,
    pub started_at: DateTime<Utc>,
    pub processed_by: String,
    pub created_by: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Inserts the intent, or updates the one with the same name and job type.
    async fn save_schedule(
        &self,
        schedule: NewSchedule,
        user: &User,
    ) -> Result<ScheduleDefinition, BackendError>;
    async fn find_schedule(
        &self,
        name: &str,
        job_type: &str,
    ) -> Result<Option<ScheduleDefinition>, BackendError>;
    async fn delete_schedule(&self, name: &str, job_type: &str) -> Result<u64, BackendError>;
    /// Deletes one-shot intents last updated before `before`.
    async fn purge_one_shot_schedules(&self, before: DateTime<Utc>) -> Result<u64, BackendError>;
    async fn append_run(&self, record: JobRunRecord) -> Result<(), BackendError>;
    /// The most recent runs for a name and kind, newest first.
    async fn recent_runs(
        &self,
        name: &str,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobRunRecord>, BackendError>;
}
