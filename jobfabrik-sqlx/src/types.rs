use chrono::{DateTime, Utc};
use jobfabrik::{
    backend::BackendError,
    job::{JobData, JobKind},
    repository::{JobRunRecord, ScheduleDefinition},
};
use serde_json::Value;
use sqlx::prelude::FromRow;

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub kind: String,
    pub data: Value,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: i32,
    pub fail_reason: Option<String>,
}

impl TryFrom<Job> for jobfabrik::job::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            kind: kind(value.kind)?,
            data: serde_json::from_value(value.data)?,
            repeat_interval: value.repeat_interval,
            repeat_timezone: value.repeat_timezone,
            next_run_at: value.next_run_at,
            last_run_at: value.last_run_at,
            last_finished_at: value.last_finished_at,
            locked_at: value.locked_at,
            failed_at: value.failed_at,
            fail_count: value.fail_count,
            fail_reason: value.fail_reason,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Schedule {
    pub name: String,
    pub job_type: String,
    pub interval: String,
    pub data: Value,
    pub run_only_once: bool,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<Schedule> for ScheduleDefinition {
    type Error = BackendError;

    fn try_from(value: Schedule) -> Result<Self, Self::Error> {
        Ok(Self {
            name: value.name,
            job_type: value.job_type,
            interval: value.interval,
            data: serde_json::from_value::<JobData>(value.data)?,
            run_only_once: value.run_only_once,
            created_by: value.created_by,
            updated_by: value.updated_by,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRun {
    pub name: String,
    pub job_type: String,
    pub interval: Option<String>,
    pub data: Value,
    pub response: Value,
    pub status_code: String,
    pub status_message: String,
    pub started_at: DateTime<Utc>,
    pub processed_by: String,
    pub created_by: String,
}

impl TryFrom<JobRun> for JobRunRecord {
    type Error = BackendError;

    fn try_from(value: JobRun) -> Result<Self, Self::Error> {
        Ok(Self {
            name: value.name,
            job_type: kind(value.job_type)?,
            interval: value.interval,
            data: serde_json::from_value(value.data)?,
            response: value.response,
            status_code: value.status_code,
            status_message: value.status_message,
            started_at: value.started_at,
            processed_by: value.processed_by,
            created_by: value.created_by,
        })
    }
}

fn kind(value: String) -> Result<JobKind, BackendError> {
    Ok(serde_json::from_value(Value::String(value))?)
}
