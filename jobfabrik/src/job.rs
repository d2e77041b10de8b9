use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JobFabrikError;

pub mod run;

/// Key of the job-name marker stored inside every engine record's data.
pub const JOB_NAME_ATTRIB: &str = "_n_a_m_e_";

/// Data key a caller may set to have a recurring job evaluated in an IANA timezone.
pub const TIMEZONE_ATTRIB: &str = "timeZone";

/// Opaque job payload.
pub type JobData = serde_json::Map<String, Value>;

/// The closed set of job types the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "ScheduledBackup")]
    ScheduledBackup,
    #[serde(rename = "BackupReaper")]
    BackupReaper,
    #[serde(rename = "OperationStatusPoller")]
    OperationStatusPoller,
    #[serde(rename = "ServiceInstanceAutoUpdate")]
    ServiceInstanceUpdate,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ScheduledBackup,
        JobKind::BackupReaper,
        JobKind::OperationStatusPoller,
        JobKind::ServiceInstanceUpdate,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledBackup => "ScheduledBackup",
            Self::BackupReaper => "BackupReaper",
            Self::OperationStatusPoller => "OperationStatusPoller",
            Self::ServiceInstanceUpdate => "ServiceInstanceAutoUpdate",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobFabrikError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| JobFabrikError::BadRequest(format!("Unknown job type {value}")))
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// An engine record: the queue's runtime bookkeeping for one schedulable entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub data: JobData,
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

impl Job {
    /// The `{name}_{kind}` marker the record was saved under.
    pub fn job_name(&self) -> Option<&str> {
        self.data.get(JOB_NAME_ATTRIB).and_then(Value::as_str)
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }

    pub fn attributes(&self) -> JobAttributes {
        JobAttributes {
            name: self.kind.to_string(),
            next_run_at: self.next_run_at,
            repeat_interval: self.repeat_interval.clone(),
            repeat_timezone: self.repeat_timezone.clone(),
            last_run_at: self.last_run_at,
            locked_at: self.locked_at,
            failed_at: self.failed_at,
            fail_count: self.fail_count,
            fail_reason: self.fail_reason.clone(),
            data: without_marker(&self.data),
        }
    }
}

/// The caller-facing projection of an engine record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAttributes {
    pub name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: i32,
    pub fail_reason: Option<String>,
    pub data: JobData,
}

pub fn without_marker(data: &JobData) -> JobData {
    let mut data = data.clone();
    data.remove(JOB_NAME_ATTRIB);
    data
}
