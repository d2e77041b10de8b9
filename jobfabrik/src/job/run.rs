use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    job::{without_marker, Job, JobData, JobKind, JOB_NAME_ATTRIB},
    manager::ScheduleManager,
    repository::{JobRunRecord, Repository, User},
    scheduler::Scheduler,
    supervisor::WORKER_ENV,
    JobFabrikError, STATUS_SUCCEEDED,
};

/// Proof that a run was finalized through [`JobRun::succeeded`] or [`JobRun::failed`].
///
/// The poll loop releases the record's lock with the data and failure it carries.
#[derive(Debug)]
#[must_use = "the completion must be returned to the poll loop"]
pub struct Completion {
    data: JobData,
    failure: Option<String>,
}

impl Completion {
    pub(crate) fn into_parts(self) -> (JobData, Option<String>) {
        (self.data, self.failure)
    }
}

/// The envelope handed to a [`crate::catalog::Runnable`] for one run of an engine record.
pub struct JobRun {
    job: Job,
    started_at: DateTime<Utc>,
    scheduler: Scheduler,
    user: User,
}

impl JobRun {
    pub(crate) fn new(job: Job, started_at: DateTime<Utc>, scheduler: Scheduler) -> Self {
        Self {
            job,
            started_at,
            scheduler,
            user: User::system(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind
    }

    pub fn data(&self) -> &JobData {
        &self.job.data
    }

    /// Changes made here are persisted on the record when the run completes.
    pub fn data_mut(&mut self) -> &mut JobData {
        &mut self.job.data
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn schedules(&self) -> ScheduleManager {
        ScheduleManager::new(self.scheduler.clone())
    }

    /// Refreshes the record's lock so a long run is not reclaimed by another poll loop.
    pub async fn touch(&self) {
        let job_id = self.job.id;
        let _ = self
            .scheduler
            .backend()
            .touch(job_id)
            .await
            .inspect_err(|err| tracing::warn!(?err, %job_id, "Failed to touch job {job_id}"));
    }

    pub async fn succeeded(self, response: Value) -> Completion {
        let job_id = self.job.id;
        tracing::info!(%job_id, job_type = %self.job.kind, "Job {job_id} succeeded");
        let record = run_record(
            &self.job,
            self.started_at,
            response,
            STATUS_SUCCEEDED.to_owned(),
            "run successful".to_owned(),
            &self.user,
        );
        append_history(self.scheduler.repository().as_ref(), record).await;
        Completion {
            data: self.job.data,
            failure: None,
        }
    }

    pub async fn failed(self, error: &JobFabrikError, response: Value) -> Completion {
        let job_id = self.job.id;
        tracing::error!(?error, %job_id, job_type = %self.job.kind, "Job {job_id} failed: {error}");
        let record = run_record(
            &self.job,
            self.started_at,
            response,
            error.status_code(),
            error.to_string(),
            &self.user,
        );
        append_history(self.scheduler.repository().as_ref(), record).await;
        Completion {
            data: self.job.data,
            failure: Some(error.to_string()),
        }
    }
}

/// Identity of the current worker, for observability only.
pub fn process_id() -> String {
    let role = std::env::var(WORKER_ENV)
        .map(|sequence| format!("worker-{sequence}"))
        .unwrap_or_else(|_| "main".to_owned());
    format!("{role}-{}", std::process::id())
}

/// The name run history is filed under: the resource the job acts on when there is one.
pub(crate) fn history_name(kind: JobKind, data: &JobData) -> String {
    ["instance_id", "deployment_name", JOB_NAME_ATTRIB]
        .into_iter()
        .find_map(|key| data.get(key).and_then(Value::as_str))
        .map_or_else(|| kind.to_string(), ToOwned::to_owned)
}

pub(crate) fn run_record(
    job: &Job,
    started_at: DateTime<Utc>,
    response: Value,
    status_code: String,
    status_message: String,
    user: &User,
) -> JobRunRecord {
    JobRunRecord {
        name: history_name(job.kind, &job.data),
        job_type: job.kind,
        interval: job.repeat_interval.clone(),
        data: without_marker(&job.data),
        response,
        status_code,
        status_message,
        started_at,
        processed_by: process_id(),
        created_by: user.name.clone(),
    }
}

/// Appends a history record. Failures are logged and never propagated.
pub(crate) async fn append_history(repository: &dyn Repository, record: JobRunRecord) {
    let name = record.name.clone();
    let _ = repository.append_run(record).await.inspect_err(|err| {
        tracing::error!(?err, %name, "Failed to append run history for {name}")
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        backend::Backend,
        job::JobKind,
        testing::{Harness, TestServices},
    };

    #[tokio::test]
    async fn succeeded_appends_a_history_record() {
        let harness = Harness::ready(TestServices::default());
        let mut data = JobData::new();
        data.insert("instance_id".to_owned(), json!("abc"));
        let job = harness.claim(JobKind::ScheduledBackup, data).await;
        let run = JobRun::new(job, Utc::now(), harness.scheduler.clone());

        let (data, failure) = run.succeeded(json!({"ok": true})).await.into_parts();

        assert_eq!(failure, None);
        assert!(data.contains_key(JOB_NAME_ATTRIB));
        let runs = harness.repository.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "abc");
        assert_eq!(runs[0].status_code, STATUS_SUCCEEDED);
        assert!(!runs[0].data.contains_key(JOB_NAME_ATTRIB));
    }

    #[tokio::test]
    async fn failed_keeps_the_partial_response() {
        let harness = Harness::ready(TestServices::default());
        let job = harness
            .claim(JobKind::BackupReaper, JobData::new())
            .await;
        let run = JobRun::new(job, Utc::now(), harness.scheduler.clone());
        let error = JobFabrikError::Conflict("locked".to_owned());

        let (_, failure) = run
            .failed(&error, json!({"deleted_guids": ["a"]}))
            .await
            .into_parts();

        assert_eq!(failure.as_deref(), Some("Conflict: locked"));
        let runs = harness.repository.runs();
        assert_eq!(runs[0].status_code, "ERR_CONFLICT");
        assert_eq!(runs[0].response, json!({"deleted_guids": ["a"]}));
    }

    #[tokio::test]
    async fn touch_refreshes_the_lock() {
        let harness = Harness::ready(TestServices::default());
        let job = harness
            .claim(JobKind::BackupReaper, JobData::new())
            .await;
        let locked_at = job.locked_at;
        let run = JobRun::new(job, Utc::now(), harness.scheduler.clone());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        run.touch().await;

        let stored = harness
            .backend
            .find(&crate::backend::JobCriteria::named(
                JobKind::BackupReaper,
                run.job().job_name().unwrap(),
            ))
            .await
            .unwrap();
        assert!(stored[0].locked_at > locked_at);
    }

    #[test]
    fn history_name_prefers_the_resource() {
        let mut data = JobData::new();
        data.insert(JOB_NAME_ATTRIB.to_owned(), json!("reaper_BackupReaper"));
        assert_eq!(
            history_name(JobKind::BackupReaper, &data),
            "reaper_BackupReaper"
        );
        data.insert("deployment_name".to_owned(), json!("service-fabrik-0001"));
        assert_eq!(
            history_name(JobKind::BackupReaper, &data),
            "service-fabrik-0001"
        );
        assert_eq!(
            history_name(JobKind::BackupReaper, &JobData::new()),
            "BackupReaper"
        );
    }
}
