//! Provides an in memory implementation of [`Backend`].
//!
//! It is designed to be a correct implementation for use in tests and single process setups, not
//! an optimized one.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{Backend, BackendError, CompleteJob, JobCriteria, NewJob, Uniqueness};
use crate::job::{Job, JobId, JobKind};

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every stored record.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .read()
            .map(|jobs| jobs.clone())
            .unwrap_or_default()
    }

    fn find_unique<'a>(jobs: &'a mut [Job], job: &NewJob) -> Option<&'a mut Job> {
        jobs.iter_mut().find(|existing| {
            existing.kind == job.kind
                && match &job.unique {
                    Uniqueness::JobName(name) => existing.job_name() == Some(name.as_str()),
                    Uniqueness::Data(data) => data
                        .iter()
                        .all(|(key, value)| existing.data.get(key) == Some(value)),
                }
        })
    }

    fn update<T>(
        &self,
        id: JobId,
        update: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        jobs.iter_mut()
            .find(|job| job.id == id)
            .map(update)
            .ok_or(BackendError::JobNotFound(id))
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn save(&self, job: NewJob) -> Result<JobId, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if let Some(existing) = Self::find_unique(&mut jobs, &job) {
            existing.data = job.data;
            existing.next_run_at = Some(job.next_run_at);
            existing.repeat_interval = job.repeat_interval;
            existing.repeat_timezone = job.repeat_timezone;
            return Ok(existing.id);
        }
        let id: JobId = (self.id_counter.fetch_add(1, Ordering::SeqCst) + 1).into();
        jobs.push(Job {
            id,
            kind: job.kind,
            data: job.data,
            repeat_interval: job.repeat_interval,
            repeat_timezone: job.repeat_timezone,
            next_run_at: Some(job.next_run_at),
            last_run_at: None,
            last_finished_at: None,
            locked_at: None,
            failed_at: None,
            fail_count: 0,
            fail_reason: None,
        });
        Ok(id)
    }

    async fn find(&self, criteria: &JobCriteria) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| criteria.matches(job))
            .cloned()
            .collect())
    }

    async fn cancel(&self, criteria: &JobCriteria) -> Result<u64, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| !criteria.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn lock_next_due(
        &self,
        kind: JobKind,
        lock_lifetime: TimeDelta,
    ) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let next = jobs
            .iter_mut()
            .filter(|job| job.kind == kind)
            .filter(|job| job.next_run_at.is_some_and(|next_run_at| next_run_at <= now))
            .filter(|job| {
                job.locked_at
                    .map_or(true, |locked_at| locked_at + lock_lifetime < now)
            })
            .min_by_key(|job| job.next_run_at);
        Ok(next.map(|job| {
            job.locked_at = Some(now);
            job.last_run_at = Some(now);
            job.clone()
        }))
    }

    async fn touch(&self, id: JobId) -> Result<(), BackendError> {
        self.update(id, |job| job.locked_at = Some(Utc::now()))
    }

    async fn complete(&self, id: JobId, completion: CompleteJob) -> Result<(), BackendError> {
        self.update(id, |job| {
            job.data = completion.data;
            job.last_finished_at = Some(completion.finished_at);
            job.next_run_at = completion.next_run_at;
            job.locked_at = None;
            if let Some(reason) = completion.failure {
                job.fail_count += 1;
                job.fail_reason = Some(reason);
                job.failed_at = Some(completion.finished_at);
            }
        })
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let count = jobs.len();
        jobs.retain(|job| {
            job.is_recurring()
                || job.next_run_at.is_some()
                || job
                    .last_finished_at
                    .map_or(true, |finished_at| finished_at >= before)
        });
        Ok((count - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::job::{JobData, JOB_NAME_ATTRIB};

    fn new_job(name: &str, next_run_at: DateTime<Utc>) -> NewJob {
        let mut data = JobData::new();
        data.insert(JOB_NAME_ATTRIB.to_owned(), json!(name));
        data.insert("instance_id".to_owned(), json!("abc"));
        NewJob {
            kind: JobKind::ScheduledBackup,
            data,
            next_run_at,
            repeat_interval: Some("*/1 * * * *".to_owned()),
            repeat_timezone: None,
            unique: Uniqueness::JobName(name.to_owned()),
        }
    }

    fn completion(failure: Option<&str>) -> CompleteJob {
        CompleteJob {
            data: JobData::new(),
            finished_at: Utc::now(),
            next_run_at: None,
            failure: failure.map(ToOwned::to_owned),
        }
    }

    #[tokio::test]
    async fn save_replaces_records_with_the_same_name() {
        let backend = InMemoryBackend::new();
        let first = backend
            .save(new_job("abc_ScheduledBackup", Utc::now()))
            .await
            .unwrap();
        let mut replacement = new_job("abc_ScheduledBackup", Utc::now());
        replacement.repeat_interval = Some("daily".to_owned());

        let second = backend.save(replacement).await.unwrap();

        assert_eq!(first, second);
        let jobs = backend.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].repeat_interval.as_deref(), Some("daily"));
    }

    #[tokio::test]
    async fn save_with_data_uniqueness() {
        let backend = InMemoryBackend::new();
        let mut data = JobData::new();
        data.insert("instance_id".to_owned(), json!("abc"));
        let mut job = new_job("abc_ScheduledBackup_1", Utc::now());
        job.unique = Uniqueness::Data(data.clone());
        backend.save(job).await.unwrap();

        let mut duplicate = new_job("abc_ScheduledBackup_2", Utc::now());
        duplicate.unique = Uniqueness::Data(data);
        backend.save(duplicate).await.unwrap();

        let jobs = backend.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name(), Some("abc_ScheduledBackup_2"));
    }

    #[tokio::test]
    async fn lock_next_due_claims_each_record_once() {
        let backend = InMemoryBackend::new();
        backend
            .save(new_job("abc_ScheduledBackup", Utc::now() - TimeDelta::seconds(1)))
            .await
            .unwrap();
        backend
            .save(new_job("later_ScheduledBackup", Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();

        let claimed = backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::minutes(3))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.job_name(), Some("abc_ScheduledBackup"));
        assert!(claimed.locked_at.is_some());
        assert!(backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::minutes(3))
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .lock_next_due(JobKind::BackupReaper, TimeDelta::minutes(3))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_locks_are_reclaimable() {
        let backend = InMemoryBackend::new();
        backend
            .save(new_job("abc_ScheduledBackup", Utc::now() - TimeDelta::seconds(1)))
            .await
            .unwrap();
        backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::minutes(3))
            .await
            .unwrap()
            .unwrap();

        let reclaimed = backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::milliseconds(-1))
            .await
            .unwrap();

        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn complete_releases_the_lock_and_records_failures() {
        let backend = InMemoryBackend::new();
        let id = backend
            .save(new_job("abc_ScheduledBackup", Utc::now()))
            .await
            .unwrap();
        backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::minutes(3))
            .await
            .unwrap();

        backend.complete(id, completion(Some("boom"))).await.unwrap();

        let job = &backend.jobs()[0];
        assert_eq!(job.locked_at, None);
        assert_eq!(job.fail_count, 1);
        assert_eq!(job.fail_reason.as_deref(), Some("boom"));
        assert!(matches!(
            backend.complete(999.into(), completion(None)).await,
            Err(BackendError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_only_removes_finished_one_shots() {
        let backend = InMemoryBackend::new();
        let recurring = backend
            .save(new_job("abc_ScheduledBackup", Utc::now()))
            .await
            .unwrap();
        let mut one_shot = new_job("abc_ScheduledBackup_1", Utc::now());
        one_shot.repeat_interval = None;
        let one_shot = backend.save(one_shot).await.unwrap();
        backend.complete(recurring, completion(None)).await.unwrap();
        backend.complete(one_shot, completion(None)).await.unwrap();

        let purged = backend
            .purge_finished(Utc::now() + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(backend.jobs()[0].id, recurring);
    }
}
