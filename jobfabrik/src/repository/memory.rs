//! Provides an in memory implementation of [`Repository`].
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobRunRecord, NewSchedule, Repository, ScheduleDefinition, User};
use crate::{backend::BackendError, job::JobKind};

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    schedules: Arc<RwLock<Vec<ScheduleDefinition>>>,
    runs: Arc<RwLock<Vec<JobRunRecord>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedules(&self) -> Vec<ScheduleDefinition> {
        self.schedules
            .read()
            .map(|schedules| schedules.clone())
            .unwrap_or_default()
    }

    /// Every appended run, oldest first.
    pub fn runs(&self) -> Vec<JobRunRecord> {
        self.runs.read().map(|runs| runs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_schedule(
        &self,
        schedule: NewSchedule,
        user: &User,
    ) -> Result<ScheduleDefinition, BackendError> {
        let now = Utc::now();
        let mut schedules = self.schedules.write().map_err(|_| BackendError::BadState)?;
        if let Some(existing) = schedules
            .iter_mut()
            .find(|existing| existing.name == schedule.name && existing.job_type == schedule.job_type)
        {
            existing.interval = schedule.interval;
            existing.data = schedule.data;
            existing.run_only_once = schedule.run_only_once;
            existing.updated_by = user.name.clone();
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let definition = ScheduleDefinition {
            name: schedule.name,
            job_type: schedule.job_type,
            interval: schedule.interval,
            data: schedule.data,
            run_only_once: schedule.run_only_once,
            created_by: user.name.clone(),
            updated_by: user.name.clone(),
            created_at: now,
            updated_at: now,
        };
        schedules.push(definition.clone());
        Ok(definition)
    }

    async fn find_schedule(
        &self,
        name: &str,
        job_type: &str,
    ) -> Result<Option<ScheduleDefinition>, BackendError> {
        Ok(self
            .schedules
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|schedule| schedule.name == name && schedule.job_type == job_type)
            .cloned())
    }

    async fn delete_schedule(&self, name: &str, job_type: &str) -> Result<u64, BackendError> {
        let mut schedules = self.schedules.write().map_err(|_| BackendError::BadState)?;
        let count = schedules.len();
        schedules.retain(|schedule| !(schedule.name == name && schedule.job_type == job_type));
        Ok((count - schedules.len()) as u64)
    }

    async fn purge_one_shot_schedules(&self, before: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut schedules = self.schedules.write().map_err(|_| BackendError::BadState)?;
        let count = schedules.len();
        schedules.retain(|schedule| !(schedule.run_only_once && schedule.updated_at < before));
        Ok((count - schedules.len()) as u64)
    }

    async fn append_run(&self, record: JobRunRecord) -> Result<(), BackendError> {
        self.runs
            .write()
            .map_err(|_| BackendError::BadState)?
            .push(record);
        Ok(())
    }

    async fn recent_runs(
        &self,
        name: &str,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobRunRecord>, BackendError> {
        Ok(self
            .runs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .rev()
            .filter(|run| run.name == name && run.job_type == kind)
            .take(limit)
            .cloned()
            .collect())
    }
}
