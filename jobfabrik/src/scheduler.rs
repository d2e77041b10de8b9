//! The process-level scheduler.
//!
//! A [`Scheduler`] starts out [`SchedulerState::Uninitialized`] and becomes usable once the
//! database reports itself operational on the [`EventBus`]. Every public operation fails with
//! [`JobFabrikError::ServiceUnavailable`] until then.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::{
    sync::{broadcast::error::RecvError, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, JobCriteria, NewJob, Uniqueness},
    catalog::JobCatalog,
    config::SchedulerConfig,
    interval::{self, RepeatInterval},
    job::{without_marker, JobAttributes, JobData, JobKind, JOB_NAME_ATTRIB, TIMEZONE_ATTRIB},
    notifier::{Event, EventBus},
    repository::Repository,
    JobFabrikError, Result,
};

pub(crate) mod poller;

/// Finished one-shot records older than this are purged.
pub const FINISHED_JOBS_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    InitFailed,
    Ready,
}

/// A cloneable handle onto the scheduler of this process.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    backend: Arc<dyn Backend>,
    repository: Arc<dyn Repository>,
    catalog: Arc<JobCatalog>,
    bus: EventBus,
    state: RwLock<SchedulerState>,
    poller: Mutex<Option<CancellationToken>>,
    wake: Notify,
    clock: AtomicI64,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn Backend>,
        repository: Arc<dyn Repository>,
        catalog: Arc<JobCatalog>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                repository,
                catalog,
                bus,
                state: RwLock::new(SchedulerState::Uninitialized),
                poller: Mutex::new(None),
                wake: Notify::new(),
                clock: AtomicI64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SchedulerState) {
        *self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repository
    }

    pub(crate) fn catalog(&self) -> &JobCatalog {
        &self.inner.catalog
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribes to readiness events. Returns `None`, and never becomes ready, when no job
    /// types are enabled.
    pub fn listen(&self) -> Option<JoinHandle<()>> {
        if self.inner.config.job_types.is_empty() {
            tracing::warn!("No job types enabled, the scheduler will not be started");
            return None;
        }
        let mut events = self.inner.bus.subscribe();
        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::DbOperational) => scheduler.initialize(),
                    Ok(Event::DbInitFailed) => {
                        tracing::error!("Database initialization failed, scheduler unavailable");
                        scheduler.set_state(SchedulerState::InitFailed);
                    }
                    Ok(Event::AppShuttingDown) => {
                        scheduler.shutdown();
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Scheduler missed {skipped} events")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Scheduler stopped listening for events");
        }))
    }

    /// Marks the scheduler ready and starts the poll loop when this process hosts one.
    pub fn initialize(&self) {
        {
            let mut state = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != SchedulerState::Uninitialized {
                tracing::debug!(state = ?*state, "Scheduler already initialized");
                return;
            }
            *state = SchedulerState::Ready;
        }
        if self.inner.config.run_poll_loop {
            let token = CancellationToken::new();
            *self
                .inner
                .poller
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
            poller::Poller::spawn(self.clone(), token);
            tracing::info!(
                job_types = ?self.inner.config.job_types,
                "Poll loop started"
            );
        }
        self.inner.bus.publish(Event::SchedulerStarted);
        tracing::info!("Scheduler ready");
        self.inner.bus.publish(Event::SchedulerReady);
    }

    /// Stops the poll loop. Runs already claimed finish normally.
    pub fn shutdown(&self) {
        let token = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            tracing::info!("Stopping poll loop");
            token.cancel();
        }
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.inner.wake
    }

    fn ensure_ready(&self, name: &str, kind: JobKind) -> Result<()> {
        match self.state() {
            SchedulerState::Ready => Ok(()),
            state => Err(JobFabrikError::ServiceUnavailable(format!(
                "Scheduler is {state:?}, cannot process {name}_{kind}"
            ))),
        }
    }

    fn ensure_enabled(&self, kind: JobKind) -> Result<()> {
        if self.inner.config.is_enabled(kind) {
            Ok(())
        } else {
            Err(JobFabrikError::ServiceUnavailable(format!(
                "Job type {kind} is not enabled"
            )))
        }
    }

    /// Milliseconds since the epoch, strictly increasing across calls.
    pub(crate) fn timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .inner
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    /// Schedules a recurring job. `interval` is a cron expression or a human readable duration.
    pub async fn schedule(
        &self,
        name: &str,
        kind: JobKind,
        interval: &str,
        data: JobData,
    ) -> Result<Option<JobAttributes>> {
        self.ensure_ready(name, kind)?;
        let repeat = RepeatInterval::parse(interval)?;
        self.ensure_enabled(kind)?;
        let mut data = without_marker(&data);
        let timezone = match data.remove(TIMEZONE_ATTRIB) {
            Some(Value::String(timezone)) => Some(interval::parse_timezone(&timezone)?),
            Some(other) => {
                return Err(JobFabrikError::BadRequest(format!(
                    "Invalid timezone - {other}"
                )))
            }
            None => None,
        };
        let next_run_at = repeat.next_after(Utc::now(), timezone).ok_or_else(|| {
            JobFabrikError::BadRequest(format!("Interval {interval} has no upcoming run"))
        })?;
        let job_name = format!("{name}_{kind}");
        tracing::info!(%job_name, %interval, "Scheduling job {job_name}");
        data.insert(JOB_NAME_ATTRIB.to_owned(), Value::String(job_name.clone()));
        self.inner
            .backend
            .save(NewJob {
                kind,
                data,
                next_run_at,
                repeat_interval: Some(interval.to_owned()),
                repeat_timezone: timezone.map(|timezone| timezone.name().to_owned()),
                unique: Uniqueness::JobName(job_name),
            })
            .await?;
        self.get_job(name, kind).await
    }

    /// Schedules a one-shot run at `when`. With `avoid_duplicates` a pending one-shot carrying
    /// identical data is replaced instead of a second one being added.
    pub async fn run_at(
        &self,
        name: &str,
        kind: JobKind,
        when: &str,
        data: JobData,
        avoid_duplicates: bool,
    ) -> Result<Option<JobAttributes>> {
        self.ensure_ready(name, kind)?;
        self.ensure_enabled(kind)?;
        let next_run_at = interval::resolve_run_at(when, Utc::now())?;
        let when: String = when.split_whitespace().collect();
        let job_name = format!("{name}_{kind}_{when}_{}", self.timestamp());
        tracing::info!(%job_name, %next_run_at, "Scheduling one-shot job {job_name}");
        let mut data = without_marker(&data);
        let unique = if avoid_duplicates {
            Uniqueness::Data(data.clone())
        } else {
            Uniqueness::JobName(job_name.clone())
        };
        data.insert(JOB_NAME_ATTRIB.to_owned(), Value::String(job_name.clone()));
        self.save_one_shot(kind, job_name, data, next_run_at, unique)
            .await
    }

    /// Queues a one-shot run for immediate execution.
    pub async fn run_now(
        &self,
        name: &str,
        kind: JobKind,
        data: JobData,
    ) -> Result<Option<JobAttributes>> {
        self.ensure_ready(name, kind)?;
        self.ensure_enabled(kind)?;
        let job_name = format!("{name}_{kind}_{}", self.timestamp());
        tracing::info!(%job_name, "Running job {job_name} now");
        let mut data = without_marker(&data);
        data.insert(JOB_NAME_ATTRIB.to_owned(), Value::String(job_name.clone()));
        let attributes = self
            .save_one_shot(
                kind,
                job_name.clone(),
                data,
                Utc::now(),
                Uniqueness::JobName(job_name),
            )
            .await?;
        self.inner.wake.notify_one();
        Ok(attributes)
    }

    async fn save_one_shot(
        &self,
        kind: JobKind,
        job_name: String,
        data: JobData,
        next_run_at: chrono::DateTime<Utc>,
        unique: Uniqueness,
    ) -> Result<Option<JobAttributes>> {
        self.inner
            .backend
            .save(NewJob {
                kind,
                data,
                next_run_at,
                repeat_interval: None,
                repeat_timezone: None,
                unique,
            })
            .await?;
        let saved = self
            .inner
            .backend
            .find(&JobCriteria::named(kind, job_name))
            .await?;
        Ok(saved.first().map(|job| job.attributes()))
    }

    /// The recurring record for `name`, with `next_run_at` reporting the earliest pending run
    /// across it and its one-shot follow-ups.
    pub async fn get_job(&self, name: &str, kind: JobKind) -> Result<Option<JobAttributes>> {
        self.ensure_ready(name, kind)?;
        let job_name = format!("{name}_{kind}");
        let jobs = self
            .inner
            .backend
            .find(&JobCriteria::name_prefix(kind, job_name.as_str()))
            .await?;
        let Some(scheduled) = jobs
            .iter()
            .find(|job| job.job_name() == Some(job_name.as_str()))
        else {
            return Ok(None);
        };
        let mut attributes = scheduled.attributes();
        attributes.next_run_at = jobs.iter().filter_map(|job| job.next_run_at).min();
        Ok(Some(attributes))
    }

    /// Removes the recurring record for `name`. A run already in flight is not interrupted.
    pub async fn cancel_job(&self, name: &str, kind: JobKind) -> Result<u64> {
        self.ensure_ready(name, kind)?;
        let job_name = format!("{name}_{kind}");
        let cancelled = self
            .inner
            .backend
            .cancel(&JobCriteria::named(kind, job_name.as_str()))
            .await?;
        tracing::info!(%job_name, cancelled, "Cancelled job {job_name}");
        Ok(cancelled)
    }

    pub async fn purge_old_finished_jobs(&self) -> Result<u64> {
        let before = Utc::now() - TimeDelta::days(FINISHED_JOBS_RETENTION_DAYS);
        let purged = self.inner.backend.purge_finished(before).await?;
        tracing::info!(purged, "Purged {purged} finished jobs");
        Ok(purged)
    }
}
