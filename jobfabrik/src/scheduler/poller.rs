use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use super::Scheduler;
use crate::{
    backend::CompleteJob,
    interval::{self, RepeatInterval},
    job::{
        run::{append_history, run_record, JobRun},
        Job, JobData, JobKind,
    },
    repository::User,
    JobFabrikError,
};

const ERROR_CODE_PANIC: &str = "ERR_JOB_PANICKED";

/// Claims due records and runs them, bounded by a global and a per-kind concurrency limit.
pub(crate) struct Poller {
    scheduler: Scheduler,
    token: CancellationToken,
    global: Arc<Semaphore>,
    per_kind: HashMap<JobKind, Arc<Semaphore>>,
}

impl Poller {
    pub(crate) fn spawn(scheduler: Scheduler, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let config = scheduler.config();
        let global = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let per_kind = config
            .job_types
            .iter()
            .map(|kind| (*kind, Arc::new(Semaphore::new(config.default_concurrency.max(1)))))
            .collect();
        let poller = Self {
            scheduler,
            token,
            global,
            per_kind,
        };
        tokio::spawn(poller.run())
    }

    async fn run(self) {
        let every = match self.scheduler.config().poll_interval() {
            Ok(every) => every,
            Err(err) => {
                tracing::error!(?err, "Invalid poll interval, falling back to one minute");
                Duration::from_secs(60)
            }
        };
        loop {
            self.process_due().await;
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(every) => {},
                _ = self.scheduler.wake().notified() => {},
            }
        }
        tracing::info!("Poll loop stopped");
    }

    async fn process_due(&self) {
        let lock_lifetime = self.scheduler.config().lock_lifetime();
        for (kind, slots) in &self.per_kind {
            loop {
                if self.token.is_cancelled() {
                    return;
                }
                let Ok(global) = self.global.clone().try_acquire_owned() else {
                    tracing::debug!("Concurrency limit reached");
                    return;
                };
                let Ok(local) = slots.clone().try_acquire_owned() else {
                    break;
                };
                match self
                    .scheduler
                    .backend()
                    .lock_next_due(*kind, lock_lifetime)
                    .await
                {
                    Ok(Some(job)) => {
                        let scheduler = self.scheduler.clone();
                        tokio::spawn(async move {
                            execute_job(scheduler, job).await;
                            drop((global, local));
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(?err, %kind, "Failed to claim due {kind} job");
                        break;
                    }
                }
            }
        }
    }
}

/// Runs a claimed record to completion and releases its lock exactly once.
#[instrument(skip_all, fields(job_id = %job.id, job_type = %job.kind))]
pub(crate) async fn execute_job(scheduler: Scheduler, mut job: Job) {
    let job_id = job.id;
    let started_at = Utc::now();
    prepare_attempt(&mut job.data, started_at);
    let snapshot = job.clone();
    let runnable = scheduler.catalog().get(job.kind);
    let run = JobRun::new(job, started_at, scheduler.clone());

    tracing::debug!(%job_id, "Executing job {job_id}");
    let result = tokio::spawn(async move { runnable.run(run).await }.in_current_span()).await;
    let (data, failure) = match result {
        Ok(completion) => completion.into_parts(),
        Err(error) => {
            let error = panic_error(error);
            tracing::error!(?error, %job_id, "Job {job_id} panicked");
            let record = run_record(
                &snapshot,
                started_at,
                Value::Null,
                error.status_code(),
                error.to_string(),
                &User::system(),
            );
            append_history(scheduler.repository().as_ref(), record).await;
            (snapshot.data.clone(), Some(error.to_string()))
        }
    };

    let finished_at = Utc::now();
    let completion = CompleteJob {
        data,
        finished_at,
        next_run_at: next_run_at(&snapshot, finished_at),
        failure,
    };
    match scheduler.backend().complete(job_id, completion).await {
        Ok(()) => tracing::debug!(%job_id, "Released job {job_id}"),
        Err(crate::backend::BackendError::JobNotFound(_)) => {
            tracing::debug!(%job_id, "Job {job_id} was cancelled while running")
        }
        Err(err) => tracing::error!(?err, %job_id, "Failed to release job {job_id}"),
    }
}

/// Starts the attempt counter of a fresh run.
fn prepare_attempt(data: &mut JobData, started_at: DateTime<Utc>) {
    let first_attempt = match data.get("attempt") {
        None => true,
        Some(attempt) => attempt.as_u64() == Some(1),
    };
    if first_attempt {
        data.insert("attempt".to_owned(), Value::from(1));
        data.insert(
            "firstAttemptAt".to_owned(),
            Value::String(started_at.to_rfc3339()),
        );
    }
}

fn next_run_at(job: &Job, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let repeat_interval = job.repeat_interval.as_deref()?;
    let timezone = job
        .repeat_timezone
        .as_deref()
        .and_then(|timezone| interval::parse_timezone(timezone).ok());
    match RepeatInterval::parse(repeat_interval) {
        Ok(repeat) => repeat.next_after(finished_at, timezone),
        Err(err) => {
            tracing::error!(?err, job_id = %job.id, "Stored interval is invalid");
            None
        }
    }
}

fn panic_error(error: JoinError) -> JobFabrikError {
    let fallback = error.to_string();
    let message = match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    };
    JobFabrikError::Operation {
        code: ERROR_CODE_PANIC.to_owned(),
        message,
    }
}
