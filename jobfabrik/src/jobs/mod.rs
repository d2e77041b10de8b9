//! The maintenance jobs registered in the [`crate::catalog::JobCatalog`].
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::Value;

use crate::{
    backoff::{self, BackoffStrategy, Constant, Jitter},
    config::UntrackedCondition,
    job::{run::JobRun, without_marker, JobData, JobKind},
    manager::ScheduleManager,
    repository::User,
    services::ResourceDirectory,
    JobFabrikError, Result,
};

mod backup_reaper;
mod operation_status_poller;
mod schedule_backup;
mod service_instance_update;

pub use backup_reaper::BackupReaperJob;
pub use operation_status_poller::OperationStatusPollerJob;
pub use schedule_backup::ScheduleBackupJob;
pub use service_instance_update::{
    DiffTransition, ServiceInstanceUpdateJob, UpdateRunStatus, UpdateState,
};

/// Deletions between two refreshes of the run's lock.
const TOUCH_EVERY: usize = 30;
const RESCHEDULE_ATTEMPTS: u16 = 3;
const RESCHEDULE_BACKOFF_MS: i64 = 500;

/// A non-empty string entry of the job data.
fn required_str<'a>(data: &'a JobData, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn data_u64(data: &JobData, key: &str) -> Option<u64> {
    data.get(key).and_then(Value::as_u64)
}

/// The current attempt as stamped by the poll loop.
fn attempt(data: &JobData) -> u64 {
    data_u64(data, "attempt").unwrap_or(1)
}

/// Waits before the `ordinal`th deletion of a sweep and keeps the lock alive on long sweeps.
async fn pace(run: &JobRun, ordinal: usize, delay_ms: u64) {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    if ordinal % TOUCH_EVERY == 0 {
        run.touch().await;
    }
}

/// Looks the resource up in the directory. A NotFound answer means it was deleted.
async fn is_instance_deleted(directory: &dyn ResourceDirectory, instance_id: &str) -> Result<bool> {
    match directory.find_owner_by_instance_id(instance_id).await {
        Ok(details) => Ok(details.deletion_requested),
        Err(err) if err.is_not_found() => {
            tracing::warn!(%instance_id, "Service instance {instance_id} deleted");
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

/// Whether `error` is one of the configured conditions that do not count as an attempt.
fn is_untracked(error: &JobFabrikError, untracked: &[UntrackedCondition]) -> bool {
    error
        .untracked_condition()
        .is_some_and(|condition| untracked.contains(&condition))
}

/// Spreads the retries of workers that failed against the same store at once.
fn reschedule_backoff() -> BackoffStrategy<Constant> {
    BackoffStrategy::constant(TimeDelta::milliseconds(RESCHEDULE_BACKOFF_MS))
        .with_jitter(Jitter::Relative(0.2))
}

/// Queues a one-shot follow-up run of `kind` for `name`, retrying transient failures.
async fn reschedule(
    manager: &ScheduleManager,
    name: &str,
    kind: JobKind,
    delay: &str,
    data: JobData,
    avoid_duplicates: bool,
) -> Result<()> {
    let strategy = reschedule_backoff();
    let data = &without_marker(&data);
    tracing::info!(%name, %kind, %delay, attempt = attempt(data), "Rescheduling {kind} for {name}");
    backoff::retry(&strategy, RESCHEDULE_ATTEMPTS, move || async move {
        manager
            .run_at(
                name,
                kind,
                delay,
                data.clone(),
                &User::system(),
                avoid_duplicates,
            )
            .await
    })
    .await?;
    Ok(())
}
