//! The schedule facade.
//!
//! [`ScheduleManager`] is what the rest of a system calls. Every schedule it creates is written
//! twice: once as an engine record through the [`Scheduler`] and once as an intent record in the
//! [`crate::repository::Repository`]. Reads merge the two.
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{
    interval,
    job::{run::history_name, JobAttributes, JobData, JobKind},
    jobs::UpdateRunStatus,
    notifier::Event,
    repository::{JobRunRecord, NewSchedule, ScheduleDefinition, User},
    scheduler::{Scheduler, FINISHED_JOBS_RETENTION_DAYS},
    JobFabrikError, Result,
};

/// Interval sentinel resolved to a random time of day.
pub const DAILY: &str = "daily";
/// Interval sentinel resolved by the job type itself.
pub const RANDOM: &str = "random";

/// Outcome of the most recent run of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastRunDetails {
    pub status_code: String,
    pub status_message: String,
    pub started_at: DateTime<Utc>,
    pub response: Value,
}

impl From<JobRunRecord> for LastRunDetails {
    fn from(record: JobRunRecord) -> Self {
        Self {
            status_code: record.status_code,
            status_message: record.status_message,
            started_at: record.started_at,
            response: record.response,
        }
    }
}

/// Engine runtime attributes merged with the audit fields of the intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleAttributes {
    /// `{intent name}_{engine name}`.
    pub name: String,
    pub job_type: String,
    pub interval: String,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: i32,
    pub fail_reason: Option<String>,
    pub data: JobData,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<LastRunDetails>,
    /// Only reported for automatic instance updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_status: Option<UpdateRunStatus>,
}

impl ScheduleAttributes {
    pub fn new(
        definition: ScheduleDefinition,
        engine: JobAttributes,
        last_run: Option<LastRunDetails>,
    ) -> Self {
        let last_run_at = last_run
            .as_ref()
            .map(|run| run.started_at)
            .or(engine.last_run_at);
        Self {
            name: format!("{}_{}", definition.name, engine.name),
            job_type: definition.job_type,
            interval: definition.interval,
            repeat_interval: engine.repeat_interval,
            repeat_timezone: engine.repeat_timezone,
            next_run_at: engine.next_run_at,
            last_run_at,
            locked_at: engine.locked_at,
            failed_at: engine.failed_at,
            fail_count: engine.fail_count,
            fail_reason: engine.fail_reason,
            data: engine.data,
            created_by: definition.created_by,
            updated_by: definition.updated_by,
            created_at: definition.created_at,
            updated_at: definition.updated_at,
            last_run,
            update_status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub engine_records: u64,
    pub intents: u64,
}

#[derive(Clone)]
pub struct ScheduleManager {
    scheduler: Scheduler,
}

impl ScheduleManager {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs [`Self::setup_system_jobs`] each time the scheduler reports it started.
    pub fn listen(&self) -> JoinHandle<()> {
        let mut events = self.scheduler.bus().subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::SchedulerStarted) => manager.setup_system_jobs().await,
                    Ok(Event::AppShuttingDown) | Err(RecvError::Closed) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Schedule manager missed {skipped} events")
                    }
                }
            }
        })
    }

    /// Schedules a recurring job and records the intent.
    ///
    /// Besides cron expressions and human readable durations `interval` may be `"daily"`, `"N
    /// hours"` where N divides a day, or `"random"`; these are resolved to a concrete cron first.
    pub async fn schedule(
        &self,
        name: &str,
        kind: JobKind,
        interval: &str,
        data: JobData,
        user: &User,
    ) -> Result<ScheduleAttributes> {
        let interval = self.resolve_interval(name, kind, interval).await?;
        let engine = self
            .scheduler
            .schedule(name, kind, &interval, data.clone())
            .await?
            .ok_or_else(|| not_found(name, kind))?;
        let definition = self
            .scheduler
            .repository()
            .save_schedule(
                NewSchedule {
                    name: name.to_owned(),
                    job_type: kind.to_string(),
                    interval,
                    data,
                    run_only_once: false,
                },
                user,
            )
            .await?;
        let last_run = self.last_run(&definition, kind).await;
        Ok(ScheduleAttributes::new(definition, engine, last_run))
    }

    pub async fn schedule_daily(
        &self,
        name: &str,
        kind: JobKind,
        data: JobData,
        user: &User,
    ) -> Result<ScheduleAttributes> {
        self.schedule(name, kind, DAILY, data, user).await
    }

    /// Schedules a one-shot run. Its intent is always inserted as a new record.
    pub async fn run_at(
        &self,
        name: &str,
        kind: JobKind,
        when: &str,
        data: JobData,
        user: &User,
        avoid_duplicates: bool,
    ) -> Result<ScheduleAttributes> {
        let engine = self
            .scheduler
            .run_at(name, kind, when, data.clone(), avoid_duplicates)
            .await?
            .ok_or_else(|| not_found(name, kind))?;
        let definition = self
            .scheduler
            .repository()
            .save_schedule(
                NewSchedule {
                    name: name.to_owned(),
                    job_type: format!("{kind}_{}", self.scheduler.timestamp()),
                    interval: when.to_owned(),
                    data,
                    run_only_once: true,
                },
                user,
            )
            .await?;
        Ok(ScheduleAttributes::new(definition, engine, None))
    }

    /// Fails with [`JobFabrikError::NotFound`] unless both the engine record and the intent exist.
    pub async fn get_schedule(&self, name: &str, kind: JobKind) -> Result<ScheduleAttributes> {
        tracing::debug!(%name, %kind, "Retrieving schedule for {name}");
        let engine = self
            .scheduler
            .get_job(name, kind)
            .await?
            .ok_or_else(|| not_found(name, kind))?;
        let definition = self
            .scheduler
            .repository()
            .find_schedule(name, kind.as_str())
            .await?
            .ok_or_else(|| not_found(name, kind))?;
        let last_run = self.last_run(&definition, kind).await;
        let update_status = match kind {
            JobKind::ServiceInstanceUpdate => {
                let instance_id = history_name(kind, &definition.data);
                self.last_update_status(&instance_id)
                    .await
                    .inspect_err(|err| {
                        tracing::warn!(?err, %instance_id, "Failed to summarize updates of {instance_id}")
                    })
                    .ok()
                    .flatten()
            }
            _ => None,
        };
        let mut attributes = ScheduleAttributes::new(definition, engine, last_run);
        attributes.update_status = update_status;
        Ok(attributes)
    }

    /// Where the latest automatic update cycle of `instance_id` stands, `None` before its first
    /// run. Reads as many runs as an update cycle may take attempts.
    pub async fn last_update_status(&self, instance_id: &str) -> Result<Option<UpdateRunStatus>> {
        let limit = self
            .scheduler
            .catalog()
            .services()
            .config
            .service_instance_update
            .max_attempts
            .max(1) as usize;
        let runs = self
            .scheduler
            .repository()
            .recent_runs(instance_id, JobKind::ServiceInstanceUpdate, limit)
            .await?;
        tracing::debug!(%instance_id, runs = runs.len(), "Read {} update runs of {instance_id}", runs.len());
        Ok(UpdateRunStatus::from_history(&runs))
    }

    /// Removes the engine record and the intent. Failures on either side are logged and
    /// otherwise ignored, as is cancelling a schedule that does not exist.
    pub async fn cancel_schedule(&self, name: &str, kind: JobKind) -> Result<()> {
        tracing::debug!(%name, %kind, "Cancelling schedule {name}_{kind}");
        let _ = self
            .scheduler
            .cancel_job(name, kind)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, %name, %kind, "Failed to cancel job {name}_{kind}")
            });
        let _ = self
            .scheduler
            .repository()
            .delete_schedule(name, kind.as_str())
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, %name, %kind, "Failed to delete schedule {name}_{kind}")
            });
        Ok(())
    }

    /// Applies the configured system-job list. Disabled entries are cancelled, enabled entries
    /// are scheduled when missing or when their interval changed.
    pub async fn setup_system_jobs(&self) {
        let user = User::system();
        for definition in &self.scheduler.config().system_jobs {
            let name = definition.name.as_str();
            let kind = definition.job_type;
            if !definition.enabled {
                tracing::info!(%name, %kind, "Cancelling system job {name}");
                let _ = self.cancel_schedule(name, kind).await.inspect_err(|err| {
                    tracing::error!(?err, %name, "Failed to cancel system job {name}")
                });
                continue;
            }
            let reschedule = match self.get_schedule(name, kind).await {
                Ok(existing) => !existing
                    .repeat_interval
                    .as_deref()
                    .is_some_and(|stored| resolved_from(&definition.interval, stored)),
                Err(err) if err.is_not_found() => true,
                Err(err) => {
                    tracing::error!(?err, %name, "Failed to look up system job {name}");
                    false
                }
            };
            if !reschedule {
                tracing::info!(%name, %kind, interval = %definition.interval, "System job {name} already scheduled");
                continue;
            }
            tracing::info!(%name, %kind, interval = %definition.interval, "Scheduling system job {name}");
            let _ = self
                .schedule(
                    name,
                    kind,
                    &definition.interval,
                    definition.job_data.clone(),
                    &user,
                )
                .await
                .inspect_err(|err| {
                    tracing::error!(?err, %name, "Failed to schedule system job {name}")
                });
        }
    }

    /// Removes finished one-shot engine records and one-shot intents past retention.
    pub async fn purge_old_finished_jobs(&self) -> Result<PurgeReport> {
        let engine_records = self.scheduler.purge_old_finished_jobs().await?;
        let before = Utc::now() - TimeDelta::days(FINISHED_JOBS_RETENTION_DAYS);
        let intents = self
            .scheduler
            .repository()
            .purge_one_shot_schedules(before)
            .await
            .inspect_err(|err| tracing::error!(?err, "Failed to purge one-shot schedules"))?;
        Ok(PurgeReport {
            engine_records,
            intents,
        })
    }

    async fn resolve_interval(&self, name: &str, kind: JobKind, interval: &str) -> Result<String> {
        if interval == DAILY {
            // Keep the time already picked for this intent.
            let existing = self
                .scheduler
                .repository()
                .find_schedule(name, kind.as_str())
                .await?;
            if let Some(existing) = existing.filter(|existing| resolved_from(DAILY, &existing.interval)) {
                return Ok(existing.interval);
            }
            let resolved = interval::random_daily_cron();
            tracing::info!(%name, %resolved, "Resolved daily interval for {name}");
            return Ok(resolved);
        }
        if interval == RANDOM {
            return self.scheduler.catalog().get(kind).random_repeat_interval();
        }
        if let Some(hours) = interval::every_n_hours(interval) {
            if let Some(resolved) = interval::random_cron_every_n_hours(hours) {
                tracing::info!(%name, %resolved, "Resolved hourly interval for {name}");
                return Ok(resolved);
            }
        }
        Ok(interval.to_owned())
    }

    async fn last_run(&self, definition: &ScheduleDefinition, kind: JobKind) -> Option<LastRunDetails> {
        let name = history_name(kind, &definition.data);
        self.scheduler
            .repository()
            .recent_runs(&name, kind, 1)
            .await
            .inspect_err(|err| tracing::warn!(?err, %name, "Failed to read run history of {name}"))
            .ok()?
            .into_iter()
            .next()
            .map(LastRunDetails::from)
    }
}

fn not_found(name: &str, kind: JobKind) -> JobFabrikError {
    JobFabrikError::NotFound(format!(
        "Schedule not found for instance {name} for job type {kind}"
    ))
}

/// Whether `stored` is `requested` or a cron `requested` could have been resolved to.
fn resolved_from(requested: &str, stored: &str) -> bool {
    if requested == stored {
        return true;
    }
    let fields: Vec<&str> = stored.split_whitespace().collect();
    let [minute, hours, "*", "*", "*"] = fields.as_slice() else {
        return false;
    };
    if minute.parse::<u32>().is_err() {
        return false;
    }
    let Ok(hours) = hours
        .split(',')
        .map(str::parse::<u32>)
        .collect::<std::result::Result<Vec<_>, _>>()
    else {
        return false;
    };
    match interval::every_n_hours(requested) {
        _ if requested == DAILY => hours.len() == 1,
        Some(every) if every > 0 && 24 % every == 0 => hours.len() as u32 == 24 / every,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, Backend, BackendError},
        catalog::JobCatalog,
        config::{SchedulerConfig, SystemJobDefinition},
        job::JOB_NAME_ATTRIB,
        jobs::UpdateState,
        notifier::EventBus,
        repository::{MockRepository, Repository},
        testing::{scheduler_config, Harness, TestServices},
        STATUS_SUCCEEDED,
    };

    fn data() -> JobData {
        let mut data = JobData::new();
        data.insert("instance_id".to_owned(), json!("abc"));
        data.insert("type".to_owned(), json!("online"));
        data
    }

    fn system_job(name: &str, kind: JobKind, interval: &str, enabled: bool) -> SystemJobDefinition {
        SystemJobDefinition {
            name: name.to_owned(),
            job_type: kind,
            interval: interval.to_owned(),
            job_data: JobData::new(),
            enabled,
        }
    }

    #[tokio::test]
    async fn schedule_then_get_schedule() {
        let harness = Harness::ready(TestServices::default());

        let scheduled = harness
            .manager
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data(), &User::new("admin"))
            .await
            .unwrap();
        let fetched = harness
            .manager
            .get_schedule("abc", JobKind::ScheduledBackup)
            .await
            .unwrap();

        assert_eq!(scheduled.name, "abc_ScheduledBackup");
        assert_eq!(fetched.name, "abc_ScheduledBackup");
        assert_eq!(fetched.data, data());
        assert!(!fetched.data.contains_key(JOB_NAME_ATTRIB));
        assert_eq!(fetched.created_by, "admin");
        assert_eq!(fetched.repeat_interval.as_deref(), Some("1 hour"));
        assert_eq!(fetched.last_run, None);
    }

    #[tokio::test]
    async fn invalid_intervals_leave_no_records() {
        let harness = Harness::ready(TestServices::default());

        assert_matches!(
            harness
                .manager
                .schedule(
                    "abc",
                    JobKind::ScheduledBackup,
                    "NOT-A-VALID-INTERVAL",
                    data(),
                    &User::system()
                )
                .await,
            Err(JobFabrikError::BadRequest(message)) if message.contains("NOT-A-VALID-INTERVAL")
        );
        assert!(harness.backend.jobs().is_empty());
        assert!(harness.repository.schedules().is_empty());
    }

    #[tokio::test]
    async fn daily_is_resolved_once_per_intent() {
        let harness = Harness::ready(TestServices::default());

        let first = harness
            .manager
            .schedule_daily("abc", JobKind::ScheduledBackup, data(), &User::system())
            .await
            .unwrap();
        let second = harness
            .manager
            .schedule_daily("abc", JobKind::ScheduledBackup, data(), &User::system())
            .await
            .unwrap();

        assert!(resolved_from(DAILY, &first.interval));
        assert_eq!(first.interval, second.interval);
        assert_eq!(harness.repository.schedules().len(), 1);
    }

    #[tokio::test]
    async fn hourly_intervals_get_a_random_minute() {
        let harness = Harness::ready(TestServices::default());

        let every_six = harness
            .manager
            .schedule("abc", JobKind::ScheduledBackup, "6 hours", data(), &User::system())
            .await
            .unwrap();
        let every_seven = harness
            .manager
            .schedule("xyz", JobKind::ScheduledBackup, "7 hours", data(), &User::system())
            .await
            .unwrap();

        assert!(resolved_from("6 hours", &every_six.interval));
        assert_eq!(every_seven.interval, "7 hours");
    }

    #[tokio::test]
    async fn random_interval_comes_from_the_job_type() {
        let harness = Harness::ready(TestServices::default());

        let update = harness
            .manager
            .schedule(
                "abc",
                JobKind::ServiceInstanceUpdate,
                RANDOM,
                data(),
                &User::system(),
            )
            .await
            .unwrap();

        assert_ne!(update.interval, RANDOM);
        assert!(harness
            .manager
            .schedule(
                "abc",
                JobKind::OperationStatusPoller,
                RANDOM,
                data(),
                &User::system()
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn one_shot_intents_are_always_inserted() {
        let harness = Harness::ready(TestServices::default());

        for _ in 0..2 {
            let attributes = harness
                .manager
                .run_at(
                    "abc",
                    JobKind::ScheduledBackup,
                    "10 minutes",
                    data(),
                    &User::system(),
                    false,
                )
                .await
                .unwrap();
            assert_eq!(attributes.name, "abc_ScheduledBackup");
        }

        let schedules = harness.repository.schedules();
        assert_eq!(schedules.len(), 2);
        assert_ne!(schedules[0].job_type, schedules[1].job_type);
        assert!(schedules
            .iter()
            .all(|schedule| schedule.run_only_once
                && schedule.job_type.starts_with("ScheduledBackup_")));
    }

    #[tokio::test]
    async fn get_schedule_requires_both_records() {
        let harness = Harness::ready(TestServices::default());
        harness
            .scheduler
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data())
            .await
            .unwrap();

        assert_matches!(
            harness
                .manager
                .get_schedule("abc", JobKind::ScheduledBackup)
                .await,
            Err(JobFabrikError::NotFound(_))
        );
        assert_matches!(
            harness
                .manager
                .get_schedule("xyz", JobKind::ScheduledBackup)
                .await,
            Err(JobFabrikError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn get_schedule_reports_the_last_run() {
        let harness = Harness::ready(TestServices::default());
        harness
            .manager
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data(), &User::system())
            .await
            .unwrap();
        let started_at = Utc::now();
        harness
            .repository
            .append_run(JobRunRecord {
                name: "abc".to_owned(),
                job_type: JobKind::ScheduledBackup,
                interval: Some("1 hour".to_owned()),
                data: data(),
                response: json!({"start_backup_status": "instance_deleted"}),
                status_code: STATUS_SUCCEEDED.to_owned(),
                status_message: "run successful".to_owned(),
                started_at,
                processed_by: "main".to_owned(),
                created_by: "system".to_owned(),
            })
            .await
            .unwrap();

        let schedule = harness
            .manager
            .get_schedule("abc", JobKind::ScheduledBackup)
            .await
            .unwrap();

        let last_run = schedule.last_run.unwrap();
        assert_eq!(last_run.status_code, STATUS_SUCCEEDED);
        assert_eq!(schedule.last_run_at, Some(started_at));
    }

    #[tokio::test]
    async fn cancel_schedule_never_fails_for_missing_schedules() {
        let harness = Harness::ready(TestServices::default());
        harness
            .manager
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data(), &User::system())
            .await
            .unwrap();

        harness
            .manager
            .cancel_schedule("abc", JobKind::ScheduledBackup)
            .await
            .unwrap();
        harness
            .manager
            .cancel_schedule("abc", JobKind::ScheduledBackup)
            .await
            .unwrap();

        assert!(harness.backend.jobs().is_empty());
        assert!(harness.repository.schedules().is_empty());
    }

    #[tokio::test]
    async fn cancel_schedule_swallows_engine_failures() {
        // The engine refuses every operation until the scheduler is ready.
        let harness = Harness::new(TestServices::default(), scheduler_config());

        assert!(harness
            .manager
            .cancel_schedule("abc", JobKind::ScheduledBackup)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancel_schedule_swallows_intent_failures() {
        let backend = InMemoryBackend::new();
        let mut repository = MockRepository::new();
        repository
            .expect_delete_schedule()
            .withf(|name, job_type| name == "abc" && job_type == "ScheduledBackup")
            .times(1)
            .returning(|_, _| Err(BackendError::Unavailable("connection reset".to_owned())));
        let scheduler = Scheduler::new(
            scheduler_config(),
            Arc::new(backend.clone()),
            Arc::new(repository),
            Arc::new(JobCatalog::new(TestServices::default().build())),
            EventBus::new(),
        );
        scheduler.initialize();
        scheduler
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data())
            .await
            .unwrap();

        ScheduleManager::new(scheduler)
            .cancel_schedule("abc", JobKind::ScheduledBackup)
            .await
            .unwrap();

        assert!(backend.jobs().is_empty());
    }

    #[tokio::test]
    async fn get_schedule_summarizes_instance_updates() {
        let harness = Harness::ready(TestServices::default());
        let mut update_data = data();
        update_data.insert("deployment_name".to_owned(), json!("service-fabrik-abc"));
        harness
            .manager
            .schedule(
                "abc",
                JobKind::ServiceInstanceUpdate,
                "0 2 * * *",
                update_data.clone(),
                &User::system(),
            )
            .await
            .unwrap();
        assert_eq!(harness.manager.last_update_status("abc").await.unwrap(), None);

        let started_at = Utc::now();
        for (attempt, diff, started_at) in [
            (1, json!(["+ version: 2"]), started_at - TimeDelta::minutes(10)),
            (2, json!([]), started_at),
        ] {
            let mut data = update_data.clone();
            data.insert("attempt".to_owned(), json!(attempt));
            harness
                .repository
                .append_run(JobRunRecord {
                    name: "abc".to_owned(),
                    job_type: JobKind::ServiceInstanceUpdate,
                    interval: None,
                    data,
                    response: json!({"diff": diff}),
                    status_code: STATUS_SUCCEEDED.to_owned(),
                    status_message: "run successful".to_owned(),
                    started_at,
                    processed_by: "main".to_owned(),
                    created_by: "system".to_owned(),
                })
                .await
                .unwrap();
        }

        let schedule = harness
            .manager
            .get_schedule("abc", JobKind::ServiceInstanceUpdate)
            .await
            .unwrap();

        let update_status = schedule.update_status.unwrap();
        assert_eq!(update_status.status, UpdateState::Succeeded);
        assert_eq!(update_status.last_run_at, started_at);
        assert_eq!(update_status.diff.before, json!(["+ version: 2"]));
        assert_eq!(update_status.diff.after, json!([]));

        let backup = harness
            .manager
            .schedule("abc", JobKind::ScheduledBackup, "1 hour", data(), &User::system())
            .await
            .unwrap();
        assert_eq!(backup.update_status, None);
    }

    #[tokio::test]
    async fn system_jobs_follow_configuration() {
        let config = SchedulerConfig {
            system_jobs: vec![
                system_job("reaper", JobKind::BackupReaper, "daily", true),
                system_job("legacy", JobKind::ScheduledBackup, "1 hour", false),
            ],
            ..scheduler_config()
        };
        let harness = Harness::new(TestServices::default(), config);
        harness.scheduler.initialize();
        harness
            .manager
            .schedule("legacy", JobKind::ScheduledBackup, "1 hour", data(), &User::system())
            .await
            .unwrap();

        harness.manager.setup_system_jobs().await;
        let reaper = harness
            .manager
            .get_schedule("reaper", JobKind::BackupReaper)
            .await
            .unwrap();
        harness.manager.setup_system_jobs().await;

        assert_matches!(
            harness
                .manager
                .get_schedule("legacy", JobKind::ScheduledBackup)
                .await,
            Err(JobFabrikError::NotFound(_))
        );
        assert_eq!(
            harness
                .manager
                .get_schedule("reaper", JobKind::BackupReaper)
                .await
                .unwrap()
                .interval,
            reaper.interval
        );
        assert_eq!(harness.backend.jobs().len(), 1);
    }

    #[tokio::test]
    async fn scheduler_start_sets_up_system_jobs() {
        let config = SchedulerConfig {
            system_jobs: vec![system_job("reaper", JobKind::BackupReaper, "1 day", true)],
            ..scheduler_config()
        };
        let harness = Harness::new(TestServices::default(), config);
        let listener = harness.manager.listen();

        harness.scheduler.initialize();
        harness.bus.publish(Event::AppShuttingDown);
        listener.await.unwrap();

        let jobs = harness
            .backend
            .find(&crate::backend::JobCriteria::named(
                JobKind::BackupReaper,
                "reaper_BackupReaper",
            ))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_old_one_shot_intents() {
        let harness = Harness::ready(TestServices::default());
        harness
            .manager
            .run_at(
                "abc",
                JobKind::ScheduledBackup,
                "10 minutes",
                data(),
                &User::system(),
                false,
            )
            .await
            .unwrap();

        let report = harness.manager.purge_old_finished_jobs().await.unwrap();

        assert_eq!(
            report,
            PurgeReport {
                engine_records: 0,
                intents: 0
            }
        );
        assert_eq!(harness.repository.schedules().len(), 1);
    }

    #[test]
    fn resolved_intervals() {
        assert!(resolved_from(DAILY, "12 3 * * *"));
        assert!(!resolved_from(DAILY, "12 3,15 * * *"));
        assert!(resolved_from("12 hours", "12 3,15 * * *"));
        assert!(resolved_from("1 hour", "1 hour"));
        assert!(!resolved_from(DAILY, "1 day"));
    }
}
