use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{
    attempt, data_u64, is_instance_deleted, is_untracked, pace, required_str, reschedule,
};
use crate::{
    catalog::{Runnable, Services},
    interval,
    job::{
        run::{Completion, JobRun},
        JobData, JobKind,
    },
    manager::ScheduleManager,
    services::{ArtifactScope, ArtifactState, BackupArtifact, BackupRequest, BackupTrigger},
    JobFabrikError, Result,
};

const DELETION_TIME_ATTRIB: &str = "instance_deletion_time";

/// Periodic backup of one service instance, followed by a retention sweep of its artifacts.
///
/// Once the instance is gone and no artifact is left the job cancels its own schedule.
pub struct ScheduleBackupJob {
    services: Services,
}

struct RunStatus {
    start_backup_status: Value,
    delete_backup_status: Value,
}

impl RunStatus {
    fn new() -> Self {
        Self {
            start_backup_status: json!("failed"),
            delete_backup_status: json!("failed"),
        }
    }

    fn response(&self) -> Value {
        json!({
            "start_backup_status": self.start_backup_status,
            "delete_backup_status": self.delete_backup_status,
        })
    }
}

enum Retry {
    Untracked,
    Tracked,
}

impl ScheduleBackupJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn backup(
        &self,
        run: &mut JobRun,
        instance_id: &str,
        backup_type: &str,
        status: &mut RunStatus,
    ) -> Result<()> {
        let instance_deleted =
            is_instance_deleted(self.services.directory.as_ref(), instance_id).await?;
        status.start_backup_status = if instance_deleted {
            if !run.data().contains_key(DELETION_TIME_ATTRIB) {
                run.data_mut().insert(
                    DELETION_TIME_ATTRIB.to_owned(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            }
            json!("instance_deleted")
        } else {
            let trigger = run
                .data()
                .get("trigger")
                .cloned()
                .and_then(|trigger| serde_json::from_value(trigger).ok())
                .unwrap_or(BackupTrigger::Scheduled);
            self.services
                .authority
                .start_backup(BackupRequest {
                    instance_id: instance_id.to_owned(),
                    backup_type: backup_type.to_owned(),
                    trigger,
                })
                .await?
        };
        status.delete_backup_status = self
            .delete_old_backups(run, instance_id, instance_deleted)
            .await?;
        Ok(())
    }

    async fn delete_old_backups(
        &self,
        run: &JobRun,
        instance_id: &str,
        instance_deleted: bool,
    ) -> Result<Value> {
        let now = Utc::now();
        let retention = self.services.config.backup.retention();
        let scope = ArtifactScope::Instance(instance_id.to_owned());
        let artifacts = self
            .services
            .artifacts
            .list_older_than(now - retention, &scope)
            .await?;
        let delete_all = deleted_since(run.data())
            .is_some_and(|deleted_at| now - deleted_at > retention);
        let delay = data_u64(run.data(), "delete_delay")
            .unwrap_or(self.services.config.scheduled_backup.delete_delay);

        let mut deleted_guids = Vec::new();
        for artifact in expired(artifacts, delete_all) {
            if artifact.trigger != BackupTrigger::Scheduled && !instance_deleted {
                // On-demand backups outlive the instance's retention window.
                continue;
            }
            pace(run, deleted_guids.len() + 1, delay).await;
            tracing::info!(
                guid = %artifact.guid,
                %instance_id,
                started_at = %artifact.started_at,
                instance_deleted,
                "Deleting backup {}", artifact.guid
            );
            self.services
                .artifacts
                .delete(&artifact.reference(), None)
                .await?;
            deleted_guids.push(artifact.guid);
        }
        tracing::info!(?deleted_guids, %instance_id, instance_deleted, "Deleted old backups");

        let mut job_cancelled = false;
        if instance_deleted {
            let remaining = self
                .services
                .artifacts
                .list_older_than(Utc::now(), &scope)
                .await?;
            if remaining.is_empty() {
                tracing::info!(%instance_id, "No backups left for deleted instance {instance_id}, cancelling");
                job_cancelled = run
                    .schedules()
                    .cancel_schedule(instance_id, JobKind::ScheduledBackup)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(?err, %instance_id, "Failed to cancel backup schedule of {instance_id}")
                    })
                    .is_ok();
            } else {
                tracing::info!(
                    %instance_id,
                    remaining = remaining.len(),
                    "Backup schedule of {instance_id} kept while backups remain"
                );
            }
        }
        Ok(json!({
            "deleted_guids": deleted_guids,
            "job_cancelled": job_cancelled,
            "instance_deleted": instance_deleted,
        }))
    }

    fn retry_kind(&self, error: &JobFabrikError) -> Option<Retry> {
        let config = &self.services.config.scheduled_backup;
        if is_untracked(error, &config.untracked_conditions) {
            Some(Retry::Untracked)
        } else if error.untracked_condition().is_some() || error.is_transient() {
            Some(Retry::Tracked)
        } else {
            None
        }
    }

    async fn reschedule_after(
        &self,
        manager: &ScheduleManager,
        instance_id: &str,
        data: &JobData,
        error: &JobFabrikError,
    ) {
        let Some(retry) = self.retry_kind(error) else {
            return;
        };
        let mut data = data.clone();
        if let Retry::Tracked = retry {
            let next = attempt(&data) + 1;
            let max_attempts = data_u64(&data, "max_attempts")
                .unwrap_or(u64::from(self.services.config.scheduled_backup.max_attempts));
            if next > max_attempts {
                tracing::error!(
                    %instance_id,
                    max_attempts,
                    first_attempt_at = ?data.get("firstAttemptAt"),
                    "Scheduled backup of {instance_id} exceeded {max_attempts} attempts"
                );
                return;
            }
            data.insert("attempt".to_owned(), Value::from(next));
        }
        let delay = required_str(&data, "reschedule_delay")
            .unwrap_or(self.services.config.reschedule_delay.as_str())
            .to_owned();
        let _ = reschedule(
            manager,
            instance_id,
            JobKind::ScheduledBackup,
            &delay,
            data,
            false,
        )
        .await
        .inspect_err(|err| {
            tracing::error!(?err, %instance_id, "Failed to reschedule backup of {instance_id}")
        });
    }
}

/// When the instance was first seen deleted.
fn deleted_since(data: &JobData) -> Option<DateTime<Utc>> {
    let deleted_at = data.get(DELETION_TIME_ATTRIB)?.as_str()?;
    DateTime::parse_from_rfc3339(deleted_at)
        .ok()
        .map(|deleted_at| deleted_at.with_timezone(&Utc))
}

/// The artifacts past retention that may go, newest first. The newest successful artifact and
/// everything newer than it are kept unless `delete_all` is set.
fn expired(mut artifacts: Vec<BackupArtifact>, delete_all: bool) -> Vec<BackupArtifact> {
    artifacts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    let latest_success = artifacts
        .iter()
        .position(|artifact| artifact.state == ArtifactState::Succeeded);
    match latest_success {
        Some(index) if !delete_all => artifacts.split_off(index + 1),
        _ => artifacts,
    }
}

#[async_trait]
impl Runnable for ScheduleBackupJob {
    async fn run(&self, mut run: JobRun) -> Completion {
        let data = run.data().clone();
        let (Some(instance_id), Some(backup_type)) =
            (required_str(&data, "instance_id"), required_str(&data, "type"))
        else {
            let error = JobFabrikError::BadRequest(format!(
                "Scheduled backup cannot be initiated as the required mandatory params (instance_id | type) is empty : {}",
                Value::Object(data.clone())
            ));
            return run.failed(&error, Value::Null).await;
        };
        tracing::info!(%instance_id, %backup_type, "Starting scheduled backup of {instance_id}");

        let mut status = RunStatus::new();
        match self
            .backup(&mut run, instance_id, backup_type, &mut status)
            .await
        {
            Ok(()) => run.succeeded(status.response()).await,
            Err(error) => {
                let manager = run.schedules();
                self.reschedule_after(&manager, instance_id, run.data(), &error)
                    .await;
                run.failed(&error, status.response()).await
            }
        }
    }

    fn random_repeat_interval(&self) -> Result<String> {
        Ok(interval::random_daily_cron())
    }
}
