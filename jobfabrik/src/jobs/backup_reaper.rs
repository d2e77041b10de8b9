use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};

use super::{data_u64, is_instance_deleted, pace};
use crate::{
    catalog::{Runnable, Services},
    interval,
    job::{
        run::{Completion, JobRun},
        JobKind,
    },
    services::{ArtifactScope, BackupArtifact, BackupTrigger, DeleteOutcome, DeletePrecondition},
    JobFabrikError, Result,
};

/// Fleet-wide sweep of backups that outlived retention by more than a day.
pub struct BackupReaperJob {
    services: Services,
}

impl BackupReaperJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn reap(&self, run: &JobRun) -> Result<Vec<String>> {
        let cutoff = Utc::now() - (self.services.config.backup.retention() + TimeDelta::days(1));
        let listed = self
            .services
            .artifacts
            .list_older_than(cutoff, &ArtifactScope::All)
            .await?;
        let delay = data_u64(run.data(), "delete_delay")
            .unwrap_or(self.services.config.backup_reaper.delete_delay);
        tracing::info!(%cutoff, listed = listed.len(), "Reaping backups started before {cutoff}");

        let mut deleted_guids = Vec::new();
        for (ordinal, item) in listed.iter().enumerate() {
            pace(run, ordinal + 1, delay).await;
            match self.reap_one(run, item).await {
                Ok(true) => deleted_guids.push(item.guid.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(?err, guid = %item.guid, "Failed to reap backup {}", item.guid)
                }
            }
        }
        Ok(deleted_guids)
    }

    /// Deletes one artifact when it is eligible. Returns whether it was deleted.
    async fn reap_one(&self, run: &JobRun, listed: &BackupArtifact) -> Result<bool> {
        let artifact = self.services.artifacts.download(&listed.reference()).await?;
        if !self.is_eligible(run, &artifact).await? {
            tracing::debug!(guid = %artifact.guid, "Keeping backup {}", artifact.guid);
            return Ok(false);
        }
        let precondition = DeletePrecondition {
            trigger: artifact.trigger,
        };
        match self
            .services
            .artifacts
            .delete(&artifact.reference(), Some(precondition))
            .await?
        {
            DeleteOutcome::Deleted => {
                tracing::info!(
                    guid = %artifact.guid,
                    instance_id = ?artifact.instance_id,
                    started_at = %artifact.started_at,
                    "Deleted backup {}", artifact.guid
                );
                Ok(true)
            }
            DeleteOutcome::PreconditionNotMet => {
                tracing::info!(guid = %artifact.guid, "Backup {} changed since listing, skipped", artifact.guid);
                Ok(false)
            }
        }
    }

    async fn is_eligible(&self, run: &JobRun, artifact: &BackupArtifact) -> Result<bool> {
        if artifact.trigger == BackupTrigger::Scheduled {
            return Ok(true);
        }
        let Some(instance_id) = artifact.instance_id.as_deref() else {
            tracing::warn!(guid = %artifact.guid, "On-demand backup {} has no owner", artifact.guid);
            return Ok(false);
        };
        match run
            .schedules()
            .get_schedule(instance_id, JobKind::ScheduledBackup)
            .await
        {
            Ok(_) => Ok(false),
            Err(err) if err.is_not_found() => {
                is_instance_deleted(self.services.directory.as_ref(), instance_id).await
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Runnable for BackupReaperJob {
    async fn run(&self, run: JobRun) -> Completion {
        match self.reap(&run).await {
            Ok(deleted_guids) => {
                tracing::info!(deleted = deleted_guids.len(), "Backup reaper finished");
                run.succeeded(json!({ "deleted_guids": deleted_guids })).await
            }
            Err(err) => {
                let error = JobFabrikError::Operation {
                    code: format!("ERR_FABRIK_BACKUP_REAPER_FAILED_{}", err.status_code()),
                    message: format!("Backup reaper failed: {err}"),
                };
                run.failed(&error, Value::Object(Default::default())).await
            }
        }
    }

    fn random_repeat_interval(&self) -> Result<String> {
        Ok(interval::random_daily_cron())
    }
}
