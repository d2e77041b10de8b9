use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::{attempt, data_u64, is_untracked, required_str, reschedule};
use crate::{
    catalog::{Runnable, Services},
    interval::{self, CronWindow},
    job::{
        run::{Completion, JobRun},
        JobData, JobKind,
    },
    repository::JobRunRecord,
    services::{Changeset, ResourceDetails, UpdateRequest},
    JobFabrikError, Result, STATUS_SUCCEEDED,
};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Brings a deployment back in line with its desired manifest.
///
/// Every update attempt, successful or not, is followed by a one-shot re-run after the
/// reschedule delay that verifies the deployment is no longer outdated.
pub struct ServiceInstanceUpdateJob {
    services: Services,
}

/// Fields reported in the run history. `"TBD"` marks a step that was never reached.
struct UpdateStatus {
    instance_deleted: bool,
    job_cancelled: bool,
    deployment_outdated: Value,
    update_init: Value,
    diff: Value,
    update_response: Option<Value>,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            instance_deleted: false,
            job_cancelled: false,
            deployment_outdated: json!("TBD"),
            update_init: json!("TBD"),
            diff: json!("TBD"),
            update_response: None,
        }
    }
}

impl UpdateStatus {
    fn response(&self) -> Value {
        let mut response = json!({
            "instance_deleted": self.instance_deleted,
            "job_cancelled": self.job_cancelled,
            "deployment_outdated": self.deployment_outdated,
            "update_init": self.update_init,
            "diff": self.diff,
        });
        if let Some(update_response) = &self.update_response {
            response["update_response"] = update_response.clone();
        }
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Succeeded,
    InProgress,
    Failed,
}

/// The drift reported by the first attempt of a cycle and by its latest run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffTransition {
    pub before: Value,
    pub after: Value,
}

/// Where the latest automatic update cycle of an instance stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateRunStatus {
    pub status: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_run_at: DateTime<Utc>,
    pub diff: DiffTransition,
}

impl UpdateRunStatus {
    /// Summarizes the run history of one instance, newest run first.
    ///
    /// The cycle starts at the newest run recorded as attempt 1, or at the oldest run given.
    pub fn from_history(runs: &[JobRunRecord]) -> Option<Self> {
        let latest = runs.first()?;
        let initial = runs
            .iter()
            .find(|run| run.data.get("attempt").and_then(Value::as_u64) == Some(1))
            .or_else(|| runs.last())?;
        let after = if runs.len() == 1 {
            json!("TBD")
        } else {
            latest.response.get("diff").cloned().unwrap_or(Value::Null)
        };
        let diff = DiffTransition {
            before: initial.response.get("diff").cloned().unwrap_or(Value::Null),
            after,
        };

        let (status, message) = if latest.status_code == STATUS_SUCCEEDED {
            (UpdateState::Succeeded, None)
        } else if initial.status_code == STATUS_SUCCEEDED && is_lock_conflict(latest) {
            // The follow-up could not lock the deployment the initial run started updating.
            (UpdateState::InProgress, None)
        } else if blocked_by_backup(initial) {
            (
                UpdateState::Failed,
                Some("Could not initiate update as Backup process was in-progress".to_owned()),
            )
        } else {
            (
                UpdateState::Failed,
                Some(format!("{} - {}", latest.status_code, latest.status_message)),
            )
        };
        Some(Self {
            status,
            message,
            last_run_at: latest.started_at,
            diff,
        })
    }
}

fn is_lock_conflict(run: &JobRunRecord) -> bool {
    matches!(
        run.status_code.as_str(),
        "ERR_CONFLICT" | "ERR_DEPLOYMENT_LOCKED"
    ) && !blocked_by_backup(run)
}

fn blocked_by_backup(run: &JobRunRecord) -> bool {
    match run.status_code.as_str() {
        "ERR_UNPROCESSABLE_ENTITY" => true,
        "ERR_DEPLOYMENT_LOCKED" => run.status_message.contains("ongoing backup"),
        _ => false,
    }
}

impl ServiceInstanceUpdateJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn update_if_outdated(
        &self,
        run: &JobRun,
        instance_id: &str,
        deployment_name: &str,
        status: &mut UpdateStatus,
    ) -> Result<()> {
        let details = match self
            .services
            .directory
            .find_owner_by_instance_id(instance_id)
            .await
        {
            Ok(details) => details,
            Err(err) if err.is_not_found() => {
                tracing::warn!(%instance_id, "Service instance {instance_id} deleted, cancelling auto update");
                run.schedules()
                    .cancel_schedule(instance_id, JobKind::ServiceInstanceUpdate)
                    .await?;
                status.job_cancelled = true;
                status.instance_deleted = true;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let changeset = self
            .services
            .orchestrator
            .diff(instance_id, deployment_name)
            .await?;
        status.deployment_outdated = json!(!changeset.is_empty());
        status.diff = json!(changeset.unified());
        if changeset.is_empty() {
            tracing::info!(%instance_id, %deployment_name, "Deployment {deployment_name} up to date");
            status.update_init = json!("NA");
            return Ok(());
        }

        let result = self
            .trigger_update(run, &details, deployment_name, &changeset)
            .await;
        match &result {
            Ok(handle) => {
                status.update_init = json!("succeeded");
                status.update_response = Some(handle.clone());
            }
            Err(err) => {
                tracing::error!(?err, %instance_id, "Failed to update service instance {instance_id}");
                status.update_init = json!("failed");
            }
        }
        tracing::info!(%instance_id, update_init = %status.update_init, "Update of {instance_id} initiated");
        self.reschedule(run, instance_id, result.as_ref().err())
            .await;
        result.map(|_| ())
    }

    async fn trigger_update(
        &self,
        run: &JobRun,
        details: &ResourceDetails,
        deployment_name: &str,
        changeset: &Changeset,
    ) -> Result<Value> {
        if !details.force_update {
            let allowed = &self.services.config.service_instance_update.allowed_sections;
            let forbidden = changeset.forbidden_sections(allowed);
            if !forbidden.is_empty() {
                return Err(JobFabrikError::Forbidden(format!(
                    "Automatic update not possible. Detected changes in forbidden sections: {}",
                    forbidden.join(",")
                )));
            }
        }
        let run_immediately = run
            .data()
            .get("run_immediately")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.services
            .orchestrator
            .trigger_update(UpdateRequest {
                instance_id: details.instance_id.clone(),
                deployment_name: deployment_name.to_owned(),
                plan_id: details.plan_id.clone(),
                context: details.context.clone(),
                run_immediately,
            })
            .await
    }

    /// Queues the verifying re-run. Untracked failures do not count against `max_attempts`, but
    /// every follow-up counts against the runs that fit before the next scheduled update.
    async fn reschedule(&self, run: &JobRun, instance_id: &str, error: Option<&JobFabrikError>) {
        let config = &self.services.config.service_instance_update;
        let mut data: JobData = run.data().clone();
        let next = attempt(&data) + 1;
        data.insert("attempt".to_owned(), Value::from(next));

        let tracked = !error.is_some_and(|err| is_untracked(err, &config.untracked_conditions));
        if tracked {
            let max_attempts =
                data_u64(&data, "max_attempts").unwrap_or(u64::from(config.max_attempts));
            if next > max_attempts {
                tracing::error!(%instance_id, max_attempts, "Auto update of {instance_id} exceeded {max_attempts} attempts");
                return;
            }
        }

        let delay = required_str(&data, "reschedule_delay")
            .unwrap_or(self.services.config.reschedule_delay.as_str())
            .to_owned();
        if let Some(max_runs) = max_runs(&delay, config.run_every_xdays) {
            if next >= max_runs {
                tracing::info!(
                    %instance_id,
                    attempt = next,
                    max_runs,
                    "Retries of {instance_id} would spill into the next update cycle, stopping"
                );
                return;
            }
        }

        tracing::info!(%instance_id, %delay, tracked, attempt = next, "Rescheduling update of {instance_id}");
        let _ = reschedule(
            &run.schedules(),
            instance_id,
            JobKind::ServiceInstanceUpdate,
            &delay,
            data,
            true,
        )
        .await
        .inspect_err(|err| {
            tracing::error!(?err, %instance_id, "Failed to reschedule update of {instance_id}")
        });
    }
}

/// How many follow-ups `delay` apart fit in one update cycle of `run_every_xdays` days.
fn max_runs(delay: &str, run_every_xdays: u32) -> Option<u64> {
    let minutes = interval::parse_human_duration(delay)?.num_minutes();
    if minutes <= 0 {
        return None;
    }
    let runs_per_day = u64::try_from(MINUTES_PER_DAY / minutes).ok()?;
    Some(runs_per_day * u64::from(run_every_xdays))
}

#[async_trait]
impl Runnable for ServiceInstanceUpdateJob {
    async fn run(&self, run: JobRun) -> Completion {
        let mut status = UpdateStatus::default();
        let data = run.data().clone();
        let (Some(instance_id), Some(deployment_name)) = (
            required_str(&data, "instance_id"),
            required_str(&data, "deployment_name"),
        ) else {
            let error = JobFabrikError::BadRequest(format!(
                "ServiceInstance Update cannot be initiated as the required mandatory params (instance_id | deployment_name) is empty : {}",
                Value::Object(data.clone())
            ));
            return run.failed(&error, status.response()).await;
        };
        if !self.services.config.features.service_instance_auto_update {
            let error = JobFabrikError::ServiceUnavailable(format!(
                "Schedule update feature is turned off. Cannot run update for {instance_id} - Deployment: {deployment_name}"
            ));
            return run.failed(&error, status.response()).await;
        }
        tracing::info!(%instance_id, %deployment_name, "Starting instance update of {instance_id}");

        match self
            .update_if_outdated(&run, instance_id, deployment_name, &mut status)
            .await
        {
            Ok(()) => run.succeeded(status.response()).await,
            Err(err) => run.failed(&err, status.response()).await,
        }
    }

    fn random_repeat_interval(&self) -> Result<String> {
        let config = &self.services.config.service_instance_update;
        Ok(interval::random_cron_every_x_days(
            config.run_every_xdays,
            CronWindow {
                start_hour: config.should_start_after_hr,
                end_hour: config.should_start_before_hr,
                start_minute: config.should_start_after_min,
                end_minute: config.should_start_before_min,
            },
        ))
    }
}
