use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::required_str;
use crate::{
    catalog::{Runnable, Services},
    job::{
        run::{Completion, JobRun},
        JobData, JobKind,
    },
    services::{ArtifactRef, ArtifactState, OperationKind, OperationState, OperationStatus},
    JobFabrikError, Result,
};

/// Checks the status of one in-flight backup or restore per run.
///
/// The poll is driven by a recurring schedule named after the operation, which the job cancels
/// once the operation finished, timed out or vanished.
pub struct OperationStatusPollerJob {
    services: Services,
}

/// The validated inputs of one poll.
struct Poll<'a> {
    deployment_name: &'a str,
    operation: OperationKind,
    handle: &'a Value,
    backup_guid: &'a str,
    started_at: DateTime<Utc>,
}

impl Poll<'_> {
    fn schedule_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.deployment_name, self.operation, self.backup_guid
        )
    }
}

impl OperationStatusPollerJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn cancel_poll(&self, run: &JobRun, poll: &Poll<'_>) -> bool {
        let name = poll.schedule_name();
        run.schedules()
            .cancel_schedule(&name, JobKind::OperationStatusPoller)
            .await
            .inspect_err(|err| tracing::error!(?err, %name, "Failed to cancel poll {name}"))
            .is_ok()
    }

    async fn mark_aborted(&self, poll: &Poll<'_>) {
        let artifact = ArtifactRef {
            guid: poll.backup_guid.to_owned(),
            tenant_id: poll
                .handle
                .get("tenant_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        };
        let _ = self
            .services
            .artifacts
            .patch_metadata(&artifact, ArtifactState::Aborted)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, guid = %artifact.guid, "Failed to mark backup {} aborted", artifact.guid)
            });
    }

    async fn abort(&self, poll: &Poll<'_>) {
        let _ = self
            .services
            .authority
            .abort(poll.deployment_name, poll.operation, poll.handle)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, deployment = %poll.deployment_name, "Failed to abort {} of {}", poll.operation, poll.deployment_name)
            });
    }

    async fn poll(&self, run: JobRun, poll: Poll<'_>) -> Completion {
        let status = match self
            .services
            .authority
            .get_status(poll.deployment_name, poll.operation, poll.handle)
            .await
        {
            Ok(status) => status,
            Err(err) if err.is_not_found() => {
                tracing::warn!(deployment = %poll.deployment_name, "Operation {} of {} not found", poll.operation, poll.deployment_name);
                self.mark_aborted(&poll).await;
                self.cancel_poll(&run, &poll).await;
                return run.failed(&err, Value::Null).await;
            }
            Err(err) => return run.failed(&err, Value::Null).await,
        };
        tracing::info!(
            deployment = %poll.deployment_name,
            operation = %poll.operation,
            state = status.state.as_str(),
            stage = ?status.stage,
            "Polled {} of {}", poll.operation, poll.deployment_name
        );

        if status.state.is_terminal() {
            let job_cancelled = self.cancel_poll(&run, &poll).await;
            let response = response(&status, false, job_cancelled, true);
            return match status.state {
                OperationState::Succeeded => run.succeeded(response).await,
                state => {
                    let error = JobFabrikError::Operation {
                        code: format!(
                            "ERR_DEPLOYMENT_{}_{}",
                            poll.operation.as_str().to_uppercase(),
                            state.as_str().to_uppercase()
                        ),
                        message: format!(
                            "Deployment {} {} {}",
                            poll.deployment_name,
                            poll.operation,
                            state.as_str()
                        ),
                    };
                    run.failed(&error, response).await
                }
            };
        }

        let started_at = poll.started_at;
        let timeout = self.services.config.backup.status_poller_timeout();
        if Utc::now() - started_at <= timeout {
            return run.succeeded(response(&status, false, false, false)).await;
        }

        tracing::error!(
            deployment = %poll.deployment_name,
            %started_at,
            "{} of {} timed out", poll.operation, poll.deployment_name
        );
        self.abort(&poll).await;
        let job_cancelled = self.cancel_poll(&run, &poll).await;
        let error = JobFabrikError::Operation {
            code: format!("ERR_{}_TIME_OUT", poll.operation.as_str().to_uppercase()),
            message: format!(
                "{} of {} did not finish within {}",
                poll.operation, poll.deployment_name, timeout
            ),
        };
        run.failed(&error, response(&status, true, job_cancelled, false))
            .await
    }
}

fn response(
    status: &OperationStatus,
    timed_out: bool,
    job_cancelled: bool,
    finished: bool,
) -> Value {
    let mut response = match serde_json::to_value(status) {
        Ok(Value::Object(fields)) => fields,
        _ => Default::default(),
    };
    response.insert("operationTimedOut".to_owned(), json!(timed_out));
    response.insert("jobCancelled".to_owned(), json!(job_cancelled));
    response.insert("operationFinished".to_owned(), json!(finished));
    Value::Object(response)
}

fn parse_poll(data: &JobData) -> Result<Poll<'_>> {
    let missing = || {
        JobFabrikError::BadRequest(format!(
            "Operation status cannot be polled as the required mandatory params (deployment_name | operation | operation_response.backup_guid | operation_job_started_at) is empty : {}",
            Value::Object(data.clone())
        ))
    };
    let deployment_name = required_str(data, "deployment_name").ok_or_else(missing)?;
    let operation = required_str(data, "operation").ok_or_else(missing)?;
    let handle = data
        .get("operation_response")
        .filter(|handle| handle.is_object())
        .ok_or_else(missing)?;
    let backup_guid = handle
        .get("backup_guid")
        .and_then(Value::as_str)
        .filter(|guid| !guid.is_empty())
        .ok_or_else(missing)?;
    // The timeout counts from the operation start, not from this run.
    let started_at = required_str(data, "operation_job_started_at")
        .and_then(|started_at| DateTime::parse_from_rfc3339(started_at).ok())
        .ok_or_else(missing)?
        .with_timezone(&Utc);
    Ok(Poll {
        deployment_name,
        operation: operation.parse()?,
        handle,
        backup_guid,
        started_at,
    })
}

#[async_trait]
impl Runnable for OperationStatusPollerJob {
    async fn run(&self, run: JobRun) -> Completion {
        let data = run.data().clone();
        match parse_poll(&data) {
            Ok(poll) => self.poll(run, poll).await,
            Err(err) => run.failed(&err, Value::Null).await,
        }
    }

    fn random_repeat_interval(&self) -> Result<String> {
        Err(JobFabrikError::NotImplemented(
            "Operation status polls have no random interval".to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        repository::User,
        testing::{Harness, TestServices},
        STATUS_SUCCEEDED,
    };

    const SCHEDULE_NAME: &str = "deployment-1_backup_guid-1";

    fn data(started_at: DateTime<Utc>) -> JobData {
        let mut data = JobData::new();
        data.insert("deployment_name".to_owned(), json!("deployment-1"));
        data.insert("operation".to_owned(), json!("backup"));
        data.insert(
            "operation_response".to_owned(),
            json!({"backup_guid": "guid-1", "tenant_id": "space"}),
        );
        data.insert(
            "operation_job_started_at".to_owned(),
            json!(started_at.to_rfc3339()),
        );
        data
    }

    fn status(state: &str) -> OperationStatus {
        serde_json::from_value(json!({"state": state, "stage": "uploading"})).unwrap()
    }

    async fn harness(services: TestServices) -> Harness {
        let harness = Harness::ready(services);
        harness
            .manager
            .schedule(
                SCHEDULE_NAME,
                JobKind::OperationStatusPoller,
                "1 minute",
                data(Utc::now()),
                &User::system(),
            )
            .await
            .unwrap();
        harness
    }

    #[tokio::test]
    async fn missing_fields_are_bad_requests() {
        let harness = Harness::ready(TestServices::default());
        let mut incomplete = data(Utc::now());
        incomplete.remove("operation_response");

        harness.run(JobKind::OperationStatusPoller, incomplete).await;

        let mut snapshot = data(Utc::now());
        snapshot.insert("operation".to_owned(), json!("snapshot"));
        harness.run(JobKind::OperationStatusPoller, snapshot).await;

        let runs = harness.repository.runs();
        assert_eq!(runs[0].status_code, "ERR_BAD_REQUEST");
        assert_eq!(runs[1].status_code, "ERR_SNAPSHOT_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn polls_without_an_operation_start_are_rejected_before_polling() {
        let mut services = TestServices::default();
        services.authority.expect_get_status().never();
        services.authority.expect_abort().never();
        let harness = harness(services).await;

        let mut missing = data(Utc::now());
        missing.remove("operation_job_started_at");
        harness.run(JobKind::OperationStatusPoller, missing).await;

        let mut garbled = data(Utc::now());
        garbled.insert("operation_job_started_at".to_owned(), json!("yesterday"));
        harness.run(JobKind::OperationStatusPoller, garbled).await;

        let runs = harness.repository.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.status_code == "ERR_BAD_REQUEST"));
        assert!(harness
            .manager
            .get_schedule(SCHEDULE_NAME, JobKind::OperationStatusPoller)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn in_flight_operations_keep_polling() {
        let mut services = TestServices::default();
        services
            .authority
            .expect_get_status()
            .withf(|deployment, kind, handle| {
                deployment == "deployment-1"
                    && *kind == OperationKind::Backup
                    && handle["backup_guid"] == "guid-1"
            })
            .returning(|_, _, _| Ok(status("processing")));
        let harness = harness(services).await;

        harness
            .run(JobKind::OperationStatusPoller, data(Utc::now()))
            .await;

        let runs = harness.repository.runs();
        assert_eq!(runs[0].status_code, STATUS_SUCCEEDED);
        assert_eq!(runs[0].response["operationTimedOut"], json!(false));
        assert_eq!(runs[0].response["jobCancelled"], json!(false));
        assert_eq!(runs[0].response["stage"], json!("uploading"));
        assert!(harness
            .manager
            .get_schedule(SCHEDULE_NAME, JobKind::OperationStatusPoller)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn finished_operations_cancel_the_poll() {
        let mut services = TestServices::default();
        services
            .authority
            .expect_get_status()
            .returning(|_, _, _| Ok(status("succeeded")));
        let harness = harness(services).await;

        harness
            .run(JobKind::OperationStatusPoller, data(Utc::now()))
            .await;

        let runs = harness.repository.runs();
        assert_eq!(runs[0].status_code, STATUS_SUCCEEDED);
        assert_eq!(runs[0].response["operationFinished"], json!(true));
        assert_eq!(runs[0].response["jobCancelled"], json!(true));
        assert!(harness
            .manager
            .get_schedule(SCHEDULE_NAME, JobKind::OperationStatusPoller)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn failed_operations_fail_the_run() {
        let mut services = TestServices::default();
        services
            .authority
            .expect_get_status()
            .returning(|_, _, _| Ok(status("aborted")));
        let harness = harness(services).await;

        harness
            .run(JobKind::OperationStatusPoller, data(Utc::now()))
            .await;

        assert_eq!(
            harness.repository.runs()[0].status_code,
            "ERR_DEPLOYMENT_BACKUP_ABORTED"
        );
    }

    #[tokio::test]
    async fn stale_operations_are_aborted_and_time_out() {
        let mut services = TestServices::default();
        services
            .authority
            .expect_get_status()
            .returning(|_, _, _| Ok(status("processing")));
        services
            .authority
            .expect_abort()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let harness = harness(services).await;

        harness
            .run(
                JobKind::OperationStatusPoller,
                data(Utc::now() - TimeDelta::days(2)),
            )
            .await;

        let runs = harness.repository.runs();
        assert_eq!(runs[0].status_code, "ERR_BACKUP_TIME_OUT");
        assert_eq!(runs[0].response["operationTimedOut"], json!(true));
        assert_eq!(runs[0].response["jobCancelled"], json!(true));
        assert_eq!(runs[0].response["state"], json!("processing"));
    }

    #[tokio::test]
    async fn vanished_operations_mark_the_artifact_aborted() {
        let mut services = TestServices::default();
        services
            .authority
            .expect_get_status()
            .returning(|_, _, _| Err(JobFabrikError::NotFound("no such backup".to_owned())));
        services
            .artifacts
            .expect_patch_metadata()
            .withf(|artifact, state| {
                artifact.guid == "guid-1"
                    && artifact.tenant_id.as_deref() == Some("space")
                    && *state == ArtifactState::Aborted
            })
            .times(1)
            .returning(|_, _| Err(JobFabrikError::Transport("reset".to_owned())));
        let harness = harness(services).await;

        harness
            .run(JobKind::OperationStatusPoller, data(Utc::now()))
            .await;

        assert_eq!(harness.repository.runs()[0].status_code, "ERR_NOT_FOUND");
        assert!(harness.repository.schedules().is_empty());
    }
}
