use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use jobfabrik::{
    backend::memory::InMemoryBackend,
    prelude::*,
    repository::memory::InMemoryRepository,
    services::{
        ArtifactRef, ArtifactScope, ArtifactState, ArtifactStore, BackupArtifact, BackupAuthority,
        BackupRequest, Changeset, DeleteOutcome, DeletePrecondition, DeploymentOrchestrator,
        OperationKind, OperationStatus, ResourceDetails, ResourceDirectory, UpdateRequest,
    },
    STATUS_SUCCEEDED,
};

/// Every resource is gone and no artifact exists.
struct Empty;

#[async_trait]
impl BackupAuthority for Empty {
    async fn start_backup(&self, request: BackupRequest) -> Result<Value> {
        Err(JobFabrikError::NotFound(request.instance_id))
    }

    async fn abort(&self, _: &str, _: OperationKind, _: &Value) -> Result<()> {
        Ok(())
    }

    async fn get_status(&self, deployment: &str, _: OperationKind, _: &Value) -> Result<OperationStatus> {
        Err(JobFabrikError::NotFound(deployment.to_owned()))
    }
}

#[async_trait]
impl ResourceDirectory for Empty {
    async fn find_owner_by_instance_id(&self, instance_id: &str) -> Result<ResourceDetails> {
        Err(JobFabrikError::NotFound(instance_id.to_owned()))
    }
}

#[async_trait]
impl ArtifactStore for Empty {
    async fn list_older_than(
        &self,
        _: DateTime<Utc>,
        _: &ArtifactScope,
    ) -> Result<Vec<BackupArtifact>> {
        Ok(vec![])
    }

    async fn download(&self, artifact: &ArtifactRef) -> Result<BackupArtifact> {
        Err(JobFabrikError::NotFound(artifact.guid.clone()))
    }

    async fn delete(
        &self,
        _: &ArtifactRef,
        _: Option<DeletePrecondition>,
    ) -> Result<DeleteOutcome> {
        Ok(DeleteOutcome::Deleted)
    }

    async fn patch_metadata(&self, _: &ArtifactRef, _: ArtifactState) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DeploymentOrchestrator for Empty {
    async fn diff(&self, _: &str, _: &str) -> Result<Changeset> {
        Ok(Changeset::default())
    }

    async fn trigger_update(&self, request: UpdateRequest) -> Result<Value> {
        Err(JobFabrikError::NotFound(request.instance_id))
    }
}

#[tokio::test]
async fn deleted_instance_backup_schedule_runs_and_cancels_itself() {
    let backend = InMemoryBackend::new();
    let repository = InMemoryRepository::new();
    let bus = EventBus::new();
    let empty = Arc::new(Empty);
    let services = Services {
        authority: empty.clone(),
        directory: empty.clone(),
        artifacts: empty.clone(),
        orchestrator: empty,
        config: Arc::new(JobsConfig::default()),
    };
    let config = SchedulerConfig {
        process_every: "50 milliseconds".to_owned(),
        test_mode: true,
        ..Default::default()
    };
    let scheduler = Scheduler::new(
        config,
        Arc::new(backend.clone()),
        Arc::new(repository.clone()),
        Arc::new(JobCatalog::new(services)),
        bus.clone(),
    );
    let manager = ScheduleManager::new(scheduler.clone());
    let listener = scheduler.listen().expect("job types are enabled");
    let mut events = bus.subscribe();

    bus.publish(Event::DbOperational);
    while events.recv().await.expect("bus stays open") != Event::SchedulerReady {}
    assert_eq!(scheduler.state(), SchedulerState::Ready);

    let mut data = JobData::new();
    data.insert("instance_id".to_owned(), json!("abc"));
    data.insert("type".to_owned(), json!("online"));
    let schedule = manager
        .schedule(
            "abc",
            JobKind::ScheduledBackup,
            "*/1 * * * *",
            data.clone(),
            &User::new("operator"),
        )
        .await
        .unwrap();
    assert_eq!(schedule.repeat_interval.as_deref(), Some("*/1 * * * *"));

    scheduler
        .run_now("abc", JobKind::ScheduledBackup, data)
        .await
        .unwrap();
    for _ in 0..200 {
        if repository.schedules().is_empty() && !repository.runs().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let runs = repository.runs();
    assert!(!runs.is_empty());
    assert_eq!(runs[0].name, "abc");
    assert_eq!(runs[0].status_code, STATUS_SUCCEEDED);
    assert_eq!(runs[0].response["start_backup_status"], json!("instance_deleted"));
    assert_eq!(
        runs[0].response["delete_backup_status"]["job_cancelled"],
        json!(true)
    );
    assert!(repository.schedules().is_empty());
    assert!(manager
        .get_schedule("abc", JobKind::ScheduledBackup)
        .await
        .unwrap_err()
        .is_not_found());

    bus.publish(Event::AppShuttingDown);
    listener.await.unwrap();
}
