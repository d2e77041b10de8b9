//! Shared fixtures for unit tests.
use std::sync::Arc;

use chrono::TimeDelta;

use crate::{
    backend::{memory::InMemoryBackend, Backend},
    catalog::{JobCatalog, Services},
    config::{JobsConfig, SchedulerConfig},
    job::{Job, JobData, JobKind},
    manager::ScheduleManager,
    notifier::EventBus,
    repository::memory::InMemoryRepository,
    scheduler::{poller, Scheduler},
    services::{
        MockArtifactStore, MockBackupAuthority, MockDeploymentOrchestrator, MockResourceDirectory,
    },
};

/// Collaborator mocks plus the job configuration, turned into [`Services`] by [`Self::build`].
pub(crate) struct TestServices {
    pub authority: MockBackupAuthority,
    pub directory: MockResourceDirectory,
    pub artifacts: MockArtifactStore,
    pub orchestrator: MockDeploymentOrchestrator,
    pub config: JobsConfig,
}

impl Default for TestServices {
    fn default() -> Self {
        Self {
            authority: MockBackupAuthority::new(),
            directory: MockResourceDirectory::new(),
            artifacts: MockArtifactStore::new(),
            orchestrator: MockDeploymentOrchestrator::new(),
            config: JobsConfig::default(),
        }
    }
}

impl TestServices {
    pub fn build(self) -> Services {
        Services {
            authority: Arc::new(self.authority),
            directory: Arc::new(self.directory),
            artifacts: Arc::new(self.artifacts),
            orchestrator: Arc::new(self.orchestrator),
            config: Arc::new(self.config),
        }
    }
}

/// Every job type enabled, no poll loop.
pub(crate) fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        run_poll_loop: false,
        test_mode: true,
        ..Default::default()
    }
}

pub(crate) struct Harness {
    pub backend: InMemoryBackend,
    pub repository: InMemoryRepository,
    pub bus: EventBus,
    pub scheduler: Scheduler,
    pub manager: ScheduleManager,
}

impl Harness {
    pub fn new(services: TestServices, config: SchedulerConfig) -> Self {
        let backend = InMemoryBackend::new();
        let repository = InMemoryRepository::new();
        let bus = EventBus::new();
        let catalog = Arc::new(JobCatalog::new(services.build()));
        let scheduler = Scheduler::new(
            config,
            Arc::new(backend.clone()),
            Arc::new(repository.clone()),
            catalog,
            bus.clone(),
        );
        let manager = ScheduleManager::new(scheduler.clone());
        Self {
            backend,
            repository,
            bus,
            scheduler,
            manager,
        }
    }

    /// A harness whose scheduler is already ready.
    pub fn ready(services: TestServices) -> Self {
        let harness = Self::new(services, scheduler_config());
        harness.scheduler.initialize();
        harness
    }

    /// Queues a one-shot of `kind` and claims it the way the poll loop would.
    pub async fn claim(&self, kind: JobKind, data: JobData) -> Job {
        self.scheduler
            .run_now("test", kind, data)
            .await
            .expect("one-shot should be queued");
        self.backend
            .lock_next_due(kind, TimeDelta::minutes(3))
            .await
            .expect("backend should be available")
            .expect("queued one-shot should be due")
    }

    /// Claims and executes a one-shot of `kind` to completion.
    pub async fn run(&self, kind: JobKind, data: JobData) {
        let job = self.claim(kind, data).await;
        poller::execute_job(self.scheduler.clone(), job).await;
    }
}
