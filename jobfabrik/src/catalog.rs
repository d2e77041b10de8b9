use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;

use crate::{
    config::JobsConfig,
    job::{
        run::{Completion, JobRun},
        JobKind,
    },
    jobs::{BackupReaperJob, OperationStatusPollerJob, ScheduleBackupJob, ServiceInstanceUpdateJob},
    services::{ArtifactStore, BackupAuthority, DeploymentOrchestrator, ResourceDirectory},
    Result,
};

/// A job implementation.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Executes one run. The run must be finalized through [`JobRun::succeeded`] or
    /// [`JobRun::failed`], which is the only way to obtain a [`Completion`].
    async fn run(&self, run: JobRun) -> Completion;

    /// A repeat interval for schedules requested with the `"random"` interval.
    fn random_repeat_interval(&self) -> Result<String>;
}

/// Everything a job implementation may call.
#[derive(Clone)]
pub struct Services {
    pub authority: Arc<dyn BackupAuthority>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub orchestrator: Arc<dyn DeploymentOrchestrator>,
    pub config: Arc<JobsConfig>,
}

/// Maps each [`JobKind`] to its [`Runnable`].
///
/// The table is built on first lookup, after every handle the jobs depend on exists.
pub struct JobCatalog {
    services: Services,
    table: OnceLock<HashMap<JobKind, Arc<dyn Runnable>>>,
}

impl std::fmt::Debug for JobCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCatalog")
            .field("loaded", &self.table.get().is_some())
            .finish()
    }
}

impl JobCatalog {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            table: OnceLock::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// # Panics
    ///
    /// When no runnable is registered for `kind`.
    pub fn get(&self, kind: JobKind) -> Arc<dyn Runnable> {
        let table = self.table.get_or_init(|| Self::register(&self.services));
        match table.get(&kind) {
            Some(runnable) => runnable.clone(),
            None => panic!("No job registered for job type {kind}"),
        }
    }

    fn register(services: &Services) -> HashMap<JobKind, Arc<dyn Runnable>> {
        tracing::debug!("Loading job catalog");
        let runnables: [(JobKind, Arc<dyn Runnable>); 4] = [
            (
                JobKind::ScheduledBackup,
                Arc::new(ScheduleBackupJob::new(services.clone())),
            ),
            (
                JobKind::BackupReaper,
                Arc::new(BackupReaperJob::new(services.clone())),
            ),
            (
                JobKind::OperationStatusPoller,
                Arc::new(OperationStatusPollerJob::new(services.clone())),
            ),
            (
                JobKind::ServiceInstanceUpdate,
                Arc::new(ServiceInstanceUpdateJob::new(services.clone())),
            ),
        ];
        runnables.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestServices;

    #[test]
    fn every_kind_is_registered() {
        let catalog = JobCatalog::new(TestServices::default().build());

        assert!(catalog.table.get().is_none());
        for kind in JobKind::ALL {
            catalog.get(kind);
        }
        assert!(catalog.table.get().is_some());
    }

    #[test]
    fn random_repeat_intervals() {
        let catalog = JobCatalog::new(TestServices::default().build());

        assert!(catalog
            .get(JobKind::ScheduledBackup)
            .random_repeat_interval()
            .is_ok());
        assert!(catalog
            .get(JobKind::OperationStatusPoller)
            .random_repeat_interval()
            .is_err());
    }
}
