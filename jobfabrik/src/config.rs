//! Configuration for the scheduler and the jobs it runs.
//!
//! Every struct deserializes from a partial document: any field left out falls back to the value
//! given by the struct's [`Default`] implementation.
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{
    interval::{self, RepeatInterval},
    job::{JobData, JobKind},
    JobFabrikError, Result,
};

const DEFAULT_PROCESS_EVERY: &str = "1 minute";
const DEFAULT_MAX_CONCURRENCY: usize = 20;
const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_LOCK_LIFETIME_MS: u64 = 180_000;
const DEFAULT_RESCHEDULE_DELAY: &str = "10 minutes";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETENTION_PERIOD_IN_DAYS: i64 = 14;
const DEFAULT_STATUS_POLLER_TIMEOUT_MS: u64 = 86_400_000;
const DEFAULT_RUN_EVERY_XDAYS: u32 = 15;

/// Failure conditions that may be configured to not count toward a job's attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntrackedCondition {
    /// The resource is locked by a concurrent mutation.
    ResourceLocked,
    /// The deployment is locked by a running backup.
    BackupInProgress,
    /// The orchestrator refused the work because too many updates are in flight.
    OrchestratorOverloaded,
}

/// One entry of the system-job bootstrap list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemJobDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobKind,
    pub interval: String,
    #[serde(default)]
    pub job_data: JobData,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Job types this process accepts. An empty list disables the scheduler.
    pub job_types: Vec<JobKind>,
    /// Ceiling on the number of worker processes. Defaults to one less than the cpu count.
    pub max_workers: Option<usize>,
    /// How often the poll loop looks for due jobs, as a human readable duration.
    pub process_every: String,
    pub max_concurrency: usize,
    pub default_concurrency: usize,
    /// Milliseconds after which a held lock is considered stale and may be reclaimed.
    pub default_lock_lifetime: u64,
    /// Whether this process hosts a poll loop.
    pub run_poll_loop: bool,
    /// Milliseconds the supervisor waits before it spawns the first worker.
    pub start_delay: u64,
    pub system_jobs: Vec<SystemJobDefinition>,
    pub test_mode: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_types: JobKind::ALL.to_vec(),
            max_workers: None,
            process_every: DEFAULT_PROCESS_EVERY.to_owned(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_concurrency: DEFAULT_CONCURRENCY,
            default_lock_lifetime: DEFAULT_LOCK_LIFETIME_MS,
            run_poll_loop: true,
            start_delay: 0,
            system_jobs: Vec::new(),
            test_mode: false,
        }
    }
}

impl SchedulerConfig {
    pub fn is_enabled(&self, kind: JobKind) -> bool {
        self.job_types.contains(&kind)
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        match RepeatInterval::parse(&self.process_every)? {
            RepeatInterval::Every(delta) => delta.to_std().map_err(|_| {
                JobFabrikError::BadRequest(format!(
                    "Poll interval must be positive: {}",
                    self.process_every
                ))
            }),
            RepeatInterval::Cron(_) => Err(JobFabrikError::BadRequest(format!(
                "Poll interval must be a duration: {}",
                self.process_every
            ))),
        }
    }

    pub fn lock_lifetime(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.default_lock_lifetime as i64)
    }

    /// Stretches the poll cadence to one poll every `workers` minutes so that a fleet of
    /// `workers` processes polls roughly once per minute in aggregate.
    pub fn for_fleet(self, workers: usize) -> Self {
        let process_every = match workers {
            0 | 1 => DEFAULT_PROCESS_EVERY.to_owned(),
            workers => format!("{workers} minutes"),
        };
        Self {
            process_every,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledBackupConfig {
    pub max_attempts: u32,
    pub untracked_conditions: Vec<UntrackedCondition>,
    /// Milliseconds between consecutive artifact deletions.
    pub delete_delay: u64,
}

impl Default for ScheduledBackupConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            untracked_conditions: vec![
                UntrackedCondition::ResourceLocked,
                UntrackedCondition::BackupInProgress,
            ],
            delete_delay: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupReaperConfig {
    pub delete_delay: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstanceUpdateConfig {
    pub max_attempts: u32,
    pub untracked_conditions: Vec<UntrackedCondition>,
    /// Manifest sections an update may change without a force-update policy.
    pub allowed_sections: Vec<String>,
    pub run_every_xdays: u32,
    pub should_start_after_hr: u32,
    pub should_start_before_hr: u32,
    pub should_start_after_min: u32,
    pub should_start_before_min: u32,
}

impl Default for ServiceInstanceUpdateConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            untracked_conditions: vec![
                UntrackedCondition::BackupInProgress,
                UntrackedCondition::OrchestratorOverloaded,
            ],
            allowed_sections: ["update", "releases", "tags", "addons"]
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
            run_every_xdays: DEFAULT_RUN_EVERY_XDAYS,
            should_start_after_hr: 0,
            should_start_before_hr: 23,
            should_start_after_min: 0,
            should_start_before_min: 59,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub retention_period_in_days: i64,
    /// Milliseconds after which a backup or restore still in flight is abandoned.
    pub status_poller_timeout: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_period_in_days: DEFAULT_RETENTION_PERIOD_IN_DAYS,
            status_poller_timeout: DEFAULT_STATUS_POLLER_TIMEOUT_MS,
        }
    }
}

impl BackupConfig {
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(self.retention_period_in_days)
    }

    pub fn status_poller_timeout(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.status_poller_timeout as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub service_instance_auto_update: bool,
}

/// Settings consumed by the jobs themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Default delay before a follow-up one-shot run, as a human readable duration.
    pub reschedule_delay: String,
    pub scheduled_backup: ScheduledBackupConfig,
    pub backup_reaper: BackupReaperConfig,
    pub service_instance_update: ServiceInstanceUpdateConfig,
    pub backup: BackupConfig,
    pub features: FeatureFlags,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            reschedule_delay: DEFAULT_RESCHEDULE_DELAY.to_owned(),
            scheduled_backup: Default::default(),
            backup_reaper: Default::default(),
            service_instance_update: Default::default(),
            backup: Default::default(),
            features: Default::default(),
        }
    }
}

impl JobsConfig {
    pub fn validate(&self) -> Result<()> {
        interval::parse_human_duration(&self.reschedule_delay).ok_or_else(|| {
            JobFabrikError::BadRequest(format!(
                "Invalid reschedule delay {}",
                self.reschedule_delay
            ))
        })?;
        Ok(())
    }
}
