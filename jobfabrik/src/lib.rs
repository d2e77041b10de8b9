//! A control-plane job engine.
//!
//! The crate is organised around a handful of cooperating pieces:
//!
//! - [`scheduler::Scheduler`] wraps the persistent due-job queue (the [`backend::Backend`]) and
//!   runs the poll loop that claims and executes due jobs.
//! - [`manager::ScheduleManager`] is the facade the rest of a system talks to. It pairs every
//!   engine record with an intent record held by a [`repository::Repository`].
//! - [`catalog::JobCatalog`] maps a [`job::JobKind`] to the [`catalog::Runnable`] that executes
//!   it, and [`job::run::JobRun`] is the envelope a runnable uses to finalize a run.
//! - [`supervisor::Supervisor`] keeps a fleet of worker processes alive.
//! - [`jobs`] holds the maintenance jobs themselves.

use thiserror::Error;

use backend::BackendError;
use config::UntrackedCondition;

pub mod backend;
pub mod backoff;
pub mod catalog;
pub mod config;
pub mod interval;
pub mod job;
pub mod jobs;
pub mod lifecycle;
pub mod manager;
pub mod notifier;
pub mod prelude;
pub mod repository;
pub mod scheduler;
pub mod services;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

/// Status code recorded in the run history for a successful run.
pub const STATUS_SUCCEEDED: &str = "0";

/// Errors raised by the job engine, its jobs and the collaborators they call.
#[derive(Debug, Error)]
pub enum JobFabrikError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),
    #[error("Deployment locked by an ongoing {operation} operation: {message}")]
    DeploymentLocked { operation: String, message: String },
    #[error("Deployment staggered: {0}")]
    DeploymentStaggered(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Operation {0} is not supported")]
    OperationNotSupported(String),
    #[error("{message}")]
    Operation { code: String, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobFabrikError>;

impl JobFabrikError {
    /// The code written into the run history alongside the error message.
    pub fn status_code(&self) -> String {
        match self {
            Self::BadRequest(_) => "ERR_BAD_REQUEST".to_owned(),
            Self::ServiceUnavailable(_) => "ERR_SERVICE_UNAVAILABLE".to_owned(),
            Self::NotFound(_) => "ERR_NOT_FOUND".to_owned(),
            Self::Conflict(_) => "ERR_CONFLICT".to_owned(),
            Self::Forbidden(_) => "ERR_FORBIDDEN".to_owned(),
            Self::UnprocessableEntity(_) => "ERR_UNPROCESSABLE_ENTITY".to_owned(),
            Self::DeploymentLocked { .. } => "ERR_DEPLOYMENT_LOCKED".to_owned(),
            Self::DeploymentStaggered(_) => "ERR_DEPLOYMENT_STAGGERED".to_owned(),
            Self::NotImplemented(_) => "ERR_NOT_IMPLEMENTED".to_owned(),
            Self::OperationNotSupported(kind) => {
                format!("ERR_{}_NOT_SUPPORTED", kind.to_uppercase())
            }
            Self::Operation { code, .. } => code.clone(),
            Self::Transport(_) => "ERR_TRANSPORT".to_owned(),
            Self::Backend(_) => "ERR_BACKEND".to_owned(),
            Self::Encode(_) => "ERR_ENCODE_DECODE".to_owned(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Failures caused by transport or store trouble rather than by the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Backend(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Maps the error onto one of the conditions that may be configured to not count as a
    /// tracked attempt.
    pub fn untracked_condition(&self) -> Option<UntrackedCondition> {
        match self {
            Self::DeploymentLocked { operation, .. } if operation == "backup" => {
                Some(UntrackedCondition::BackupInProgress)
            }
            Self::DeploymentLocked { .. } | Self::Conflict(_) | Self::UnprocessableEntity(_) => {
                Some(UntrackedCondition::ResourceLocked)
            }
            Self::DeploymentStaggered(_) => Some(UntrackedCondition::OrchestratorOverloaded),
            _ => None,
        }
    }
}
