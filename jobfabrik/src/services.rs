//! Interfaces of the collaborators the jobs call.
//!
//! Implementations live outside this crate; every call returns [`crate::Result`] and reports a
//! missing resource as [`crate::JobFabrikError::NotFound`].
use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{job::JobData, JobFabrikError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupTrigger {
    Scheduled,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = JobFabrikError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            other => Err(JobFabrikError::OperationNotSupported(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Processing,
    Succeeded,
    Failed,
    Aborting,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown",
        }
    }
}

/// Status of a backup or restore as reported by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub state: OperationState,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub details: JobData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub instance_id: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub trigger: BackupTrigger,
}

/// State recorded in an artifact's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    Processing,
    Succeeded,
    Failed,
    Aborted,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub guid: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub guid: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub trigger: BackupTrigger,
    pub state: ArtifactState,
    pub started_at: DateTime<Utc>,
}

impl BackupArtifact {
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            guid: self.guid.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactScope {
    All,
    Instance(String),
}

/// Condition a conditional delete checks against the stored metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePrecondition {
    pub trigger: BackupTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    PreconditionNotMet,
}

/// The directory's view of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetails {
    pub instance_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    /// The resource's update policy allows changes outside the allowed sections.
    #[serde(default)]
    pub force_update: bool,
    /// The owner asked for deletion but the resource still exists.
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChange {
    pub section: String,
    pub line: String,
    pub change: ChangeType,
}

/// Desired-versus-live difference of a deployment manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub changes: Vec<ManifestChange>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Sections touched by the changeset that are not in `allowed`.
    pub fn forbidden_sections<'a>(&'a self, allowed: &[String]) -> Vec<&'a str> {
        let mut sections: Vec<&str> = self
            .changes
            .iter()
            .map(|change| change.section.as_str())
            .filter(|section| !allowed.iter().any(|allowed| allowed == section))
            .collect();
        sections.sort_unstable();
        sections.dedup();
        sections
    }

    /// The changeset as `+`/`-` prefixed lines.
    pub fn unified(&self) -> Vec<String> {
        self.changes
            .iter()
            .map(|change| match change.change {
                ChangeType::Added => format!("+{}", change.line),
                ChangeType::Removed => format!("-{}", change.line),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub deployment_name: String,
    pub plan_id: Option<String>,
    pub context: Value,
    pub run_immediately: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupAuthority: Send + Sync {
    /// Starts a backup and returns the operation handle.
    async fn start_backup(&self, request: BackupRequest) -> Result<Value>;
    async fn abort(&self, deployment: &str, kind: OperationKind, handle: &Value) -> Result<()>;
    async fn get_status(
        &self,
        deployment: &str,
        kind: OperationKind,
        handle: &Value,
    ) -> Result<OperationStatus>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Fails with NotFound once the resource has been deleted.
    async fn find_owner_by_instance_id(&self, instance_id: &str) -> Result<ResourceDetails>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: &ArtifactScope,
    ) -> Result<Vec<BackupArtifact>>;
    async fn download(&self, artifact: &ArtifactRef) -> Result<BackupArtifact>;
    async fn delete(
        &self,
        artifact: &ArtifactRef,
        precondition: Option<DeletePrecondition>,
    ) -> Result<DeleteOutcome>;
    async fn patch_metadata(&self, artifact: &ArtifactRef, state: ArtifactState) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentOrchestrator: Send + Sync {
    async fn diff(&self, instance_id: &str, deployment_name: &str) -> Result<Changeset>;
    /// Starts an update and returns the operation handle.
    async fn trigger_update(&self, request: UpdateRequest) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn operation_kind_parsing() {
        assert_eq!("restore".parse::<OperationKind>().unwrap(), OperationKind::Restore);
        assert_matches!(
            "snapshot".parse::<OperationKind>(),
            Err(JobFabrikError::OperationNotSupported(kind)) if kind == "snapshot"
        );
    }

    #[test]
    fn status_keeps_unknown_fields() {
        let status: OperationStatus = serde_json::from_value(json!({
            "state": "processing",
            "stage": "uploading",
            "progress": 40
        }))
        .unwrap();

        assert_eq!(status.state, OperationState::Processing);
        assert!(!status.state.is_terminal());
        assert_eq!(status.details.get("progress"), Some(&json!(40)));
        assert_eq!(
            serde_json::from_value::<OperationStatus>(json!({"state": "exploded"}))
                .unwrap()
                .state,
            OperationState::Unknown
        );
    }

    #[test]
    fn changeset_sections() {
        let changeset = Changeset {
            changes: vec![
                ManifestChange {
                    section: "releases".to_owned(),
                    line: "version: 2".to_owned(),
                    change: ChangeType::Added,
                },
                ManifestChange {
                    section: "instance_groups".to_owned(),
                    line: "instances: 3".to_owned(),
                    change: ChangeType::Removed,
                },
            ],
        };
        let allowed = vec!["releases".to_owned(), "update".to_owned()];

        assert_eq!(changeset.forbidden_sections(&allowed), vec!["instance_groups"]);
        assert_eq!(changeset.unified(), vec!["+version: 2", "-instances: 3"]);
    }
}
