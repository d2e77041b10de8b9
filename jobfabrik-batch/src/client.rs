//! HTTP client for the broker's admin API, which fronts every collaborator the jobs call.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use jobfabrik::{
    services::{
        ArtifactRef, ArtifactScope, ArtifactState, ArtifactStore, BackupArtifact,
        BackupAuthority, BackupRequest, BackupTrigger, Changeset, DeleteOutcome,
        DeletePrecondition, DeploymentOrchestrator, OperationKind, OperationStatus,
        ResourceDetails, ResourceDirectory, UpdateRequest,
    },
    JobFabrikError, Result,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::settings::BrokerSettings;

#[derive(Clone, Debug)]
pub struct BrokerClient {
    client: Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
}

/// Error body returned by the broker.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "description")]
    message: Option<String>,
    /// Set when a deployment is locked by a running operation.
    #[serde(default)]
    lock_operation: Option<String>,
}

impl BrokerClient {
    pub fn new(settings: &BrokerSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: Url::parse(&settings.url)?,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                JobFabrikError::BadRequest(format!("Invalid broker url {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["admin"].iter().chain(segments));
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        tracing::debug!(%status, ?body, "Broker request failed");
        Err(status_error(status, body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request).await?.json().await.map_err(transport)
    }
}

fn transport(err: reqwest::Error) -> JobFabrikError {
    JobFabrikError::Transport(err.to_string())
}

fn status_error(status: StatusCode, body: ErrorBody) -> JobFabrikError {
    let message = body.message.unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => JobFabrikError::NotFound(message),
        StatusCode::CONFLICT => JobFabrikError::Conflict(message),
        StatusCode::FORBIDDEN => JobFabrikError::Forbidden(message),
        StatusCode::UNPROCESSABLE_ENTITY => match body.lock_operation {
            Some(operation) => JobFabrikError::DeploymentLocked { operation, message },
            None => JobFabrikError::UnprocessableEntity(message),
        },
        StatusCode::TOO_MANY_REQUESTS => JobFabrikError::DeploymentStaggered(message),
        StatusCode::SERVICE_UNAVAILABLE => JobFabrikError::ServiceUnavailable(message),
        StatusCode::BAD_REQUEST => JobFabrikError::BadRequest(message),
        StatusCode::NOT_IMPLEMENTED => JobFabrikError::NotImplemented(message),
        _ => JobFabrikError::Transport(format!("{status}: {message}")),
    }
}

fn trigger(trigger: BackupTrigger) -> &'static str {
    match trigger {
        BackupTrigger::Scheduled => "scheduled",
        BackupTrigger::OnDemand => "on-demand",
    }
}

#[async_trait]
impl BackupAuthority for BrokerClient {
    async fn start_backup(&self, request: BackupRequest) -> Result<Value> {
        let url = self.url(&["service_instances", &request.instance_id, "backup"], &[])?;
        self.json(self.request(Method::POST, url).json(&request)).await
    }

    async fn abort(&self, deployment: &str, kind: OperationKind, handle: &Value) -> Result<()> {
        let url = self.url(&["deployments", deployment, kind.as_str(), "abort"], &[])?;
        self.send(self.request(Method::POST, url).json(handle)).await?;
        Ok(())
    }

    async fn get_status(
        &self,
        deployment: &str,
        kind: OperationKind,
        handle: &Value,
    ) -> Result<OperationStatus> {
        let url = self.url(&["deployments", deployment, kind.as_str(), "status"], &[])?;
        self.json(self.request(Method::POST, url).json(handle)).await
    }
}

#[async_trait]
impl ResourceDirectory for BrokerClient {
    async fn find_owner_by_instance_id(&self, instance_id: &str) -> Result<ResourceDetails> {
        let url = self.url(&["service_instances", instance_id], &[])?;
        self.json(self.request(Method::GET, url)).await
    }
}

#[async_trait]
impl ArtifactStore for BrokerClient {
    async fn list_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: &ArtifactScope,
    ) -> Result<Vec<BackupArtifact>> {
        let before = cutoff.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut query = vec![("before", before.as_str())];
        if let ArtifactScope::Instance(instance_id) = scope {
            query.push(("instance_id", instance_id.as_str()));
        }
        let url = self.url(&["backups"], &query)?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn download(&self, artifact: &ArtifactRef) -> Result<BackupArtifact> {
        let query: Vec<_> = artifact
            .tenant_id
            .as_deref()
            .map(|tenant_id| ("tenant_id", tenant_id))
            .into_iter()
            .collect();
        let url = self.url(&["backups", &artifact.guid], &query)?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn delete(
        &self,
        artifact: &ArtifactRef,
        precondition: Option<DeletePrecondition>,
    ) -> Result<DeleteOutcome> {
        let mut query = Vec::new();
        if let Some(tenant_id) = artifact.tenant_id.as_deref() {
            query.push(("tenant_id", tenant_id));
        }
        if let Some(precondition) = precondition {
            query.push(("trigger", trigger(precondition.trigger)));
        }
        let url = self.url(&["backups", &artifact.guid], &query)?;
        let response = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Ok(DeleteOutcome::PreconditionNotMet),
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            status => {
                let body = response.json::<ErrorBody>().await.unwrap_or_default();
                Err(status_error(status, body))
            }
        }
    }

    async fn patch_metadata(&self, artifact: &ArtifactRef, state: ArtifactState) -> Result<()> {
        let url = self.url(&["backups", &artifact.guid], &[])?;
        let body = json!({ "state": state, "tenant_id": artifact.tenant_id });
        self.send(self.request(Method::PATCH, url).json(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentOrchestrator for BrokerClient {
    async fn diff(&self, instance_id: &str, deployment_name: &str) -> Result<Changeset> {
        let url = self.url(
            &["deployments", deployment_name, "diff"],
            &[("instance_id", instance_id)],
        )?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn trigger_update(&self, request: UpdateRequest) -> Result<Value> {
        let url = self.url(&["service_instances", &request.instance_id, "update"], &[])?;
        self.json(self.request(Method::POST, url).json(&request)).await
    }
}
