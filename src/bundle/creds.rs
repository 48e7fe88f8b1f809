//! Credential extraction from completed bundle pods.
//!
//! Runtime v1 bundles emit base64(JSON) on stdout when `broker-bind-creds`
//! is exec'd in the container; runtime v2 and later write a secret named
//! after the pod into the pod's own namespace with the JSON under `fields`.
//! Extracted credentials are persisted as a secret in the broker's own
//! namespace keyed by the owning instance or binding id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cluster::types::{ObjectMeta, Secret};
use crate::cluster::{ClusterError, OrchestratorClient, PodPhase};

use super::types::{ExtractedCredentials, JobMethod};
use super::ExecutorError;

/// Command exec'd in runtime v1 bundles to gather bind credentials.
pub const GATHER_CREDENTIALS_COMMAND: &str = "broker-bind-creds";

/// Secret key holding the raw JSON in runtime v2 bundle secrets.
pub const FIELDS_SECRET_KEY: &str = "fields";

/// Secret key under which the broker persists extracted credentials.
pub const CREDENTIALS_SECRET_KEY: &str = "credentials";

/// Labels stamped on persisted extracted-credential secrets.
pub const ACTION_LABEL_KEY: &str = "apbAction";
pub const NAME_LABEL_KEY: &str = "apbName";

/// Protocol for retrieving a credential map from a completed bundle pod.
#[async_trait]
pub trait CredentialExtractor: Send + Sync {
    async fn extract(
        &self,
        pod_name: &str,
        namespace: &str,
    ) -> Result<Option<ExtractedCredentials>, ExecutorError>;
}

/// Picks the extraction protocol for a spec's runtime version.
pub fn for_runtime(
    runtime: i32,
    client: Arc<dyn OrchestratorClient>,
    exec_retries: u32,
    exec_interval: Duration,
) -> Result<Box<dyn CredentialExtractor>, ExecutorError> {
    match runtime {
        1 => Ok(Box::new(FileOverExec {
            client,
            retries: exec_retries,
            interval: exec_interval,
        })),
        r if r >= 2 => Ok(Box::new(NamespaceSecret { client })),
        r => Err(ExecutorError::UnsupportedRuntime(r)),
    }
}

/// Runtime v1: exec `broker-bind-creds` and decode its stdout, retrying
/// until the pod reaches a terminal phase.
pub struct FileOverExec {
    client: Arc<dyn OrchestratorClient>,
    retries: u32,
    interval: Duration,
}

#[async_trait]
impl CredentialExtractor for FileOverExec {
    async fn extract(
        &self,
        pod_name: &str,
        namespace: &str,
    ) -> Result<Option<ExtractedCredentials>, ExecutorError> {
        let command = vec![GATHER_CREDENTIALS_COMMAND.to_string()];
        for attempt in 1..=self.retries {
            let exec_result = self.client.exec_pod(namespace, pod_name, &command).await;
            if let Ok(output) = &exec_result {
                let stdout = output.stdout.trim();
                if !stdout.is_empty() {
                    info!(pod = %pod_name, "bind credentials found");
                    return decode_credentials(stdout).map(Some);
                }
            }

            let phase = match self.client.get_pod(namespace, pod_name).await {
                Ok(pod) => pod.status.phase,
                Err(e) => {
                    warn!(pod = %pod_name, attempt, error = %e, "unable to fetch pod while gathering credentials");
                    None
                }
            };
            match phase {
                Some(PodPhase::Failed) => {
                    return Err(ExecutorError::CredentialsNotFound(format!(
                        "bundle pod [ {pod_name} ] failed before emitting credentials"
                    )));
                }
                Some(PodPhase::Succeeded) => {
                    // Completed with nothing on stdout: the bundle has no
                    // credentials to hand over.
                    debug!(pod = %pod_name, "pod completed without credentials");
                    return Ok(None);
                }
                _ => {
                    debug!(pod = %pod_name, attempt, "credentials not available yet");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
        Err(ExecutorError::ExecTimeout {
            pod: pod_name.to_string(),
            retries: self.retries,
        })
    }
}

/// Runtime v2+: read the secret the bundle wrote into its own namespace.
pub struct NamespaceSecret {
    client: Arc<dyn OrchestratorClient>,
}

#[async_trait]
impl CredentialExtractor for NamespaceSecret {
    async fn extract(
        &self,
        pod_name: &str,
        namespace: &str,
    ) -> Result<Option<ExtractedCredentials>, ExecutorError> {
        let secret = match self.client.get_secret(namespace, pod_name).await {
            Ok(secret) => secret,
            Err(ClusterError::NotFound(_)) => {
                return Err(ExecutorError::CredentialsNotFound(format!(
                    "secret [ {pod_name} ] not found in namespace [ {namespace} ]"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let raw = secret
            .decode(FIELDS_SECRET_KEY)
            .map_err(|_| {
                ExecutorError::CredentialsNotFound(format!(
                    "secret [ {pod_name} ] has no [ {FIELDS_SECRET_KEY} ] key"
                ))
            })?;
        let credentials: Map<String, Value> = serde_json::from_slice(&raw)?;
        Ok(Some(ExtractedCredentials { credentials }))
    }
}

/// Decodes a base64(JSON object) credential payload.
pub fn decode_credentials(output: &str) -> Result<ExtractedCredentials, ExecutorError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(output.trim())
        .map_err(|e| ExecutorError::Serialization(format!("invalid base64 credentials: {e}")))?;
    let credentials: Map<String, Value> = serde_json::from_slice(&decoded)?;
    Ok(ExtractedCredentials { credentials })
}

/// Persists extracted credentials as the broker-namespace secret `<id>`.
pub async fn set_extracted_credentials(
    client: &dyn OrchestratorClient,
    broker_namespace: &str,
    id: &str,
    credentials: &ExtractedCredentials,
    action: JobMethod,
    fq_name: &str,
) -> Result<(), ExecutorError> {
    let payload = serde_json::to_string(&credentials.credentials)?;
    let mut secret = Secret {
        metadata: ObjectMeta::named(id),
        ..Secret::default()
    };
    secret
        .metadata
        .labels
        .insert(ACTION_LABEL_KEY.to_string(), action.to_string());
    secret
        .metadata
        .labels
        .insert(NAME_LABEL_KEY.to_string(), fq_name.to_string());
    secret
        .string_data
        .insert(CREDENTIALS_SECRET_KEY.to_string(), payload);

    match client.create_secret(broker_namespace, &secret).await {
        Ok(()) => Ok(()),
        Err(ClusterError::Conflict(_)) => {
            client.update_secret(broker_namespace, &secret).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads previously persisted credentials, `None` when absent.
pub async fn get_extracted_credentials(
    client: &dyn OrchestratorClient,
    broker_namespace: &str,
    id: &str,
) -> Result<Option<ExtractedCredentials>, ExecutorError> {
    let secret = match client.get_secret(broker_namespace, id).await {
        Ok(secret) => secret,
        Err(ClusterError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let raw = if secret.data.contains_key(CREDENTIALS_SECRET_KEY) {
        secret.decode(CREDENTIALS_SECRET_KEY)?
    } else if let Some(plain) = secret.string_data.get(CREDENTIALS_SECRET_KEY) {
        plain.clone().into_bytes()
    } else {
        return Ok(None);
    };
    let credentials: Map<String, Value> = serde_json::from_slice(&raw)?;
    Ok(Some(ExtractedCredentials { credentials }))
}

/// Deletes persisted credentials; absence is not an error.
pub async fn delete_extracted_credentials(
    client: &dyn OrchestratorClient,
    broker_namespace: &str,
    id: &str,
) -> Result<(), ExecutorError> {
    match client.delete_secret(broker_namespace, id).await {
        Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
