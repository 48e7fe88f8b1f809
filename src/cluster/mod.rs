//! Thin client abstraction over the container orchestrator API.
//!
//! Every broker component that touches the cluster goes through
//! [`OrchestratorClient`], which keeps the rest of the engine testable
//! against a scripted implementation. Operations return a typed
//! [`ClusterError`]; transient failures are the caller's to retry.

pub mod http;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use http::{ClusterAuth, KubeClient};
pub use types::{
    ConfigMap, Container, EnvVar, ExecOutput, NetworkPolicy, Pod, PodEvent, PodPhase, PodSpec,
    RoleBinding, Secret, ServiceAccount, Volume, VolumeMount, WatchEventKind,
};

/// Typed failure for every orchestrator operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transient cluster error: {0}")]
    Transient(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Primitive operations against the cluster API.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Creates a namespace with a generated name and returns that name.
    async fn create_namespace(
        &self,
        labels: &BTreeMap<String, String>,
        generate_name_prefix: &str,
    ) -> ClusterResult<String>;

    async fn get_namespace(&self, name: &str) -> ClusterResult<types::Namespace>;

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    /// Sets (or clears, with an empty value) one annotation on a namespace.
    async fn annotate_namespace(&self, name: &str, key: &str, value: &str) -> ClusterResult<()>;

    async fn create_service_account(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn create_role_binding(
        &self,
        binding: &RoleBinding,
        namespace: &str,
    ) -> ClusterResult<()>;

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn create_network_policy(
        &self,
        policy: &NetworkPolicy,
        namespace: &str,
    ) -> ClusterResult<()>;

    async fn delete_network_policy(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod>;

    /// Subscribes to the pod event stream of a namespace. The receiver ends
    /// when the server closes the watch.
    async fn watch_pods(&self, namespace: &str) -> ClusterResult<mpsc::Receiver<PodEvent>>;

    /// Runs a command in the pod's container and captures its output.
    async fn exec_pod(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> ClusterResult<ExecOutput>;

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Secret>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()>;

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap>;

    async fn create_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()>;

    async fn update_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()>;
}
