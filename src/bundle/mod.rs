//! Bundle execution: spec types, the per-action executor, pod watcher,
//! credential extraction, and the secret association policy.

pub mod creds;
pub mod executor;
pub mod secrets;
pub mod types;
pub mod watch;

use thiserror::Error;

use crate::cluster::ClusterError;
use types::State;

/// Returned to clients verbatim when the bundle image cannot be pulled.
/// Preserved as the broker's published error text.
pub const IMAGE_PULL_ERROR_MESSAGE: &str =
    "Unable to pull APB image from it's registry. Please contact your cluster admin";

/// Failure of one bundle run. Only [`is_message_safe`](ExecutorError::is_message_safe)
/// kinds surface their text to clients; everything else is reported through a
/// generic description.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    #[error("spec [ {0} ] does not have an image to run")]
    NoImage(String),
    #[error("namespace [ {0} ] not found within request context")]
    NamespaceMissing(String),
    #[error("failed to create sandbox: {0}")]
    SandboxCreateFailed(String),
    #[error("{IMAGE_PULL_ERROR_MESSAGE}")]
    ImagePull,
    #[error("action not implemented by the bundle image")]
    ActionNotFound,
    #[error("{0}")]
    BundleCustomMessage(String),
    #[error("bundle pod failed with exit code {0}")]
    BundleExitCode(i32),
    #[error("bundle pod was unexpectedly deleted during execution")]
    UnexpectedDeletion,
    #[error("credentials not found: {0}")]
    CredentialsNotFound(String),
    #[error("ExecTimeout: failed to gather credentials from [ {pod} ] after {retries} retries")]
    ExecTimeout { pod: String, retries: u32 },
    #[error("unsupported runtime version [ {0} ], supported range is 1..=2")]
    UnsupportedRuntime(i32),
    #[error("image pull policy [ {0} ] not recognized")]
    PullPolicy(String),
    #[error("pod event stream ended before the pod reached a terminal phase")]
    WatchClosed,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ExecutorError {
    fn from(e: serde_json::Error) -> Self {
        ExecutorError::Serialization(e.to_string())
    }
}

impl ExecutorError {
    /// True when the error text is known-safe to show to clients verbatim.
    pub fn is_message_safe(&self) -> bool {
        matches!(
            self,
            ExecutorError::ImagePull | ExecutorError::BundleCustomMessage(_)
        )
    }
}

/// One status update on the executor's outbound channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMessage {
    pub state: State,
    pub description: String,
    pub error: Option<ExecutorError>,
}

impl StatusMessage {
    pub fn in_progress(description: impl Into<String>) -> Self {
        Self {
            state: State::InProgress,
            description: description.into(),
            error: None,
        }
    }
}
