//! Pod watcher: turns the orchestrator's pod event stream into domain status
//! updates and a typed terminal result.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::{OrchestratorClient, PodEvent, PodPhase, WatchEventKind};

use super::types::{
    ACTION_NOT_FOUND_EXIT_CODE, DASHBOARD_URL_ANNOTATION, LAST_OPERATION_ANNOTATION,
};
use super::ExecutorError;

/// Container waiting reasons that mean the image could not be pulled.
const PULL_FAILURE_REASONS: [&str; 2] = ["ErrImagePull", "ImagePullBackOff"];

/// Receiver for intermediate progress reported while a pod runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, description: &str, dashboard_url: &str);
}

/// Watches one pod to completion, feeding progress into `sink`. Returns when
/// the pod reaches a terminal phase, is deleted, or the stream closes.
pub async fn watch_pod(
    client: &dyn OrchestratorClient,
    pod_name: &str,
    namespace: &str,
    sink: &dyn ProgressSink,
) -> Result<(), ExecutorError> {
    debug!(pod = %pod_name, namespace = %namespace, "watching pod for completion");
    let events = client.watch_pods(namespace).await?;
    observe(events, pod_name, sink).await
}

/// The watch loop proper, separated from the subscription for testing.
pub async fn observe(
    mut events: mpsc::Receiver<PodEvent>,
    pod_name: &str,
    sink: &dyn ProgressSink,
) -> Result<(), ExecutorError> {
    while let Some(event) = events.recv().await {
        if event.pod.metadata.name != pod_name {
            continue;
        }

        if let Some(operation) = event.pod.metadata.annotations.get(LAST_OPERATION_ANNOTATION) {
            sink.update(operation, "").await;
        }

        // Terminal phases win over deletion: a pod deleted after finishing
        // is still classified by how it finished.
        match event.pod.status.phase {
            Some(PodPhase::Failed) => return Err(classify_failure(&event)),
            Some(PodPhase::Succeeded) => {
                let dashboard = event
                    .pod
                    .metadata
                    .annotations
                    .get(DASHBOARD_URL_ANNOTATION)
                    .map(String::as_str)
                    .unwrap_or("");
                sink.update("", dashboard).await;
                debug!(pod = %pod_name, "pod completed");
                return Ok(());
            }
            phase => {
                if event.kind == WatchEventKind::Deleted {
                    warn!(pod = %pod_name, "pod deleted while being watched");
                    return Err(ExecutorError::UnexpectedDeletion);
                }
                debug!(pod = %pod_name, ?phase, "pod still running");
            }
        }
    }
    Err(ExecutorError::WatchClosed)
}

fn classify_failure(event: &PodEvent) -> ExecutorError {
    let Some(status) = event.pod.status.container_statuses.first() else {
        return ExecutorError::BundleExitCode(1);
    };

    if let Some(waiting) = &status.state.waiting {
        if PULL_FAILURE_REASONS.contains(&waiting.reason.as_str()) {
            return ExecutorError::ImagePull;
        }
    }

    if let Some(terminated) = &status.state.terminated {
        if !terminated.message.is_empty() {
            return ExecutorError::BundleCustomMessage(terminated.message.clone());
        }
        return match terminated.exit_code {
            ACTION_NOT_FOUND_EXIT_CODE => ExecutorError::ActionNotFound,
            0 => {
                // Failed phase with a zero exit code should not happen;
                // treat it as a generic failure but log the anomaly.
                warn!(pod = %event.pod.metadata.name, "pod phase Failed with exit code 0");
                ExecutorError::BundleExitCode(0)
            }
            code => ExecutorError::BundleExitCode(code),
        };
    }

    ExecutorError::BundleExitCode(1)
}
