//! Sandbox lifecycle for bundle pods.
//!
//! A sandbox is the transient (namespace, service account, role bindings,
//! network policy) tuple one bundle pod executes inside. Acquire and release
//! are idempotent with respect to partially-created sandboxes: destroy logs
//! failures instead of propagating them.

pub mod network;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bundle::types::POD_NAME_LABEL;
use crate::cluster::types::{
    LabelSelector, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
    ObjectMeta, RoleRef, Subject,
};
use crate::cluster::{ClusterError, OrchestratorClient, PodPhase, RoleBinding};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("target namespace [ {0} ] does not exist")]
    TargetMissing(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// The execution environment handed back by [`SandboxManager::create_sandbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub service_account: String,
    pub namespace: String,
    /// False when the sandbox reused a target namespace instead of creating
    /// its own.
    pub created_namespace: bool,
}

/// Context handed to sandbox hooks.
#[derive(Debug, Clone)]
pub struct SandboxHookContext {
    pub pod_name: String,
    pub namespace: String,
    pub targets: Vec<String>,
}

/// One step in the ordered hook lists around sandbox acquire/release.
///
/// Hooks never fail the sandbox operation: errors are logged and the hook is
/// expected to have cleaned up after itself.
#[async_trait]
pub trait SandboxHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        client: &dyn OrchestratorClient,
        ctx: &SandboxHookContext,
    ) -> anyhow::Result<()>;
}

/// Acquires and releases per-action execution environments.
pub struct SandboxManager {
    client: Arc<dyn OrchestratorClient>,
    broker_namespace: String,
    pre_create: Vec<Arc<dyn SandboxHook>>,
    post_create: Vec<Arc<dyn SandboxHook>>,
    pre_destroy: Vec<Arc<dyn SandboxHook>>,
    post_destroy: Vec<Arc<dyn SandboxHook>>,
}

impl SandboxManager {
    pub fn new(client: Arc<dyn OrchestratorClient>, broker_namespace: impl Into<String>) -> Self {
        Self {
            client,
            broker_namespace: broker_namespace.into(),
            pre_create: Vec::new(),
            post_create: Vec::new(),
            pre_destroy: Vec::new(),
            post_destroy: Vec::new(),
        }
    }

    pub fn with_pre_create_hook(mut self, hook: Arc<dyn SandboxHook>) -> Self {
        self.pre_create.push(hook);
        self
    }

    pub fn with_post_create_hook(mut self, hook: Arc<dyn SandboxHook>) -> Self {
        self.post_create.push(hook);
        self
    }

    pub fn with_pre_destroy_hook(mut self, hook: Arc<dyn SandboxHook>) -> Self {
        self.pre_destroy.push(hook);
        self
    }

    pub fn with_post_destroy_hook(mut self, hook: Arc<dyn SandboxHook>) -> Self {
        self.post_destroy.push(hook);
        self
    }

    /// Builds the execution environment for one bundle pod and returns the
    /// service account it must run under.
    pub async fn create_sandbox(
        &self,
        pod_name: &str,
        ns_prefix: &str,
        targets: &[String],
        role: &str,
        labels: &BTreeMap<String, String>,
        reuse_target_namespace: bool,
    ) -> Result<SandboxHandle, SandboxError> {
        for target in targets {
            self.client.get_namespace(target).await.map_err(|e| match e {
                ClusterError::NotFound(_) => SandboxError::TargetMissing(target.clone()),
                other => SandboxError::Cluster(other),
            })?;
        }

        let (namespace, created_namespace) = if reuse_target_namespace {
            let target = targets
                .first()
                .cloned()
                .ok_or_else(|| SandboxError::TargetMissing("<none>".into()))?;
            (target, false)
        } else {
            let name = self.client.create_namespace(labels, ns_prefix).await?;
            (name, true)
        };

        let ctx = SandboxHookContext {
            pod_name: pod_name.to_string(),
            namespace: namespace.clone(),
            targets: targets.to_vec(),
        };
        self.run_hooks(&self.pre_create, &ctx).await;

        self.client
            .create_service_account(pod_name, &namespace)
            .await?;

        self.client
            .create_role_binding(&role_binding(pod_name, &namespace, role), &namespace)
            .await?;
        for target in distinct(targets) {
            if target == namespace {
                continue;
            }
            self.client
                .create_role_binding(&role_binding(pod_name, &namespace, role), &target)
                .await?;
        }

        if let Some(primary) = targets.first() {
            self.client
                .create_network_policy(&network_policy(pod_name), primary)
                .await?;
        }

        self.run_hooks(&self.post_create, &ctx).await;

        info!(
            pod = %pod_name,
            namespace = %namespace,
            role = %role,
            "created sandbox"
        );
        Ok(SandboxHandle {
            service_account: pod_name.to_string(),
            namespace,
            created_namespace,
        })
    }

    /// Tears down the sandbox. Never fails; every step logs its own errors.
    /// A namespace the sandbox did not create is never deleted.
    ///
    /// # Panics
    ///
    /// Panics when the namespace to delete is the broker's own namespace.
    pub async fn destroy_sandbox(
        &self,
        handle: &SandboxHandle,
        targets: &[String],
        keep_namespace: bool,
        keep_namespace_on_error: bool,
    ) {
        let pod_name = handle.service_account.as_str();
        let namespace = handle.namespace.as_str();
        if pod_name.is_empty() {
            return;
        }

        let ctx = SandboxHookContext {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            targets: targets.to_vec(),
        };
        self.run_hooks(&self.pre_destroy, &ctx).await;

        let phase = match self.client.get_pod(namespace, pod_name).await {
            Ok(pod) => pod.status.phase,
            Err(e) => {
                debug!(pod = %pod_name, error = %e, "unable to fetch pod phase at destroy time");
                None
            }
        };
        if handle.created_namespace
            && should_delete_namespace(keep_namespace, keep_namespace_on_error, phase)
        {
            assert!(
                namespace != self.broker_namespace,
                "refusing to delete the broker's own namespace [ {namespace} ]"
            );
            if let Err(e) = self.client.delete_namespace(namespace).await {
                warn!(namespace = %namespace, error = %e, "failed to delete sandbox namespace");
            }
        } else {
            info!(namespace = %namespace, "keeping sandbox namespace");
        }

        if let Err(e) = self.client.delete_role_binding(pod_name, namespace).await {
            warn!(pod = %pod_name, namespace = %namespace, error = %e, "failed to delete role binding");
        }
        for target in distinct(targets) {
            if target == namespace {
                continue;
            }
            if let Err(e) = self.client.delete_role_binding(pod_name, &target).await {
                warn!(pod = %pod_name, namespace = %target, error = %e, "failed to delete target role binding");
            }
        }

        if let Some(primary) = targets.first() {
            if let Err(e) = self.client.delete_network_policy(pod_name, primary).await {
                warn!(pod = %pod_name, namespace = %primary, error = %e, "failed to delete network policy");
            }
        }

        self.run_hooks(&self.post_destroy, &ctx).await;
        info!(pod = %pod_name, namespace = %namespace, "destroyed sandbox");
    }

    async fn run_hooks(&self, hooks: &[Arc<dyn SandboxHook>], ctx: &SandboxHookContext) {
        for hook in hooks {
            if let Err(e) = hook.run(self.client.as_ref(), ctx).await {
                warn!(hook = hook.name(), error = %e, "sandbox hook failed");
            }
        }
    }
}

/// Whether to delete the execution namespace at destroy time. `phase` is
/// `None` when the pod could not be fetched.
pub fn should_delete_namespace(
    keep_namespace: bool,
    keep_namespace_on_error: bool,
    phase: Option<PodPhase>,
) -> bool {
    if keep_namespace {
        return false;
    }
    if keep_namespace_on_error {
        return matches!(
            phase,
            Some(PodPhase::Pending) | Some(PodPhase::Running) | Some(PodPhase::Succeeded)
        );
    }
    true
}

fn role_binding(pod_name: &str, exec_namespace: &str, role: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta::named(pod_name),
        subjects: vec![Subject {
            kind: "ServiceAccount".into(),
            name: pod_name.to_string(),
            namespace: exec_namespace.to_string(),
        }],
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: role.to_string(),
        },
    }
}

/// Ingress policy in the target namespace admitting traffic from the bundle
/// pod only.
fn network_policy(pod_name: &str) -> NetworkPolicy {
    let mut from_labels = BTreeMap::new();
    from_labels.insert(POD_NAME_LABEL.to_string(), pod_name.to_string());
    NetworkPolicy {
        metadata: ObjectMeta::named(pod_name),
        spec: NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            ingress: vec![NetworkPolicyIngressRule {
                from: vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector {
                        match_labels: from_labels,
                    }),
                }],
            }],
        },
    }
}

fn distinct(targets: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for t in targets {
        if !seen.contains(t) {
            seen.push(t.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_namespace_wins_over_everything() {
        assert!(!should_delete_namespace(true, false, Some(PodPhase::Succeeded)));
        assert!(!should_delete_namespace(true, true, Some(PodPhase::Failed)));
        assert!(!should_delete_namespace(true, false, None));
    }

    #[test]
    fn keep_on_error_keeps_failed_unknown_and_unfetchable() {
        assert!(!should_delete_namespace(false, true, Some(PodPhase::Failed)));
        assert!(!should_delete_namespace(false, true, Some(PodPhase::Unknown)));
        assert!(!should_delete_namespace(false, true, None));
        assert!(should_delete_namespace(false, true, Some(PodPhase::Succeeded)));
    }

    #[test]
    fn default_is_delete() {
        assert!(should_delete_namespace(false, false, Some(PodPhase::Failed)));
        assert!(should_delete_namespace(false, false, None));
    }

    #[test]
    fn network_policy_selects_bundle_pod() {
        let policy = network_policy("bundle-123");
        assert_eq!(policy.metadata.name, "bundle-123");
        let from = &policy.spec.ingress[0].from[0];
        assert_eq!(
            from.pod_selector
                .as_ref()
                .unwrap()
                .match_labels
                .get(POD_NAME_LABEL)
                .map(String::as_str),
            Some("bundle-123")
        );
    }
}
