//! The per-action bundle executor.
//!
//! One [`Executor`] corresponds to one bundle run. It acquires a sandbox,
//! creates the bundle pod, relays progress from the pod watcher onto its
//! status channel, extracts credentials for bindable specs, and tears the
//! sandbox down on every exit path. The channel carries intermediate
//! `in-progress` updates and exactly one terminal message, after which it
//! is closed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::types::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, ObjectMeta, Pod, PodSpec, Secret,
    SecretVolumeSource, Volume, VolumeMount,
};
use crate::cluster::{ClusterError, OrchestratorClient};
use crate::runtime::SandboxManager;

use super::creds;
use super::secrets::SecretPolicy;
use super::types::{
    ExtractedCredentials, JobMethod, Parameters, ProxyConfig, ServiceInstance, State,
    ACTION_LABEL, BUNDLE_CONTAINER_NAME, CLUSTER_KEY, FQNAME_LABEL, HTTPS_PROXY_ENV,
    HTTP_PROXY_ENV, NAMESPACE_KEY, NO_PROXY_ENV, POD_NAME_LABEL, SECRET_MOUNT_ROOT,
};
use super::watch::{self, ProgressSink};
use super::{ExecutorError, StatusMessage};

/// Volume name for the state config map mounted into the bundle pod.
const STATE_VOLUME_NAME: &str = "state";

/// Everything the executor needs from broker configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// The broker's own namespace, where state and credentials live.
    pub broker_namespace: String,
    /// Cluster role bound to the bundle pod's service account.
    pub sandbox_role: String,
    /// Pull policy token, one of always/never/ifnotpresent (any case).
    pub image_pull_policy: String,
    pub keep_namespace: bool,
    pub keep_namespace_on_error: bool,
    /// Where the state config map is mounted inside the pod.
    pub state_mount_path: String,
    pub creds_exec_retries: u32,
    pub creds_exec_interval: Duration,
    /// Runtime kind handed to bundles under the `cluster` parameter.
    pub runtime_kind: String,
    /// Run the pod in the request's target namespace instead of a
    /// freshly-created one.
    pub reuse_target_namespace: bool,
    pub proxy: Option<ProxyConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            broker_namespace: "bundle-broker".into(),
            sandbox_role: "edit".into(),
            image_pull_policy: "ifnotpresent".into(),
            keep_namespace: false,
            keep_namespace_on_error: false,
            state_mount_path: "/etc/apb/state".into(),
            creds_exec_retries: 7200,
            creds_exec_interval: Duration::from_secs(5),
            runtime_kind: "kubernetes".into(),
            reuse_target_namespace: false,
            proxy: None,
        }
    }
}

/// The surface the work engine's jobs drive. Kept as a trait so jobs can be
/// exercised against a scripted runner.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Starts the action and returns the status channel. The final message
    /// is terminal and the channel closes after it.
    async fn execute(
        &self,
        method: JobMethod,
        instance: &ServiceInstance,
        parameters: Parameters,
        binding_id: Option<Uuid>,
    ) -> mpsc::Receiver<StatusMessage>;

    fn pod_name(&self) -> String;

    fn last_status(&self) -> StatusMessage;

    fn dashboard_url(&self) -> Option<String>;

    fn extracted_credentials(&self) -> Option<ExtractedCredentials>;
}

#[derive(Default)]
struct Shared {
    last_status: StatusMessage,
    dashboard_url: Option<String>,
    pod_name: String,
    extracted_credentials: Option<ExtractedCredentials>,
}

struct Inner {
    client: Arc<dyn OrchestratorClient>,
    sandbox: Arc<SandboxManager>,
    secrets: Arc<SecretPolicy>,
    config: ExecutorConfig,
    shared: Mutex<Shared>,
    sender: Mutex<Option<mpsc::Sender<StatusMessage>>>,
}

/// Executes one bundle action to completion. Cheap to clone; all clones
/// share the same run state and status channel.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Executor {
    pub fn new(
        client: Arc<dyn OrchestratorClient>,
        sandbox: Arc<SandboxManager>,
        secrets: Arc<SecretPolicy>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                sandbox,
                secrets,
                config,
                shared: Mutex::new(Shared::default()),
                sender: Mutex::new(None),
            }),
        }
    }

    pub async fn provision(&self, instance: &ServiceInstance) -> mpsc::Receiver<StatusMessage> {
        let parameters = instance.parameters.clone().unwrap_or_default();
        self.start(JobMethod::Provision, instance.clone(), parameters, None)
    }

    pub async fn deprovision(&self, instance: &ServiceInstance) -> mpsc::Receiver<StatusMessage> {
        let parameters = instance.parameters.clone().unwrap_or_default();
        self.start(JobMethod::Deprovision, instance.clone(), parameters, None)
    }

    pub async fn update(
        &self,
        instance: &ServiceInstance,
        parameters: Parameters,
    ) -> mpsc::Receiver<StatusMessage> {
        self.start(JobMethod::Update, instance.clone(), parameters, None)
    }

    pub async fn bind(
        &self,
        instance: &ServiceInstance,
        parameters: Parameters,
        binding_id: Uuid,
    ) -> mpsc::Receiver<StatusMessage> {
        self.start(JobMethod::Bind, instance.clone(), parameters, Some(binding_id))
    }

    pub async fn unbind(
        &self,
        instance: &ServiceInstance,
        parameters: Parameters,
        binding_id: Uuid,
    ) -> mpsc::Receiver<StatusMessage> {
        self.start(
            JobMethod::Unbind,
            instance.clone(),
            parameters,
            Some(binding_id),
        )
    }

    /// Returns the status channel immediately; the run proceeds on its own
    /// task and the channel closes after the terminal message.
    fn start(
        &self,
        method: JobMethod,
        instance: ServiceInstance,
        parameters: Parameters,
        binding_id: Option<Uuid>,
    ) -> mpsc::Receiver<StatusMessage> {
        let (tx, rx) = mpsc::channel(1);
        *lock(&self.inner.sender) = Some(tx);

        let this = self.clone();
        tokio::spawn(async move {
            this.send(StatusMessage::in_progress("action started")).await;
            let result = this.run(method, &instance, parameters, binding_id).await;
            this.finish(method, result).await;
        });
        rx
    }

    async fn run(
        &self,
        method: JobMethod,
        instance: &ServiceInstance,
        mut parameters: Parameters,
        binding_id: Option<Uuid>,
    ) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let spec = &instance.spec;

        if spec.image.is_empty() {
            return Err(ExecutorError::NoImage(spec.fq_name.clone()));
        }

        let target = instance.context.namespace.clone();
        if inner.config.reuse_target_namespace
            && matches!(method, JobMethod::Provision | JobMethod::Update)
        {
            match inner.client.get_namespace(&target).await {
                Ok(_) => {}
                Err(ClusterError::NotFound(_)) => {
                    return Err(ExecutorError::NamespaceMissing(target));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pod_name = format!("bundle-{}", Uuid::new_v4());
        lock(&inner.shared).pod_name = pod_name.clone();

        let targets = vec![target];
        let labels = pod_labels(spec, method, &pod_name);
        let handle = inner
            .sandbox
            .create_sandbox(
                &pod_name,
                &namespace_prefix(&spec.fq_name, method),
                &targets,
                &inner.config.sandbox_role,
                &labels,
                inner.config.reuse_target_namespace,
            )
            .await
            .map_err(|e| ExecutorError::SandboxCreateFailed(e.to_string()))?;

        // The sandbox exists from here on; tear it down on every exit path.
        parameters.insert(NAMESPACE_KEY, json!(targets[0].clone()));
        parameters.insert(CLUSTER_KEY, json!(inner.config.runtime_kind.clone()));
        let owner_id = owner_id(method, instance, binding_id);
        let result = self
            .run_in_sandbox(
                method,
                instance,
                &parameters,
                owner_id,
                &pod_name,
                &handle.namespace,
                &handle.service_account,
                &labels,
            )
            .await;

        inner
            .sandbox
            .destroy_sandbox(
                &handle,
                &targets,
                inner.config.keep_namespace,
                inner.config.keep_namespace_on_error,
            )
            .await;

        if result.is_ok() {
            self.post_success_cleanup(method, instance, binding_id).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_in_sandbox(
        &self,
        method: JobMethod,
        instance: &ServiceInstance,
        parameters: &Parameters,
        owner_id: Uuid,
        pod_name: &str,
        exec_namespace: &str,
        service_account: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let spec = &instance.spec;
        let extra_vars = serde_json::to_string(parameters)?;

        let secret_names = inner.secrets.secrets_for(spec).await;
        for name in &secret_names {
            self.copy_secret(name, exec_namespace).await?;
        }

        let mount_state = self
            .copy_prior_state(owner_id, pod_name, exec_namespace)
            .await?;

        let pod = build_pod(&PodParams {
            pod_name,
            image: &spec.image,
            method,
            extra_vars: &extra_vars,
            pull_policy: pull_policy(&inner.config.image_pull_policy)?,
            service_account,
            labels,
            secret_names: &secret_names,
            mount_state,
            state_mount_path: &inner.config.state_mount_path,
            proxy: inner.config.proxy.as_ref(),
        });
        inner.client.create_pod(exec_namespace, &pod).await?;
        info!(pod = %pod_name, namespace = %exec_namespace, method = %method, "bundle pod created");

        // Bindable runtime v1 skips the watcher: credential extraction
        // itself blocks on pod completion.
        if spec.runtime >= 2 || !spec.bindable {
            watch::watch_pod(inner.client.as_ref(), pod_name, exec_namespace, self).await?;
            self.copy_state_back(owner_id, pod_name, exec_namespace)
                .await?;
        }

        if spec.bindable
            && matches!(
                method,
                JobMethod::Provision | JobMethod::Update | JobMethod::Bind
            )
        {
            let extractor = creds::for_runtime(
                spec.runtime,
                Arc::clone(&inner.client),
                inner.config.creds_exec_retries,
                inner.config.creds_exec_interval,
            )?;
            if let Some(extracted) = extractor.extract(pod_name, exec_namespace).await? {
                creds::set_extracted_credentials(
                    inner.client.as_ref(),
                    &inner.config.broker_namespace,
                    &owner_id.to_string(),
                    &extracted,
                    method,
                    &spec.fq_name,
                )
                .await?;
                lock(&inner.shared).extracted_credentials = Some(extracted);
            }
        }
        Ok(())
    }

    /// Copies an associated secret from the broker namespace into the
    /// execution namespace, resetting server-owned metadata.
    async fn copy_secret(&self, name: &str, exec_namespace: &str) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let mut secret: Secret = inner
            .client
            .get_secret(&inner.config.broker_namespace, name)
            .await?;
        reset_metadata(&mut secret.metadata);
        match inner.client.create_secret(exec_namespace, &secret).await {
            Ok(()) => Ok(()),
            Err(ClusterError::Conflict(_)) => {
                inner.client.update_secret(exec_namespace, &secret).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copies `<owner>-state` from the broker namespace into the execution
    /// namespace as `<pod-name>`. Returns whether there was state to mount.
    async fn copy_prior_state(
        &self,
        owner_id: Uuid,
        pod_name: &str,
        exec_namespace: &str,
    ) -> Result<bool, ExecutorError> {
        let inner = &self.inner;
        let mut state = match inner
            .client
            .get_config_map(&inner.config.broker_namespace, &state_name(owner_id))
            .await
        {
            Ok(cm) => cm,
            Err(ClusterError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        reset_metadata(&mut state.metadata);
        state.metadata.name = pod_name.to_string();
        inner.client.create_config_map(exec_namespace, &state).await?;
        debug!(pod = %pod_name, "mounted prior state into execution namespace");
        Ok(true)
    }

    /// After a successful run, preserves the bundle's state config map back
    /// into the broker namespace. Absence of the map is not an error.
    async fn copy_state_back(
        &self,
        owner_id: Uuid,
        pod_name: &str,
        exec_namespace: &str,
    ) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let mut state = match inner.client.get_config_map(exec_namespace, pod_name).await {
            Ok(cm) => cm,
            Err(ClusterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        reset_metadata(&mut state.metadata);
        state.metadata.name = state_name(owner_id);
        match inner
            .client
            .create_config_map(&inner.config.broker_namespace, &state)
            .await
        {
            Ok(()) => Ok(()),
            Err(ClusterError::Conflict(_)) => {
                inner
                    .client
                    .update_config_map(&inner.config.broker_namespace, &state)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes durable artifacts that must not outlive a successful
    /// deprovision or unbind. Failures are logged, not propagated; the
    /// action itself already succeeded.
    async fn post_success_cleanup(
        &self,
        method: JobMethod,
        instance: &ServiceInstance,
        binding_id: Option<Uuid>,
    ) {
        let inner = &self.inner;
        let ns = &inner.config.broker_namespace;
        match method {
            JobMethod::Deprovision => {
                let id = instance.id;
                match inner.client.delete_config_map(ns, &state_name(id)).await {
                    Ok(()) | Err(ClusterError::NotFound(_)) => {}
                    Err(e) => warn!(instance = %id, error = %e, "failed to delete master state"),
                }
                if let Err(e) =
                    creds::delete_extracted_credentials(inner.client.as_ref(), ns, &id.to_string())
                        .await
                {
                    warn!(instance = %id, error = %e, "failed to delete extracted credentials");
                }
            }
            JobMethod::Unbind => {
                if let Some(binding) = binding_id {
                    if let Err(e) = creds::delete_extracted_credentials(
                        inner.client.as_ref(),
                        ns,
                        &binding.to_string(),
                    )
                    .await
                    {
                        warn!(binding = %binding, error = %e, "failed to delete binding credentials");
                    }
                }
            }
            _ => {}
        }
    }

    async fn finish(&self, method: JobMethod, result: Result<(), ExecutorError>) {
        let message = match result {
            Ok(()) => StatusMessage {
                state: State::Succeeded,
                description: format!("{method} action completed"),
                error: None,
            },
            Err(e) => {
                warn!(method = %method, error = %e, "bundle action failed");
                StatusMessage {
                    state: State::Failed,
                    description: "action finished with error".into(),
                    error: Some(e),
                }
            }
        };
        self.send(message).await;
        self.close_channel();
    }

    async fn send(&self, message: StatusMessage) {
        lock(&self.inner.shared).last_status = message.clone();
        let tx = lock(&self.inner.sender).clone();
        if let Some(tx) = tx {
            if tx.send(message).await.is_err() {
                debug!("status receiver dropped; discarding update");
            }
        }
    }

    /// Drops the sender so the receiver observes closure. Idempotent; the
    /// mutex makes the take atomic so a second call finds nothing.
    fn close_channel(&self) {
        drop(lock(&self.inner.sender).take());
    }
}

#[async_trait]
impl ProgressSink for Executor {
    /// Relays watcher progress. An intermediate message goes out only when
    /// the description actually changed.
    async fn update(&self, description: &str, dashboard_url: &str) {
        let message = {
            let mut shared = lock(&self.inner.shared);
            if !dashboard_url.is_empty() {
                shared.dashboard_url = Some(dashboard_url.to_string());
            }
            if description.is_empty() || shared.last_status.description == description {
                None
            } else {
                Some(StatusMessage::in_progress(description))
            }
        };
        if let Some(message) = message {
            self.send(message).await;
        }
    }
}

#[async_trait]
impl JobRunner for Executor {
    async fn execute(
        &self,
        method: JobMethod,
        instance: &ServiceInstance,
        parameters: Parameters,
        binding_id: Option<Uuid>,
    ) -> mpsc::Receiver<StatusMessage> {
        self.start(method, instance.clone(), parameters, binding_id)
    }

    fn pod_name(&self) -> String {
        lock(&self.inner.shared).pod_name.clone()
    }

    fn last_status(&self) -> StatusMessage {
        lock(&self.inner.shared).last_status.clone()
    }

    fn dashboard_url(&self) -> Option<String> {
        lock(&self.inner.shared).dashboard_url.clone()
    }

    fn extracted_credentials(&self) -> Option<ExtractedCredentials> {
        lock(&self.inner.shared).extracted_credentials.clone()
    }
}

/// The id that keys durable state and credentials for this action: the
/// binding id for binding methods, the instance id otherwise.
fn owner_id(method: JobMethod, instance: &ServiceInstance, binding_id: Option<Uuid>) -> Uuid {
    match binding_id {
        Some(id) if method.is_binding() => id,
        _ => instance.id,
    }
}

fn state_name(owner_id: Uuid) -> String {
    format!("{owner_id}-state")
}

/// `<fqname>-<first four letters of the action>-`, the generate-name prefix
/// for transient execution namespaces.
fn namespace_prefix(fq_name: &str, method: JobMethod) -> String {
    format!("{}-{}-", fq_name, &method.as_str()[..4])
}

fn pod_labels(
    spec: &super::types::Spec,
    method: JobMethod,
    pod_name: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(FQNAME_LABEL.to_string(), spec.fq_name.clone());
    labels.insert(ACTION_LABEL.to_string(), method.to_string());
    labels.insert(POD_NAME_LABEL.to_string(), pod_name.to_string());
    labels
}

/// Translates a configured pull-policy token into the orchestrator's form.
fn pull_policy(token: &str) -> Result<&'static str, ExecutorError> {
    match token.to_lowercase().as_str() {
        "always" => Ok("Always"),
        "never" => Ok("Never"),
        "ifnotpresent" => Ok("IfNotPresent"),
        _ => Err(ExecutorError::PullPolicy(token.to_string())),
    }
}

fn reset_metadata(meta: &mut ObjectMeta) {
    meta.namespace = String::new();
    meta.resource_version = None;
    meta.generate_name = String::new();
}

struct PodParams<'a> {
    pod_name: &'a str,
    image: &'a str,
    method: JobMethod,
    extra_vars: &'a str,
    pull_policy: &'static str,
    service_account: &'a str,
    labels: &'a BTreeMap<String, String>,
    secret_names: &'a [String],
    mount_state: bool,
    state_mount_path: &'a str,
    proxy: Option<&'a ProxyConfig>,
}

fn build_pod(params: &PodParams<'_>) -> Pod {
    let mut env = vec![
        EnvVar::from_field("POD_NAME", "metadata.name"),
        EnvVar::from_field("POD_NAMESPACE", "metadata.namespace"),
    ];
    if let Some(proxy) = params.proxy {
        for (name, value) in [
            (HTTP_PROXY_ENV, &proxy.http_proxy),
            (HTTPS_PROXY_ENV, &proxy.https_proxy),
            (NO_PROXY_ENV, &proxy.no_proxy),
        ] {
            if !value.is_empty() {
                env.push(EnvVar::literal(name, value.clone()));
                env.push(EnvVar::literal(name.to_lowercase(), value.clone()));
            }
        }
    }

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for secret in params.secret_names {
        let volume_name = format!("apb-{secret}");
        volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: secret.clone(),
                optional: Some(false),
            }),
            config_map: None,
        });
        mounts.push(VolumeMount {
            name: volume_name.clone(),
            mount_path: format!("{SECRET_MOUNT_ROOT}/{volume_name}"),
            read_only: true,
        });
    }
    if params.mount_state {
        volumes.push(Volume {
            name: STATE_VOLUME_NAME.into(),
            secret: None,
            config_map: Some(ConfigMapVolumeSource {
                name: params.pod_name.to_string(),
            }),
        });
        mounts.push(VolumeMount {
            name: STATE_VOLUME_NAME.into(),
            mount_path: params.state_mount_path.to_string(),
            read_only: false,
        });
    }

    let mut metadata = ObjectMeta::named(params.pod_name);
    metadata.labels = params.labels.clone();
    Pod {
        metadata,
        spec: PodSpec {
            containers: vec![Container {
                name: BUNDLE_CONTAINER_NAME.into(),
                image: params.image.to_string(),
                args: vec![
                    params.method.to_string(),
                    "--extra-vars".into(),
                    params.extra_vars.to_string(),
                ],
                env,
                image_pull_policy: params.pull_policy.into(),
                volume_mounts: mounts,
            }],
            restart_policy: "Never".into(),
            service_account_name: params.service_account.to_string(),
            volumes,
        },
        status: Default::default(),
    }
}
