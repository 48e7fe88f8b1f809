//! Shared fixtures for the integration tests: a scripted in-memory cluster
//! and spec/instance factories.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use uuid::Uuid;

use bundle_broker::bundle::types::{Context, ServiceInstance, Spec};
use bundle_broker::cluster::types::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Namespace,
    ObjectMeta, PodStatus,
};
use bundle_broker::cluster::{
    ClusterError, ClusterResult, ConfigMap, ExecOutput, NetworkPolicy, OrchestratorClient, Pod,
    PodEvent, PodPhase, RoleBinding, Secret, WatchEventKind,
};

/// One scripted step of a pod watch stream. The fake stamps the created
/// pod's name onto each event, since tests cannot know the generated name
/// up front.
#[derive(Debug, Clone)]
pub enum WatchStep {
    Phase(PodPhase),
    Annotated(&'static str, &'static str),
    FailedWaiting(&'static str),
    FailedTerminated(i32, &'static str),
    Deleted,
}

/// In-memory [`OrchestratorClient`] that records every operation and replays
/// scripted watch events and exec outputs.
#[derive(Default)]
pub struct FakeCluster {
    ops: Mutex<Vec<String>>,
    namespaces: Mutex<HashMap<String, Namespace>>,
    secrets: Mutex<HashMap<(String, String), Secret>>,
    config_maps: Mutex<HashMap<(String, String), ConfigMap>>,
    pods: Mutex<HashMap<String, Pod>>,
    last_pod: Mutex<Option<String>>,
    watch_script: Mutex<Vec<WatchStep>>,
    exec_script: Mutex<Vec<ExecOutput>>,
    /// Base64 payload served as the `fields` key of the pod-named secret,
    /// the runtime v2 credentials protocol.
    pod_secret_fields: Mutex<Option<String>>,
    /// Phase reported for any pod lookup after the run.
    final_phase: Mutex<Option<PodPhase>>,
    generated: AtomicU32,
}

impl FakeCluster {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.add_namespace("u1");
        fake.add_namespace("broker");
        fake
    }

    pub fn add_namespace(&self, name: &str) {
        self.namespaces.lock().unwrap().insert(
            name.to_string(),
            Namespace {
                metadata: ObjectMeta::named(name),
            },
        );
    }

    pub fn script_watch(&self, steps: Vec<WatchStep>) {
        *self.watch_script.lock().unwrap() = steps;
    }

    pub fn script_exec(&self, outputs: Vec<ExecOutput>) {
        *self.exec_script.lock().unwrap() = outputs;
    }

    pub fn set_pod_credentials_json(&self, json: &str) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        *self.pod_secret_fields.lock().unwrap() = Some(encoded);
    }

    pub fn set_final_phase(&self, phase: PodPhase) {
        *self.final_phase.lock().unwrap() = Some(phase);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn op_count(&self, prefix: &str) -> usize {
        self.ops().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// The most recently created pod.
    pub fn created_pod(&self) -> Option<Pod> {
        let name = self.pod_name()?;
        self.pods.lock().unwrap().get(&name).cloned()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn pod_name(&self) -> Option<String> {
        self.last_pod.lock().unwrap().clone()
    }

    fn event_for(
        &self,
        step: &WatchStep,
        pod_name: &str,
        annotations: &mut BTreeMap<String, String>,
    ) -> PodEvent {
        let mut pod = Pod::default();
        pod.metadata.name = pod_name.to_string();
        let (kind, phase) = match step {
            WatchStep::Phase(phase) => (WatchEventKind::Modified, Some(*phase)),
            WatchStep::Annotated(key, value) => {
                annotations.insert((*key).to_string(), (*value).to_string());
                (WatchEventKind::Modified, Some(PodPhase::Running))
            }
            WatchStep::FailedWaiting(reason) => {
                pod.status.container_statuses.push(ContainerStatus {
                    name: "apb".into(),
                    state: ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: (*reason).to_string(),
                            message: String::new(),
                        }),
                        terminated: None,
                    },
                });
                (WatchEventKind::Modified, Some(PodPhase::Failed))
            }
            WatchStep::FailedTerminated(code, message) => {
                pod.status.container_statuses.push(ContainerStatus {
                    name: "apb".into(),
                    state: ContainerState {
                        waiting: None,
                        terminated: Some(ContainerStateTerminated {
                            exit_code: *code,
                            message: (*message).to_string(),
                        }),
                    },
                });
                (WatchEventKind::Modified, Some(PodPhase::Failed))
            }
            WatchStep::Deleted => (WatchEventKind::Deleted, Some(PodPhase::Running)),
        };
        // Annotations persist on the pod object across events, as on a real
        // watch stream.
        pod.metadata.annotations = annotations.clone();
        pod.status.phase = phase;
        PodEvent { kind, pod }
    }
}

#[async_trait]
impl OrchestratorClient for FakeCluster {
    async fn create_namespace(
        &self,
        _labels: &BTreeMap<String, String>,
        generate_name_prefix: &str,
    ) -> ClusterResult<String> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst);
        let name = format!("{generate_name_prefix}{n:05}");
        self.record(format!("create_namespace:{name}"));
        self.add_namespace(&name);
        Ok(name)
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Namespace> {
        self.namespaces
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("namespace {name}")))
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        self.record(format!("delete_namespace:{name}"));
        self.namespaces.lock().unwrap().remove(name);
        Ok(())
    }

    async fn annotate_namespace(&self, name: &str, key: &str, value: &str) -> ClusterResult<()> {
        self.record(format!("annotate_namespace:{name}:{key}={value}"));
        Ok(())
    }

    async fn create_service_account(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.record(format!("create_service_account:{namespace}/{name}"));
        Ok(())
    }

    async fn create_role_binding(
        &self,
        binding: &RoleBinding,
        namespace: &str,
    ) -> ClusterResult<()> {
        self.record(format!(
            "create_role_binding:{namespace}/{}",
            binding.metadata.name
        ));
        Ok(())
    }

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.record(format!("delete_role_binding:{namespace}/{name}"));
        Ok(())
    }

    async fn create_network_policy(
        &self,
        policy: &NetworkPolicy,
        namespace: &str,
    ) -> ClusterResult<()> {
        self.record(format!(
            "create_network_policy:{namespace}/{}",
            policy.metadata.name
        ));
        Ok(())
    }

    async fn delete_network_policy(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.record(format!("delete_network_policy:{namespace}/{name}"));
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()> {
        self.record(format!("create_pod:{namespace}/{}", pod.metadata.name));
        self.pods
            .lock()
            .unwrap()
            .insert(pod.metadata.name.clone(), pod.clone());
        *self.last_pod.lock().unwrap() = Some(pod.metadata.name.clone());
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> ClusterResult<Pod> {
        let mut pod = self
            .pods
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("pod {name}")))?;
        pod.status = PodStatus {
            phase: *self.final_phase.lock().unwrap(),
            container_statuses: Vec::new(),
        };
        Ok(pod)
    }

    async fn watch_pods(&self, namespace: &str) -> ClusterResult<mpsc::Receiver<PodEvent>> {
        self.record(format!("watch_pods:{namespace}"));
        let pod_name = self
            .pod_name()
            .ok_or_else(|| ClusterError::NotFound("no pod to watch".into()))?;
        let steps = self.watch_script.lock().unwrap().clone();
        let mut annotations = BTreeMap::new();
        let events: Vec<PodEvent> = steps
            .iter()
            .map(|s| self.event_for(s, &pod_name, &mut annotations))
            .collect();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.ok();
        }
        Ok(rx)
    }

    async fn exec_pod(
        &self,
        _namespace: &str,
        name: &str,
        _command: &[String],
    ) -> ClusterResult<ExecOutput> {
        self.record(format!("exec_pod:{name}"));
        let mut script = self.exec_script.lock().unwrap();
        if script.is_empty() {
            Ok(ExecOutput::default())
        } else {
            Ok(script.remove(0))
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Secret> {
        if let Some(secret) = self.secret(namespace, name) {
            return Ok(secret);
        }
        // Runtime v2 credentials: a secret named after the pod, in the
        // pod's own namespace.
        if Some(name.to_string()) == self.pod_name() {
            if let Some(fields) = self.pod_secret_fields.lock().unwrap().clone() {
                let mut secret = Secret {
                    metadata: ObjectMeta::named(name),
                    ..Secret::default()
                };
                secret.data.insert("fields".into(), fields);
                return Ok(secret);
            }
        }
        Err(ClusterError::NotFound(format!("secret {namespace}/{name}")))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        self.record(format!("create_secret:{namespace}/{}", secret.metadata.name));
        let key = (namespace.to_string(), secret.metadata.name.clone());
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "secret {} exists",
                secret.metadata.name
            )));
        }
        secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        self.record(format!("update_secret:{namespace}/{}", secret.metadata.name));
        self.secrets.lock().unwrap().insert(
            (namespace.to_string(), secret.metadata.name.clone()),
            secret.clone(),
        );
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.record(format!("delete_secret:{namespace}/{name}"));
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {namespace}/{name}")))
    }

    async fn create_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()> {
        self.record(format!("create_config_map:{namespace}/{}", map.metadata.name));
        self.config_maps.lock().unwrap().insert(
            (namespace.to_string(), map.metadata.name.clone()),
            map.clone(),
        );
        Ok(())
    }

    async fn update_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()> {
        self.record(format!("update_config_map:{namespace}/{}", map.metadata.name));
        self.config_maps.lock().unwrap().insert(
            (namespace.to_string(), map.metadata.name.clone()),
            map.clone(),
        );
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.record(format!("delete_config_map:{namespace}/{name}"));
        self.config_maps
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// A bindable runtime v2 spec with an image.
pub fn bindable_spec() -> Spec {
    Spec {
        id: "spec-1".into(),
        runtime: 2,
        version: "1.0".into(),
        fq_name: "mysql-apb".into(),
        image: "registry.example.com/mysql-apb:latest".into(),
        bindable: true,
        ..Spec::default()
    }
}

pub fn instance_for(spec: Spec) -> ServiceInstance {
    ServiceInstance::new(
        Uuid::new_v4(),
        spec,
        Context {
            platform: "kubernetes".into(),
            namespace: "u1".into(),
        },
        None,
    )
}
