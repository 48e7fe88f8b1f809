//! Core domain types for bundle specs, service instances, bindings, and
//! job state shared between the executor and the work engine.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the single container every bundle pod runs.
pub const BUNDLE_CONTAINER_NAME: &str = "apb";

/// Parameter key carrying the target namespace into the bundle.
pub const NAMESPACE_KEY: &str = "namespace";

/// Parameter key carrying the cluster runtime kind into the bundle.
pub const CLUSTER_KEY: &str = "cluster";

/// Parameter key under which provision-time credentials are handed to bind.
pub const PROVISION_CREDS_KEY: &str = "_apb_provision_creds";

/// Pod annotation the bundle updates with free-form progress text.
pub const LAST_OPERATION_ANNOTATION: &str = "apb_last_operation";

/// Pod annotation the bundle may set with a dashboard URL on success.
pub const DASHBOARD_URL_ANNOTATION: &str = "apb_dashboard_url";

/// Pod label carrying the bundle's fully-qualified spec name.
pub const FQNAME_LABEL: &str = "bundle-fqname";

/// Pod label carrying the action being executed.
pub const ACTION_LABEL: &str = "bundle-action";

/// Pod label carrying the bundle pod name, also used by the sandbox
/// network policy ingress selector.
pub const POD_NAME_LABEL: &str = "bundle-pod-name";

/// Exit code bundles use to report an unimplemented action.
pub const ACTION_NOT_FOUND_EXIT_CODE: i32 = 8;

/// Directory under which associated secrets are mounted inside the pod.
pub const SECRET_MOUNT_ROOT: &str = "/etc/apb-secrets";

/// A free-form string-to-JSON-value parameter map.
///
/// Kept untyped at the API boundary; components go through the accessors
/// instead of reaching into the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(pub Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the parameter as a string slice if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fills in descriptor defaults for parameters the caller omitted.
    pub fn apply_defaults(&mut self, descriptors: &[ParameterDescriptor]) {
        for pd in descriptors {
            if let Some(default) = &pd.default {
                self.0
                    .entry(pd.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// The parameters minus broker-injected keys. Two bindings are compared
    /// on this view only.
    pub fn user_parameters(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| {
                k.as_str() != CLUSTER_KEY
                    && k.as_str() != NAMESPACE_KEY
                    && k.as_str() != PROVISION_CREDS_KEY
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A parameter the service catalog exposes for a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    #[serde(rename = "minLength", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub updatable: bool,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            title: None,
            description: None,
            default: None,
            max_length: None,
            min_length: None,
            pattern: None,
            maximum: None,
            minimum: None,
            enum_values: Vec::new(),
            required: false,
            updatable: false,
        }
    }
}

/// A named parameter variant of a [`Spec`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bind_parameters: Vec<ParameterDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates_to: Vec<String>,
}

impl Plan {
    /// Looks up a parameter descriptor by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.parameters.iter().find(|pd| pd.name == name)
    }
}

/// Async policy a spec declares for its actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncPolicy {
    Required,
    #[default]
    Optional,
    Unsupported,
}

/// Immutable catalog entry describing one bundle image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    /// Runtime major version; selects the credential extraction protocol.
    pub runtime: i32,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "name")]
    pub fq_name: String,
    pub image: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub r#async: AsyncPolicy,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Spec {
    /// Looks up a plan by name.
    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.name == name)
    }
}

/// The platform and namespace a request targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub platform: String,
    pub namespace: String,
}

/// A provisioned occurrence of a spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    pub spec: Spec,
    pub context: Context,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    #[serde(default)]
    pub binding_ids: HashSet<Uuid>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

impl ServiceInstance {
    pub fn new(id: Uuid, spec: Spec, context: Context, parameters: Option<Parameters>) -> Self {
        Self {
            id,
            spec,
            context,
            parameters,
            binding_ids: HashSet::new(),
            dashboard_url: None,
        }
    }

    pub fn add_binding(&mut self, binding_id: Uuid) {
        self.binding_ids.insert(binding_id);
    }

    pub fn remove_binding(&mut self, binding_id: &Uuid) {
        self.binding_ids.remove(binding_id);
    }
}

/// The record of one binding created against a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindInstance {
    pub id: Uuid,
    pub service_id: Uuid,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    /// Token of the job that created this binding.
    #[serde(default)]
    pub create_job_key: Option<String>,
}

impl PartialEq for BindInstance {
    /// Bindings are equal when their ids, owning instance ids, and *user*
    /// parameters match; broker-injected keys are ignored.
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id || self.service_id != other.service_id {
            return false;
        }
        let mine = self.parameters.as_ref().map(Parameters::user_parameters);
        let theirs = other.parameters.as_ref().map(Parameters::user_parameters);
        match (mine, theirs) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            (Some(a), None) | (None, Some(a)) => a.is_empty(),
        }
    }
}

/// Opaque credential map emitted by a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCredentials {
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

/// Lifecycle action a job runs against a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMethod {
    Provision,
    Deprovision,
    Bind,
    Unbind,
    Update,
}

impl JobMethod {
    pub const ALL: [JobMethod; 5] = [
        JobMethod::Provision,
        JobMethod::Deprovision,
        JobMethod::Bind,
        JobMethod::Unbind,
        JobMethod::Update,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobMethod::Provision => "provision",
            JobMethod::Deprovision => "deprovision",
            JobMethod::Bind => "bind",
            JobMethod::Unbind => "unbind",
            JobMethod::Update => "update",
        }
    }

    /// True for the methods that operate on a binding rather than the
    /// service instance itself.
    pub fn is_binding(&self) -> bool {
        matches!(self, JobMethod::Bind | JobMethod::Unbind)
    }
}

impl std::fmt::Display for JobMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a job through its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[default]
    #[serde(rename = "not-yet-started")]
    NotYetStarted,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

/// Durable record of one job's progress, persisted by the subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub token: String,
    pub state: State,
    pub method: Option<JobMethod>,
    #[serde(default)]
    pub podname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
}

/// Proxy settings propagated from the broker process into bundle pods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";
pub const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
pub const NO_PROXY_ENV: &str = "NO_PROXY";

impl ProxyConfig {
    /// Reads proxy settings from the broker's environment. A lone `NO_PROXY`
    /// with no proxy endpoints counts as unconfigured.
    pub fn from_env() -> Option<Self> {
        let http_proxy = std::env::var(HTTP_PROXY_ENV).ok();
        let https_proxy = std::env::var(HTTPS_PROXY_ENV).ok();
        let no_proxy = std::env::var(NO_PROXY_ENV).ok();

        if http_proxy.is_none() && https_proxy.is_none() {
            if no_proxy.is_some() {
                tracing::info!(
                    "NO_PROXY set but no proxy found via HTTP_PROXY or HTTPS_PROXY"
                );
            }
            return None;
        }

        Some(Self {
            http_proxy: http_proxy.unwrap_or_default(),
            https_proxy: https_proxy.unwrap_or_default(),
            no_proxy: no_proxy.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        let mut p = Parameters::new();
        for (k, v) in pairs {
            p.insert(*k, v.clone());
        }
        p
    }

    #[test]
    fn bind_instances_equal_ignoring_injected_keys() {
        let id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        let a = BindInstance {
            id,
            service_id,
            parameters: Some(params(&[
                ("size", json!("large")),
                (NAMESPACE_KEY, json!("ns-a")),
                (CLUSTER_KEY, json!("kubernetes")),
                (PROVISION_CREDS_KEY, json!({"user": "u"})),
            ])),
            create_job_key: Some("token-a".into()),
        };
        let b = BindInstance {
            id,
            service_id,
            parameters: Some(params(&[("size", json!("large"))])),
            create_job_key: None,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn bind_instances_differ_on_user_parameters() {
        let id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        let a = BindInstance {
            id,
            service_id,
            parameters: Some(params(&[("size", json!("large"))])),
            create_job_key: None,
        };
        let b = BindInstance {
            id,
            service_id,
            parameters: Some(params(&[("size", json!("small"))])),
            create_job_key: None,
        };
        assert_ne!(a, b);
    }

    #[test]
    fn bind_instance_with_only_injected_params_equals_empty() {
        let id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        let a = BindInstance {
            id,
            service_id,
            parameters: Some(params(&[(NAMESPACE_KEY, json!("ns"))])),
            create_job_key: None,
        };
        let b = BindInstance {
            id,
            service_id,
            parameters: None,
            create_job_key: None,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn parameters_apply_defaults_keeps_explicit_values() {
        let mut pd = ParameterDescriptor::new("size", "string");
        pd.default = Some(json!("medium"));
        let pd_other = {
            let mut d = ParameterDescriptor::new("replicas", "number");
            d.default = Some(json!(1));
            d
        };

        let mut p = params(&[("size", json!("large"))]);
        p.apply_defaults(&[pd, pd_other]);

        assert_eq!(p.get_str("size"), Some("large"));
        assert_eq!(p.get("replicas"), Some(&json!(1)));
    }

    #[test]
    fn state_serializes_with_hyphenated_names() {
        assert_eq!(
            serde_json::to_string(&State::NotYetStarted).unwrap(),
            "\"not-yet-started\""
        );
        assert_eq!(
            serde_json::to_string(&State::InProgress).unwrap(),
            "\"in-progress\""
        );
    }

    #[test]
    fn job_method_round_trips_through_serde() {
        for method in JobMethod::ALL {
            let s = serde_json::to_string(&method).unwrap();
            assert_eq!(s, format!("\"{}\"", method));
            let back: JobMethod = serde_json::from_str(&s).unwrap();
            assert_eq!(back, method);
        }
    }
}
