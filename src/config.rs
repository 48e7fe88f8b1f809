//! Broker configuration, loaded from a TOML file with serde defaults and
//! validated before the broker wires anything up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::bundle::executor::ExecutorConfig;
use crate::bundle::secrets::SecretRule;
use crate::bundle::types::ProxyConfig;
use crate::cluster::ClusterAuth;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Secret association rules, applied at startup.
    #[serde(default)]
    pub secrets: Vec<SecretRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// The broker's own namespace, home of state and credential records.
    #[serde(default = "defaults::namespace")]
    pub namespace: String,
    /// Cluster role granted to bundle pods.
    #[serde(default = "defaults::sandbox_role")]
    pub sandbox_role: String,
    #[serde(default = "defaults::image_pull_policy")]
    pub image_pull_policy: String,
    #[serde(default)]
    pub keep_namespace: bool,
    #[serde(default)]
    pub keep_namespace_on_error: bool,
    #[serde(default = "defaults::state_mount_path")]
    pub state_mount_path: String,
    #[serde(default = "defaults::creds_exec_retries")]
    pub creds_exec_retries: u32,
    #[serde(default = "defaults::creds_exec_interval_secs")]
    pub creds_exec_interval_secs: u64,
    /// Value handed to bundles under the `cluster` parameter.
    #[serde(default = "defaults::runtime_kind")]
    pub runtime_kind: String,
    /// Run bundle pods in the request's target namespace instead of a
    /// transient one.
    #[serde(default)]
    pub reuse_target_namespace: bool,
    /// Join the bundle pod's network to the target namespace via the SDN
    /// annotation hooks (multitenant OpenShift SDN only).
    #[serde(default)]
    pub join_networks: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: defaults::namespace(),
            sandbox_role: defaults::sandbox_role(),
            image_pull_policy: defaults::image_pull_policy(),
            keep_namespace: false,
            keep_namespace_on_error: false,
            state_mount_path: defaults::state_mount_path(),
            creds_exec_retries: defaults::creds_exec_retries(),
            creds_exec_interval_secs: defaults::creds_exec_interval_secs(),
            runtime_kind: defaults::runtime_kind(),
            reuse_target_namespace: false,
            join_networks: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// When true (the default), auth comes from the in-cluster service
    /// account mount and the fields below are ignored.
    #[serde(default = "defaults::in_cluster")]
    pub in_cluster: bool,
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            in_cluster: defaults::in_cluster(),
            api_url: None,
            token: None,
            token_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
        }
    }
}

mod defaults {
    pub fn namespace() -> String {
        "bundle-broker".into()
    }
    pub fn sandbox_role() -> String {
        "edit".into()
    }
    pub fn image_pull_policy() -> String {
        "IfNotPresent".into()
    }
    pub fn state_mount_path() -> String {
        "/etc/apb/state".into()
    }
    pub fn creds_exec_retries() -> u32 {
        7200
    }
    pub fn creds_exec_interval_secs() -> u64 {
        5
    }
    pub fn runtime_kind() -> String {
        "kubernetes".into()
    }
    pub fn in_cluster() -> bool {
        true
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            cluster: ClusterConfig::default(),
            secrets: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let policy = self.broker.image_pull_policy.to_lowercase();
        if !matches!(policy.as_str(), "always" | "never" | "ifnotpresent") {
            return Err(ConfigError::Invalid(format!(
                "image_pull_policy [ {} ] must be one of always, never, ifnotpresent",
                self.broker.image_pull_policy
            )));
        }
        if self.broker.creds_exec_retries == 0 {
            return Err(ConfigError::Invalid(
                "creds_exec_retries must be at least 1".into(),
            ));
        }
        if self.broker.namespace.is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if !self.cluster.in_cluster && self.cluster.api_url.is_none() {
            return Err(ConfigError::Invalid(
                "cluster.api_url is required when in_cluster is false".into(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the cluster API, from the service account
    /// mount or the explicit `[cluster]` section.
    pub fn cluster_auth(&self) -> Result<ClusterAuth, ConfigError> {
        if self.cluster.in_cluster {
            return ClusterAuth::in_cluster()
                .map_err(|e| ConfigError::Invalid(format!("in-cluster auth unavailable: {e}")));
        }
        let raw_url = self
            .cluster
            .api_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("cluster.api_url missing".into()))?;
        let api_url = Url::parse(raw_url)
            .map_err(|e| ConfigError::Invalid(format!("invalid cluster.api_url: {e}")))?;
        let token = match (&self.cluster.token, &self.cluster.token_file) {
            (Some(token), _) => token.clone(),
            (None, Some(file)) => std::fs::read_to_string(file)
                .map_err(|source| ConfigError::Io {
                    path: file.clone(),
                    source,
                })?
                .trim()
                .to_string(),
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "one of cluster.token or cluster.token_file is required".into(),
                ));
            }
        };
        Ok(ClusterAuth {
            api_url,
            token,
            ca_bundle: self.cluster.ca_file.clone(),
            insecure_skip_tls_verify: self.cluster.insecure_skip_tls_verify,
        })
    }

    /// Executor settings derived from the broker section plus the process
    /// environment's proxy variables.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            broker_namespace: self.broker.namespace.clone(),
            sandbox_role: self.broker.sandbox_role.clone(),
            image_pull_policy: self.broker.image_pull_policy.clone(),
            keep_namespace: self.broker.keep_namespace,
            keep_namespace_on_error: self.broker.keep_namespace_on_error,
            state_mount_path: self.broker.state_mount_path.clone(),
            creds_exec_retries: self.broker.creds_exec_retries,
            creds_exec_interval: Duration::from_secs(self.broker.creds_exec_interval_secs),
            runtime_kind: self.broker.runtime_kind.clone(),
            reuse_target_namespace: self.broker.reuse_target_namespace,
            proxy: ProxyConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.broker.namespace, "bundle-broker");
        assert_eq!(config.broker.creds_exec_retries, 7200);
        assert_eq!(config.broker.creds_exec_interval_secs, 5);
        assert!(config.cluster.in_cluster);
        assert!(config.secrets.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [broker]
            namespace = "osb"
            sandbox_role = "admin"
            image_pull_policy = "Always"
            keep_namespace_on_error = true
            runtime_kind = "openshift"
            join_networks = true

            [cluster]
            in_cluster = false
            api_url = "https://api.cluster.local:6443"
            token = "abc"
            insecure_skip_tls_verify = true

            [[secrets]]
            name = "db-rule"
            apb_name = "mysql-apb"
            secret = "db-creds"
        "#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.broker.namespace, "osb");
        assert!(config.broker.keep_namespace_on_error);
        assert_eq!(config.secrets.len(), 1);
        assert_eq!(config.secrets[0].secret, "db-creds");

        let auth = config.cluster_auth().unwrap();
        assert_eq!(auth.token, "abc");
        assert!(auth.insecure_skip_tls_verify);
    }

    #[test]
    fn bad_pull_policy_is_rejected() {
        let raw = r#"
            [broker]
            image_pull_policy = "sometimes"
        "#;
        assert!(matches!(
            Config::parse(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn out_of_cluster_requires_api_url() {
        let raw = r#"
            [cluster]
            in_cluster = false
        "#;
        assert!(matches!(
            Config::parse(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_retries_is_rejected() {
        let raw = r#"
            [broker]
            creds_exec_retries = 0
        "#;
        assert!(Config::parse(raw).is_err());
    }
}
