//! Secret association policy.
//!
//! Operators configure rules tying cluster secrets to bundle specs. Matching
//! secrets are mounted into the bundle pod, and any plan parameter whose name
//! collides with a key in an associated secret is hidden from the schema
//! shown to clients since the cluster supplies the value.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cluster::{ClusterError, OrchestratorClient};

use super::types::Spec;
use super::ExecutorError;

/// One configured association between a spec and a secret.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SecretRule {
    /// Rule name, for operator-facing logs only.
    pub name: String,
    /// Fully-qualified spec name the rule applies to.
    pub apb_name: String,
    /// Secret in the broker namespace to associate.
    pub secret: String,
}

/// Process-wide map of `Spec.fq_name` to its associated secret names.
///
/// Installs take the write lock; lookups and filtering take the read lock.
pub struct SecretPolicy {
    broker_namespace: String,
    rules: Vec<SecretRule>,
    associations: RwLock<HashMap<String, HashSet<String>>>,
}

impl SecretPolicy {
    pub fn new(broker_namespace: impl Into<String>, rules: Vec<SecretRule>) -> Self {
        Self {
            broker_namespace: broker_namespace.into(),
            rules,
            associations: RwLock::new(HashMap::new()),
        }
    }

    /// Applies every matching rule to the spec. Called once per spec at
    /// startup and again on config reload.
    pub async fn add_secrets_for(&self, spec: &Spec) {
        let mut associations = self.associations.write().await;
        for rule in &self.rules {
            if rule.apb_name == spec.fq_name {
                info!(rule = %rule.name, spec = %spec.fq_name, secret = %rule.secret, "associating secret with spec");
                associations
                    .entry(spec.fq_name.clone())
                    .or_default()
                    .insert(rule.secret.clone());
            }
        }
    }

    /// Names of the secrets associated with a spec, sorted for stable
    /// mount ordering.
    pub async fn secrets_for(&self, spec: &Spec) -> Vec<String> {
        let associations = self.associations.read().await;
        let mut names: Vec<String> = associations
            .get(&spec.fq_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Strips parameter descriptors that collide with keys of any associated
    /// secret from every plan, so cluster-supplied values never appear in the
    /// schema returned to clients.
    pub async fn filter_secrets(
        &self,
        client: &dyn OrchestratorClient,
        specs: &mut [Spec],
    ) -> Result<(), ExecutorError> {
        for spec in specs.iter_mut() {
            let secret_names = self.secrets_for(spec).await;
            if secret_names.is_empty() {
                continue;
            }
            let mut hidden: HashSet<String> = HashSet::new();
            for name in &secret_names {
                match client.get_secret(&self.broker_namespace, name).await {
                    Ok(secret) => {
                        hidden.extend(secret.data.keys().cloned());
                        hidden.extend(secret.string_data.keys().cloned());
                    }
                    Err(ClusterError::NotFound(_)) => {
                        debug!(secret = %name, spec = %spec.fq_name, "associated secret not present yet");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if hidden.is_empty() {
                continue;
            }
            for plan in spec.plans.iter_mut() {
                plan.parameters.retain(|pd| !hidden.contains(&pd.name));
                plan.bind_parameters.retain(|pd| !hidden.contains(&pd.name));
            }
        }
        Ok(())
    }
}
