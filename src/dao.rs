//! Durable broker state behind the [`SubscriberDAO`] seam.
//!
//! Subscribers mutate instances, bindings, job states, and credentials only
//! through this trait, which keeps them testable against a recording fake
//! and leaves the storage backend swappable. [`InMemoryDao`] is the
//! reference implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bundle::types::{BindInstance, ExtractedCredentials, JobState, ServiceInstance};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaoError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Storage operations the state subscribers depend on.
///
/// `SetServiceInstance` is a read-modify-write through the store; two jobs
/// mutating the same instance are not synchronized here.
#[async_trait]
pub trait SubscriberDAO: Send + Sync {
    /// Persists a job state under `(id, token)` and returns the token.
    async fn set_state(&self, id: Uuid, state: JobState) -> Result<String, DaoError>;

    async fn get_state(&self, id: Uuid, token: &str) -> Result<JobState, DaoError>;

    async fn get_service_instance(&self, id: Uuid) -> Result<ServiceInstance, DaoError>;

    async fn set_service_instance(&self, instance: ServiceInstance) -> Result<(), DaoError>;

    async fn delete_service_instance(&self, id: Uuid) -> Result<(), DaoError>;

    async fn get_bind_instance(&self, id: Uuid) -> Result<BindInstance, DaoError>;

    async fn set_bind_instance(&self, bind: BindInstance) -> Result<(), DaoError>;

    /// Unlinks a binding: removes its id from the owning instance's set,
    /// persists the instance, and drops the binding record.
    async fn delete_binding(
        &self,
        bind: BindInstance,
        instance: ServiceInstance,
    ) -> Result<(), DaoError>;

    async fn set_extracted_credentials(
        &self,
        id: Uuid,
        credentials: ExtractedCredentials,
    ) -> Result<(), DaoError>;

    async fn delete_extracted_credentials(&self, id: Uuid) -> Result<(), DaoError>;
}

/// Map-backed store, suitable for a single broker process.
#[derive(Default)]
pub struct InMemoryDao {
    states: RwLock<HashMap<(Uuid, String), JobState>>,
    instances: RwLock<HashMap<Uuid, ServiceInstance>>,
    bindings: RwLock<HashMap<Uuid, BindInstance>>,
    credentials: RwLock<HashMap<Uuid, ExtractedCredentials>>,
}

impl InMemoryDao {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberDAO for InMemoryDao {
    async fn set_state(&self, id: Uuid, state: JobState) -> Result<String, DaoError> {
        let token = state.token.clone();
        self.states.write().await.insert((id, token.clone()), state);
        Ok(token)
    }

    async fn get_state(&self, id: Uuid, token: &str) -> Result<JobState, DaoError> {
        self.states
            .read()
            .await
            .get(&(id, token.to_string()))
            .cloned()
            .ok_or_else(|| DaoError::NotFound(format!("job state {id}/{token}")))
    }

    async fn get_service_instance(&self, id: Uuid) -> Result<ServiceInstance, DaoError> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DaoError::NotFound(format!("service instance {id}")))
    }

    async fn set_service_instance(&self, instance: ServiceInstance) -> Result<(), DaoError> {
        self.instances.write().await.insert(instance.id, instance);
        Ok(())
    }

    async fn delete_service_instance(&self, id: Uuid) -> Result<(), DaoError> {
        self.instances
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DaoError::NotFound(format!("service instance {id}")))
    }

    async fn get_bind_instance(&self, id: Uuid) -> Result<BindInstance, DaoError> {
        self.bindings
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DaoError::NotFound(format!("bind instance {id}")))
    }

    async fn set_bind_instance(&self, bind: BindInstance) -> Result<(), DaoError> {
        self.bindings.write().await.insert(bind.id, bind);
        Ok(())
    }

    async fn delete_binding(
        &self,
        bind: BindInstance,
        mut instance: ServiceInstance,
    ) -> Result<(), DaoError> {
        instance.remove_binding(&bind.id);
        self.set_service_instance(instance).await?;
        self.bindings.write().await.remove(&bind.id);
        Ok(())
    }

    async fn set_extracted_credentials(
        &self,
        id: Uuid,
        credentials: ExtractedCredentials,
    ) -> Result<(), DaoError> {
        self.credentials.write().await.insert(id, credentials);
        Ok(())
    }

    async fn delete_extracted_credentials(&self, id: Uuid) -> Result<(), DaoError> {
        self.credentials.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::types::{Context, JobMethod, Spec, State};

    fn instance_with_binding(binding_id: Uuid) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            Uuid::new_v4(),
            Spec::default(),
            Context::default(),
            None,
        );
        instance.add_binding(binding_id);
        instance
    }

    #[tokio::test]
    async fn state_round_trips_by_id_and_token() {
        let dao = InMemoryDao::new();
        let id = Uuid::new_v4();
        let state = JobState {
            token: "tok".into(),
            state: State::InProgress,
            method: Some(JobMethod::Provision),
            ..JobState::default()
        };
        let token = dao.set_state(id, state.clone()).await.unwrap();
        assert_eq!(token, "tok");
        assert_eq!(dao.get_state(id, "tok").await.unwrap(), state);
        assert!(dao.get_state(id, "other").await.is_err());
    }

    #[tokio::test]
    async fn delete_binding_unlinks_instance_and_record() {
        let dao = InMemoryDao::new();
        let binding_id = Uuid::new_v4();
        let instance = instance_with_binding(binding_id);
        let bind = BindInstance {
            id: binding_id,
            service_id: instance.id,
            parameters: None,
            create_job_key: None,
        };
        dao.set_service_instance(instance.clone()).await.unwrap();
        dao.set_bind_instance(bind.clone()).await.unwrap();

        dao.delete_binding(bind, instance.clone()).await.unwrap();

        let stored = dao.get_service_instance(instance.id).await.unwrap();
        assert!(!stored.binding_ids.contains(&binding_id));
        assert!(dao.get_bind_instance(binding_id).await.is_err());
    }

    #[tokio::test]
    async fn deleting_a_missing_instance_is_an_error() {
        let dao = InMemoryDao::new();
        assert!(matches!(
            dao.delete_service_instance(Uuid::new_v4()).await,
            Err(DaoError::NotFound(_))
        ));
    }
}
