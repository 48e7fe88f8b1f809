//! The state subscriber: one per topic, persisting every [`JobMsg`] and
//! running post-success cleanup for the destructive methods.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bundle::types::{JobMethod, State};
use crate::dao::{DaoError, SubscriberDAO};

use super::{JobMsg, WorkSubscriber};

/// Persists job progress for one topic and reconciles durable records when
/// a job succeeds.
pub struct JobStateSubscriber {
    dao: Arc<dyn SubscriberDAO>,
    method: JobMethod,
}

impl JobStateSubscriber {
    pub fn new(dao: Arc<dyn SubscriberDAO>, method: JobMethod) -> Self {
        Self { dao, method }
    }

    /// The id job state is recorded under: the binding id for bind/unbind,
    /// the instance id otherwise.
    fn record_id(&self, msg: &JobMsg) -> Uuid {
        if self.method.is_binding() {
            msg.binding_id.unwrap_or(msg.instance_id)
        } else {
            msg.instance_id
        }
    }

    async fn mark_failed(&self, id: Uuid, msg: &JobMsg, cause: &DaoError) {
        let mut failed = msg.state.clone();
        failed.state = State::Failed;
        failed.error = cause.to_string();
        if let Err(e) = self.dao.set_state(id, failed).await {
            error!(id = %id, error = %e, "unable to record cleanup failure");
        }
    }

    async fn propagate_dashboard_url(&self, msg: &JobMsg) {
        let Some(url) = msg.dashboard_url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        match self.dao.get_service_instance(msg.instance_id).await {
            Ok(mut instance) => {
                instance.dashboard_url = Some(url.to_string());
                if let Err(e) = self.dao.set_service_instance(instance).await {
                    error!(instance = %msg.instance_id, error = %e, "failed to store dashboard URL");
                }
            }
            Err(e) => {
                debug!(instance = %msg.instance_id, error = %e, "no instance to carry dashboard URL");
            }
        }
    }

    async fn cleanup_deprovision(&self, id: Uuid, msg: &JobMsg) {
        if let Err(e) = self.dao.delete_service_instance(msg.instance_id).await {
            error!(instance = %msg.instance_id, error = %e, "deprovision cleanup failed");
            self.mark_failed(id, msg, &e).await;
            return;
        }
        info!(instance = %msg.instance_id, "service instance removed");
    }

    async fn cleanup_unbind(&self, id: Uuid, msg: &JobMsg) {
        let Some(binding_id) = msg.binding_id else {
            error!(instance = %msg.instance_id, "unbind message without a binding id");
            return;
        };
        let result = async {
            let instance = self.dao.get_service_instance(msg.instance_id).await?;
            let bind = self.dao.get_bind_instance(binding_id).await?;
            self.dao.delete_binding(bind, instance).await
        }
        .await;
        match result {
            Ok(()) => info!(binding = %binding_id, "binding removed"),
            Err(e) => {
                error!(binding = %binding_id, error = %e, "unbind cleanup failed");
                self.mark_failed(id, msg, &e).await;
            }
        }
    }
}

#[async_trait]
impl WorkSubscriber for JobStateSubscriber {
    async fn notify(&self, msg: JobMsg) {
        let id = self.record_id(&msg);
        debug!(
            id = %id,
            token = %msg.job_token,
            state = ?msg.state.state,
            "recording job state"
        );
        if let Err(e) = self.dao.set_state(id, msg.state.clone()).await {
            error!(id = %id, error = %e, "failed to persist job state");
            return;
        }

        if msg.state.state != State::Succeeded {
            return;
        }

        if let Some(credentials) = &msg.extracted_credentials {
            if let Err(e) = self
                .dao
                .set_extracted_credentials(id, credentials.clone())
                .await
            {
                error!(id = %id, error = %e, "failed to persist extracted credentials");
            }
        }

        match self.method {
            JobMethod::Provision | JobMethod::Update => {
                self.propagate_dashboard_url(&msg).await;
            }
            JobMethod::Deprovision => self.cleanup_deprovision(id, &msg).await,
            JobMethod::Unbind => self.cleanup_unbind(id, &msg).await,
            JobMethod::Bind => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::types::{
        BindInstance, Context, ExtractedCredentials, JobState, ServiceInstance, Spec,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    /// DAO fake that records the order of operations and can be told to
    /// fail specific ones.
    #[derive(Default)]
    struct RecordingDao {
        ops: Mutex<Vec<String>>,
        instances: RwLock<HashMap<Uuid, ServiceInstance>>,
        bindings: RwLock<HashMap<Uuid, BindInstance>>,
        states: RwLock<HashMap<Uuid, JobState>>,
        fail_delete_instance: bool,
        fail_delete_binding: bool,
    }

    impl RecordingDao {
        fn record(&self, op: impl Into<String>) {
            self.ops.lock().unwrap().push(op.into());
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubscriberDAO for RecordingDao {
        async fn set_state(&self, id: Uuid, state: JobState) -> Result<String, DaoError> {
            self.record(format!("set_state:{:?}", state.state));
            let token = state.token.clone();
            self.states.write().await.insert(id, state);
            Ok(token)
        }

        async fn get_state(&self, id: Uuid, _token: &str) -> Result<JobState, DaoError> {
            self.states
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| DaoError::NotFound("state".into()))
        }

        async fn get_service_instance(&self, id: Uuid) -> Result<ServiceInstance, DaoError> {
            self.record("get_service_instance");
            self.instances
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| DaoError::NotFound("instance".into()))
        }

        async fn set_service_instance(&self, instance: ServiceInstance) -> Result<(), DaoError> {
            self.record("set_service_instance");
            self.instances.write().await.insert(instance.id, instance);
            Ok(())
        }

        async fn delete_service_instance(&self, id: Uuid) -> Result<(), DaoError> {
            self.record("delete_service_instance");
            if self.fail_delete_instance {
                return Err(DaoError::Storage("etcd down".into()));
            }
            self.instances.write().await.remove(&id);
            Ok(())
        }

        async fn get_bind_instance(&self, id: Uuid) -> Result<BindInstance, DaoError> {
            self.record("get_bind_instance");
            self.bindings
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| DaoError::NotFound("binding".into()))
        }

        async fn set_bind_instance(&self, bind: BindInstance) -> Result<(), DaoError> {
            self.record("set_bind_instance");
            self.bindings.write().await.insert(bind.id, bind);
            Ok(())
        }

        async fn delete_binding(
            &self,
            bind: BindInstance,
            _instance: ServiceInstance,
        ) -> Result<(), DaoError> {
            self.record("delete_binding");
            if self.fail_delete_binding {
                return Err(DaoError::Storage("etcd down".into()));
            }
            self.bindings.write().await.remove(&bind.id);
            Ok(())
        }

        async fn set_extracted_credentials(
            &self,
            _id: Uuid,
            _credentials: ExtractedCredentials,
        ) -> Result<(), DaoError> {
            self.record("set_extracted_credentials");
            Ok(())
        }

        async fn delete_extracted_credentials(&self, _id: Uuid) -> Result<(), DaoError> {
            self.record("delete_extracted_credentials");
            Ok(())
        }
    }

    fn msg(method: JobMethod, state: State, instance_id: Uuid, binding_id: Option<Uuid>) -> JobMsg {
        JobMsg {
            instance_id,
            binding_id,
            job_token: "tok".into(),
            spec_id: "spec-1".into(),
            pod_name: "bundle-1".into(),
            state: JobState {
                token: "tok".into(),
                state,
                method: Some(method),
                ..JobState::default()
            },
            extracted_credentials: None,
            dashboard_url: None,
        }
    }

    #[tokio::test]
    async fn deprovision_success_deletes_the_instance() {
        let dao = Arc::new(RecordingDao::default());
        let instance_id = Uuid::new_v4();
        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Deprovision);

        subscriber
            .notify(msg(JobMethod::Deprovision, State::Succeeded, instance_id, None))
            .await;

        assert_eq!(
            dao.ops(),
            vec!["set_state:Succeeded", "delete_service_instance"]
        );
    }

    #[tokio::test]
    async fn deprovision_cleanup_failure_writes_failed_state() {
        let dao = Arc::new(RecordingDao {
            fail_delete_instance: true,
            ..RecordingDao::default()
        });
        let instance_id = Uuid::new_v4();
        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Deprovision);

        subscriber
            .notify(msg(JobMethod::Deprovision, State::Succeeded, instance_id, None))
            .await;

        assert_eq!(
            dao.ops(),
            vec![
                "set_state:Succeeded",
                "delete_service_instance",
                "set_state:Failed"
            ]
        );
        let state = dao.get_state(instance_id, "tok").await.unwrap();
        assert_eq!(state.state, State::Failed);
        assert!(state.error.contains("etcd down"));
    }

    #[tokio::test]
    async fn unbind_success_unlinks_the_binding() {
        let dao = Arc::new(RecordingDao::default());
        let binding_id = Uuid::new_v4();
        let mut instance = ServiceInstance::new(
            Uuid::new_v4(),
            Spec::default(),
            Context::default(),
            None,
        );
        instance.add_binding(binding_id);
        let instance_id = instance.id;
        dao.instances.write().await.insert(instance_id, instance);
        dao.bindings.write().await.insert(
            binding_id,
            BindInstance {
                id: binding_id,
                service_id: instance_id,
                parameters: None,
                create_job_key: None,
            },
        );

        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Unbind);
        subscriber
            .notify(msg(
                JobMethod::Unbind,
                State::Succeeded,
                instance_id,
                Some(binding_id),
            ))
            .await;

        assert_eq!(
            dao.ops(),
            vec![
                "set_state:Succeeded",
                "get_service_instance",
                "get_bind_instance",
                "delete_binding"
            ]
        );
    }

    #[tokio::test]
    async fn unbind_cleanup_failure_writes_failed_state() {
        let dao = Arc::new(RecordingDao {
            fail_delete_binding: true,
            ..RecordingDao::default()
        });
        let binding_id = Uuid::new_v4();
        let instance = ServiceInstance::new(
            Uuid::new_v4(),
            Spec::default(),
            Context::default(),
            None,
        );
        let instance_id = instance.id;
        dao.instances.write().await.insert(instance_id, instance);
        dao.bindings.write().await.insert(
            binding_id,
            BindInstance {
                id: binding_id,
                service_id: instance_id,
                parameters: None,
                create_job_key: None,
            },
        );

        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Unbind);
        subscriber
            .notify(msg(
                JobMethod::Unbind,
                State::Succeeded,
                instance_id,
                Some(binding_id),
            ))
            .await;

        let ops = dao.ops();
        assert_eq!(ops.last().unwrap(), "set_state:Failed");
        let state = dao.get_state(binding_id, "tok").await.unwrap();
        assert_eq!(state.state, State::Failed);
    }

    #[tokio::test]
    async fn binding_messages_are_keyed_by_binding_id() {
        let dao = Arc::new(RecordingDao::default());
        let binding_id = Uuid::new_v4();
        let instance_id = Uuid::new_v4();
        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Bind);

        subscriber
            .notify(msg(
                JobMethod::Bind,
                State::InProgress,
                instance_id,
                Some(binding_id),
            ))
            .await;

        assert!(dao.get_state(binding_id, "tok").await.is_ok());
        assert!(dao.get_state(instance_id, "tok").await.is_err());
    }

    #[tokio::test]
    async fn provision_success_propagates_dashboard_url() {
        let dao = Arc::new(RecordingDao::default());
        let instance = ServiceInstance::new(
            Uuid::new_v4(),
            Spec::default(),
            Context::default(),
            None,
        );
        let instance_id = instance.id;
        dao.instances.write().await.insert(instance_id, instance);

        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Provision);
        let mut message = msg(JobMethod::Provision, State::Succeeded, instance_id, None);
        message.dashboard_url = Some("https://dash".into());
        subscriber.notify(message).await;

        let stored = dao.instances.read().await.get(&instance_id).cloned().unwrap();
        assert_eq!(stored.dashboard_url.as_deref(), Some("https://dash"));
    }

    #[tokio::test]
    async fn intermediate_messages_skip_cleanup() {
        let dao = Arc::new(RecordingDao::default());
        let subscriber = JobStateSubscriber::new(dao.clone(), JobMethod::Deprovision);

        subscriber
            .notify(msg(
                JobMethod::Deprovision,
                State::InProgress,
                Uuid::new_v4(),
                None,
            ))
            .await;

        assert_eq!(dao.ops(), vec!["set_state:InProgress"]);
    }
}
