//! Thin facade tying the executor, work engine, and DAO together.
//!
//! The HTTP layer (out of scope here) maps Open Service Broker calls onto
//! these methods. Each call records the durable intent, schedules a job on
//! the matching topic, and hands back the token clients poll with.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::bundle::executor::{Executor, ExecutorConfig, JobRunner};
use crate::bundle::secrets::SecretPolicy;
use crate::bundle::types::{
    BindInstance, JobMethod, JobState, Parameters, ServiceInstance, Spec,
};
use crate::bundle::ExecutorError;
use crate::cluster::OrchestratorClient;
use crate::dao::{DaoError, SubscriberDAO};
use crate::engine::jobs::BundleJob;
use crate::engine::subscriber::JobStateSubscriber;
use crate::engine::WorkEngine;
use crate::runtime::SandboxManager;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Dao(#[from] DaoError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub struct Broker {
    client: Arc<dyn OrchestratorClient>,
    sandbox: Arc<SandboxManager>,
    secrets: Arc<SecretPolicy>,
    executor_config: ExecutorConfig,
    engine: Arc<WorkEngine>,
    dao: Arc<dyn SubscriberDAO>,
}

impl Broker {
    /// Assembles the broker and attaches one state subscriber per topic.
    pub async fn new(
        client: Arc<dyn OrchestratorClient>,
        sandbox: Arc<SandboxManager>,
        secrets: Arc<SecretPolicy>,
        executor_config: ExecutorConfig,
        dao: Arc<dyn SubscriberDAO>,
    ) -> Self {
        let engine = Arc::new(WorkEngine::new());
        for method in JobMethod::ALL {
            engine
                .attach_subscriber(
                    Arc::new(JobStateSubscriber::new(Arc::clone(&dao), method)),
                    method,
                )
                .await;
        }
        Self {
            client,
            sandbox,
            secrets,
            executor_config,
            engine,
            dao,
        }
    }

    /// Registers a catalog spec: installs its secret associations and strips
    /// cluster-supplied parameters from the plan schemas.
    pub async fn register_specs(&self, specs: &mut [Spec]) -> Result<(), BrokerError> {
        for spec in specs.iter() {
            self.secrets.add_secrets_for(spec).await;
        }
        self.secrets
            .filter_secrets(self.client.as_ref(), specs)
            .await?;
        Ok(())
    }

    pub async fn provision(&self, instance: ServiceInstance) -> Result<String, BrokerError> {
        self.dao.set_service_instance(instance.clone()).await?;
        let job = BundleJob::provision(self.runner(), instance);
        let token = self
            .engine
            .start_job(None, Box::new(job), JobMethod::Provision)
            .await;
        info!(token = %token, "provision job scheduled");
        Ok(token)
    }

    pub async fn deprovision(&self, instance_id: Uuid) -> Result<String, BrokerError> {
        let instance = self.dao.get_service_instance(instance_id).await?;
        let job = BundleJob::deprovision(self.runner(), instance);
        let token = self
            .engine
            .start_job(None, Box::new(job), JobMethod::Deprovision)
            .await;
        info!(token = %token, instance = %instance_id, "deprovision job scheduled");
        Ok(token)
    }

    pub async fn update(
        &self,
        instance_id: Uuid,
        parameters: Parameters,
    ) -> Result<String, BrokerError> {
        let mut instance = self.dao.get_service_instance(instance_id).await?;
        instance.parameters = Some(parameters.clone());
        self.dao.set_service_instance(instance.clone()).await?;
        let job = BundleJob::update(self.runner(), instance, parameters);
        let token = self
            .engine
            .start_job(None, Box::new(job), JobMethod::Update)
            .await;
        info!(token = %token, instance = %instance_id, "update job scheduled");
        Ok(token)
    }

    pub async fn bind(
        &self,
        instance_id: Uuid,
        binding_id: Uuid,
        parameters: Parameters,
    ) -> Result<String, BrokerError> {
        let mut instance = self.dao.get_service_instance(instance_id).await?;
        instance.add_binding(binding_id);
        self.dao.set_service_instance(instance.clone()).await?;

        let job = BundleJob::bind(self.runner(), instance, parameters.clone(), binding_id);
        let token = self
            .engine
            .start_job(None, Box::new(job), JobMethod::Bind)
            .await;
        self.dao
            .set_bind_instance(BindInstance {
                id: binding_id,
                service_id: instance_id,
                parameters: Some(parameters),
                create_job_key: Some(token.clone()),
            })
            .await?;
        info!(token = %token, binding = %binding_id, "bind job scheduled");
        Ok(token)
    }

    /// Schedules an unbind. With `skip_execution` the bundle never runs; the
    /// job reports success immediately and the subscriber unlinks the
    /// binding records.
    pub async fn unbind(
        &self,
        instance_id: Uuid,
        binding_id: Uuid,
        parameters: Parameters,
        skip_execution: bool,
    ) -> Result<String, BrokerError> {
        let instance = self.dao.get_service_instance(instance_id).await?;
        let job = BundleJob::unbind(self.runner(), instance, parameters, binding_id)
            .with_skip_execution(skip_execution);
        let token = self
            .engine
            .start_job(None, Box::new(job), JobMethod::Unbind)
            .await;
        info!(token = %token, binding = %binding_id, "unbind job scheduled");
        Ok(token)
    }

    /// The job state clients poll via last-operation.
    pub async fn last_operation(&self, id: Uuid, token: &str) -> Result<JobState, BrokerError> {
        Ok(self.dao.get_state(id, token).await?)
    }

    /// One fresh executor per run; clones share nothing across jobs.
    fn runner(&self) -> Arc<dyn JobRunner> {
        Arc::new(Executor::new(
            Arc::clone(&self.client),
            Arc::clone(&self.sandbox),
            Arc::clone(&self.secrets),
            self.executor_config.clone(),
        ))
    }
}
