//! Jobs that drive one bundle action through a [`JobRunner`] and translate
//! its status stream into [`JobMsg`]s for the subscribers.
//!
//! Error text is laundered here: the raw message always lands in
//! `JobState.error`, but the client-facing `description` only carries it
//! verbatim for error kinds known to be safe to display.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::bundle::executor::JobRunner;
use crate::bundle::types::{JobMethod, JobState, Parameters, ServiceInstance, State};
use crate::bundle::StatusMessage;

use super::{JobMsg, Work};

/// The description reported for failures whose raw text must not reach
/// clients.
pub fn generic_failure_description(method: JobMethod) -> String {
    format!("Error occurred during {method}. Please contact administrator if the issue persists.")
}

/// One bundle action as schedulable work.
pub struct BundleJob {
    runner: Arc<dyn JobRunner>,
    method: JobMethod,
    instance: ServiceInstance,
    parameters: Parameters,
    binding_id: Option<Uuid>,
    skip_execution: bool,
}

impl BundleJob {
    pub fn provision(runner: Arc<dyn JobRunner>, instance: ServiceInstance) -> Self {
        let parameters = instance.parameters.clone().unwrap_or_default();
        Self::new(runner, JobMethod::Provision, instance, parameters, None)
    }

    pub fn deprovision(runner: Arc<dyn JobRunner>, instance: ServiceInstance) -> Self {
        let parameters = instance.parameters.clone().unwrap_or_default();
        Self::new(runner, JobMethod::Deprovision, instance, parameters, None)
    }

    pub fn update(
        runner: Arc<dyn JobRunner>,
        instance: ServiceInstance,
        parameters: Parameters,
    ) -> Self {
        Self::new(runner, JobMethod::Update, instance, parameters, None)
    }

    pub fn bind(
        runner: Arc<dyn JobRunner>,
        instance: ServiceInstance,
        parameters: Parameters,
        binding_id: Uuid,
    ) -> Self {
        Self::new(runner, JobMethod::Bind, instance, parameters, Some(binding_id))
    }

    pub fn unbind(
        runner: Arc<dyn JobRunner>,
        instance: ServiceInstance,
        parameters: Parameters,
        binding_id: Uuid,
    ) -> Self {
        Self::new(runner, JobMethod::Unbind, instance, parameters, Some(binding_id))
    }

    fn new(
        runner: Arc<dyn JobRunner>,
        method: JobMethod,
        instance: ServiceInstance,
        parameters: Parameters,
        binding_id: Option<Uuid>,
    ) -> Self {
        Self {
            runner,
            method,
            instance,
            parameters,
            binding_id,
            skip_execution: false,
        }
    }

    /// Marks the job as already satisfied: it reports success without ever
    /// invoking the runner. Used when the underlying resources are known to
    /// be gone, for example unbinding after the instance was deprovisioned.
    pub fn with_skip_execution(mut self, skip: bool) -> Self {
        self.skip_execution = skip;
        self
    }

    fn job_msg(&self, token: &str, state: JobState) -> JobMsg {
        JobMsg {
            instance_id: self.instance.id,
            binding_id: self.binding_id,
            job_token: token.to_string(),
            spec_id: self.instance.spec.id.clone(),
            pod_name: state.podname.clone(),
            state,
            extracted_credentials: None,
            dashboard_url: None,
        }
    }

    fn translate(&self, token: &str, status: StatusMessage) -> JobMsg {
        let pod_name = self.runner.pod_name();
        let mut state = JobState {
            token: token.to_string(),
            state: status.state,
            method: Some(self.method),
            podname: pod_name,
            description: status.description,
            error: String::new(),
        };

        let mut msg = match status.state {
            State::Succeeded => {
                state.description = format!("{} job completed", self.method);
                let mut msg = self.job_msg(token, state);
                msg.extracted_credentials = self.runner.extracted_credentials();
                msg.dashboard_url = self.runner.dashboard_url();
                msg
            }
            State::Failed => {
                if let Some(error) = &status.error {
                    state.error = error.to_string();
                    state.description = if error.is_message_safe() {
                        error.to_string()
                    } else {
                        generic_failure_description(self.method)
                    };
                } else {
                    state.description = generic_failure_description(self.method);
                }
                self.job_msg(token, state)
            }
            _ => self.job_msg(token, state),
        };
        msg.dashboard_url = msg.dashboard_url.or_else(|| self.runner.dashboard_url());
        msg
    }
}

#[async_trait]
impl Work for BundleJob {
    async fn run(self: Box<Self>, token: String, tx: mpsc::Sender<JobMsg>) {
        if self.skip_execution {
            debug!(token = %token, method = %self.method, "skipping execution");
            let state = JobState {
                token: token.clone(),
                state: State::Succeeded,
                method: Some(self.method),
                podname: String::new(),
                description: format!("{} job completed", self.method),
                error: String::new(),
            };
            let msg = self.job_msg(&token, state);
            let _ = tx.send(msg).await;
            return;
        }

        let mut statuses = self
            .runner
            .execute(
                self.method,
                &self.instance,
                self.parameters.clone(),
                self.binding_id,
            )
            .await;

        while let Some(status) = statuses.recv().await {
            let msg = self.translate(&token, status);
            if tx.send(msg).await.is_err() {
                debug!(token = %token, "topic closed; abandoning job updates");
                return;
            }
        }
    }
}
