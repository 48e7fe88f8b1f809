//! OpenShift multi-tenant SDN hooks.
//!
//! On a multi-tenant SDN the execution namespace must join the primary
//! target's network so the bundle pod can reach the services it manages.
//! The join/isolate request is an annotation on the execution namespace; the
//! SDN controller clears the annotation once it has applied the change, so
//! completion is confirmed by polling for its removal.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cluster::OrchestratorClient;

use super::{SandboxHook, SandboxHookContext};

/// Annotation the SDN controller watches for network membership changes.
pub const CHANGE_NETWORK_ANNOTATION: &str = "pod.network.openshift.io/multitenant.change-network";

const POLL_STEPS: u32 = 15;
const POLL_BASE: Duration = Duration::from_millis(500);
const POLL_FACTOR: f64 = 1.1;

/// Post-create hook joining the execution namespace to the primary target's
/// network namespace.
pub struct JoinNetworks;

#[async_trait]
impl SandboxHook for JoinNetworks {
    fn name(&self) -> &'static str {
        "join-networks"
    }

    async fn run(
        &self,
        client: &dyn OrchestratorClient,
        ctx: &SandboxHookContext,
    ) -> anyhow::Result<()> {
        let Some(target) = ctx.targets.first() else {
            return Ok(());
        };
        if *target == ctx.namespace {
            return Ok(());
        }
        info!(namespace = %ctx.namespace, target = %target, "joining sandbox to target network");
        client
            .annotate_namespace(
                &ctx.namespace,
                CHANGE_NETWORK_ANNOTATION,
                &format!("join:{target}"),
            )
            .await?;
        await_change_applied(client, &ctx.namespace).await
    }
}

/// Pre-destroy hook isolating the execution namespace again.
pub struct IsolateNetworks;

#[async_trait]
impl SandboxHook for IsolateNetworks {
    fn name(&self) -> &'static str {
        "isolate-networks"
    }

    async fn run(
        &self,
        client: &dyn OrchestratorClient,
        ctx: &SandboxHookContext,
    ) -> anyhow::Result<()> {
        let Some(target) = ctx.targets.first() else {
            return Ok(());
        };
        if *target == ctx.namespace {
            return Ok(());
        }
        info!(namespace = %ctx.namespace, "isolating sandbox network");
        client
            .annotate_namespace(&ctx.namespace, CHANGE_NETWORK_ANNOTATION, "isolate")
            .await?;
        await_change_applied(client, &ctx.namespace).await
    }
}

/// Polls until the SDN controller removes the change-network annotation.
/// Exponential backoff: 15 steps, 500 ms base, factor 1.1 (≈ 8 s total).
async fn await_change_applied(
    client: &dyn OrchestratorClient,
    namespace: &str,
) -> anyhow::Result<()> {
    let mut delay = POLL_BASE;
    for step in 0..POLL_STEPS {
        tokio::time::sleep(delay).await;
        let ns = client.get_namespace(namespace).await?;
        if !ns
            .metadata
            .annotations
            .contains_key(CHANGE_NETWORK_ANNOTATION)
        {
            debug!(namespace = %namespace, step, "network change applied");
            return Ok(());
        }
        delay = Duration::from_secs_f64(delay.as_secs_f64() * POLL_FACTOR);
    }
    anyhow::bail!("network change on namespace [ {namespace} ] not confirmed after {POLL_STEPS} polls")
}
