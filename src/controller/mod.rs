//! Controller wiring for the TrellisCluster CRD
//!
//! This module adapts the planner to the kube-runtime controller pattern:
//! every watch event on a cluster (or one of its machines or secrets) runs
//! one `Planner::process` pass, persists the resulting status, and converts
//! the pass outcome into a requeue `Action`. The planner itself never
//! sleeps; the requeue intervals here are the only scheduling policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{TrellisCluster, TrellisClusterStatus};
use crate::planner::Planner;
use crate::Error;

/// Requeue after a converged pass (steady-state drift detection)
const REQUEUE_CONVERGED: Duration = Duration::from_secs(60);
/// Requeue while waiting for agents, drains, or phase machines
const REQUEUE_WAITING: Duration = Duration::from_secs(5);
/// Requeue when only ignored machines remain broken
const REQUEUE_IGNORED: Duration = Duration::from_secs(15);

/// Trait abstracting cluster status persistence
///
/// Allows mocking the status write in tests while using the real API in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Patch the status of a TrellisCluster
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrellisClusterStatus,
    ) -> Result<(), Error>;
}

/// Real status client backed by the TrellisCluster API
pub struct StatusClientImpl {
    client: Client,
}

impl StatusClientImpl {
    /// Create a new status client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for StatusClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrellisClusterStatus,
    ) -> Result<(), Error> {
        let api: Api<TrellisCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply("trellis-planner"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared controller context
pub struct Context {
    /// The reconciliation engine
    pub planner: Arc<Planner>,
    /// Status persistence
    pub status: Arc<dyn StatusClient>,
}

impl Context {
    /// Create a context wired to the real Kubernetes APIs
    pub fn new(client: Client) -> Self {
        Self {
            planner: Arc::new(Planner::from_client(client.clone())),
            status: Arc::new(StatusClientImpl::new(client)),
        }
    }

    /// Create a context over explicit collaborators (primarily for testing)
    pub fn with(planner: Arc<Planner>, status: Arc<dyn StatusClient>) -> Self {
        Self { planner, status }
    }
}

/// Reconcile a TrellisCluster resource
///
/// Runs one planner pass, persists the status it produced, and maps the
/// outcome onto the requeue policy: converged clusters are re-checked
/// slowly, waiting conditions quickly, and hard errors fall through to
/// [`error_policy`].
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<TrellisCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    debug!("reconciling cluster");

    let (status, outcome) = ctx.planner.process(&cluster).await;
    ctx.status.patch_status(&namespace, &name, &status).await?;

    match outcome {
        Ok(()) => {
            debug!("cluster converged");
            Ok(Action::requeue(REQUEUE_CONVERGED))
        }
        Err(e) if e.is_waiting() => {
            debug!(reason = %e, "pass waiting");
            Ok(Action::requeue(REQUEUE_WAITING))
        }
        Err(e) if e.is_ignorable() => {
            warn!(reason = %e, "machines ignored");
            Ok(Action::requeue(REQUEUE_IGNORED))
        }
        Err(e) => {
            info!(error = %e, "pass failed");
            Err(e)
        }
    }
}

/// Error policy for the controller
///
/// Hard errors requeue with a short delay; non-retryable errors (spec
/// problems) wait for the user to change the object.
pub fn error_policy(cluster: Arc<TrellisCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(REQUEUE_WAITING)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::JOIN_URL_ANNOTATION;
    use crate::planner::fixtures::{FixtureCluster, FixtureSecrets};
    use crate::planner::store::PlanStore;

    fn context_for(fx: &FixtureCluster) -> Arc<Context> {
        let planner = Planner::new(
            PlanStore::new(fx.records.clone()),
            Arc::new(fx.machine_client()),
            Arc::new(FixtureSecrets),
        );
        let mut status = MockStatusClient::new();
        status.expect_patch_status().returning(|_, _, _| Ok(()));
        Arc::new(Context::with(Arc::new(planner), Arc::new(status)))
    }

    // =========================================================================
    // Requeue Policy Stories
    // =========================================================================

    /// Story: an in-flight rollout requeues quickly
    #[tokio::test]
    async fn story_waiting_pass_requeues_quickly() {
        let mut fx = FixtureCluster::new();
        fx.add_server("server-0");
        fx.annotate("server-0", JOIN_URL_ANNOTATION, "https://init:9345");
        let ctx = context_for(&fx);

        let action = reconcile(Arc::new(fx.cluster()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WAITING));
    }

    /// Story: a converged cluster settles into slow drift checks
    #[tokio::test]
    async fn story_converged_pass_requeues_slowly() {
        let mut fx = FixtureCluster::new();
        fx.add_server("server-0");
        fx.annotate("server-0", JOIN_URL_ANNOTATION, "https://init:9345");
        let ctx = context_for(&fx);

        let _ = reconcile(Arc::new(fx.cluster()), ctx.clone()).await.unwrap();
        fx.agent_apply("server-0");

        let action = reconcile(Arc::new(fx.cluster()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_CONVERGED));
    }

    /// Story: spec errors wait for the user instead of hot-looping
    #[tokio::test]
    async fn story_error_policy_on_spec_problems() {
        let fx = FixtureCluster::new();
        let ctx = context_for(&fx);

        let action = error_policy(
            Arc::new(fx.cluster()),
            &Error::validation("bad spec"),
            ctx.clone(),
        );
        assert_eq!(action, Action::await_change());

        let action = error_policy(
            Arc::new(fx.cluster()),
            &Error::internal("store", "conflict"),
            ctx,
        );
        assert_eq!(action, Action::requeue(REQUEUE_WAITING));
    }
}
