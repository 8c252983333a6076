//! The reconciliation planner
//!
//! This module is the core of Trellis: it converges a cluster of machines
//! onto the desired state declared in a [`TrellisCluster`] by computing and
//! persisting per-machine plans and advancing the cluster through ordered
//! tiers (bootstrap etcd, etcd, control plane, worker), while running the
//! long-lived phase operations (snapshots, certificate and encryption-key
//! rotation) ahead of any tier work.
//!
//! - [`plan`] - NodePlan value types and change classification
//! - [`store`] - per-machine plan records and the in-sync rule
//! - [`generate`] - desired-plan generation from spec + role + join server
//! - [`drain`] - the drain/uncordon annotation handshake
//! - [`initnode`] - init-node election
//! - [`reconcile`] - the bounded-unavailability tier engine
//! - [`certs`], [`encryption`], [`etcd`] - phase state machines
//! - [`token`] - join token and cluster secret access
//!
//! One `process` pass is strictly sequential and never sleeps: every "not
//! done yet" condition is a typed [`Error::Waiting`] the controller converts
//! into a requeue. Multiple clusters may be processed concurrently; a keyed
//! mutex serializes passes per cluster.

pub mod certs;
pub mod drain;
pub mod encryption;
pub mod etcd;
pub mod generate;
pub mod initnode;
pub mod plan;
pub mod reconcile;
pub mod store;
pub mod token;

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::crd::{Condition, ConditionStatus, TrellisCluster, TrellisClusterStatus};
use crate::machine::{CapiMachineClient, MachineClient, RoleSet};
use crate::planner::initnode::Election;
use crate::planner::reconcile::{reconcile_tier, TierContext, TierSpec};
use crate::planner::store::{Plan, PlanStore, SecretPlanRecordStore};
use crate::planner::token::{ClusterSecrets, SecretClusterSecrets};
use crate::Error;

/// Election retries within one pass before giving up until the next event
const MAX_ELECTION_RETRIES: usize = 3;

/// Per-cluster reconciliation engine
pub struct Planner {
    store: PlanStore,
    machines: Arc<dyn MachineClient>,
    secrets: Arc<dyn ClusterSecrets>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Planner {
    /// Create a planner over explicit collaborators (used by tests)
    pub fn new(
        store: PlanStore,
        machines: Arc<dyn MachineClient>,
        secrets: Arc<dyn ClusterSecrets>,
    ) -> Self {
        Self {
            store,
            machines,
            secrets,
            locks: DashMap::new(),
        }
    }

    /// Create a planner wired to the real Kubernetes APIs
    pub fn from_client(client: Client) -> Self {
        Self::new(
            PlanStore::new(Arc::new(SecretPlanRecordStore::new(client.clone()))),
            Arc::new(CapiMachineClient::new(client.clone())),
            Arc::new(SecretClusterSecrets::new(client)),
        )
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one reconciliation pass for a cluster
    ///
    /// Returns the status to persist and the pass outcome. The outcome's
    /// waiting/ignorable/hard taxonomy decides the requeue; the status is
    /// written regardless so phase transitions survive the pass.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.metadata.name.as_deref().unwrap_or("unknown")))]
    pub async fn process(
        &self,
        cluster: &TrellisCluster,
    ) -> (TrellisClusterStatus, Result<(), Error>) {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();

        // One pass per cluster at a time; distinct clusters proceed
        // concurrently.
        let lock = self.lock_for(&format!("{namespace}/{name}"));
        let _guard = lock.lock().await;

        let mut status = cluster.current_status();
        let outcome = self
            .process_inner(cluster, &namespace, &name, &mut status)
            .await;

        status.observed_generation = cluster.metadata.generation;
        match &outcome {
            Ok(()) => {
                status.ready = true;
                status.message = None;
                status.set_condition(Condition::new(
                    "Reconciled",
                    ConditionStatus::True,
                    "Converged",
                    "",
                ));
            }
            Err(e) if e.is_waiting() => {
                status.ready = false;
                status.message = e.status_message();
                status.set_condition(Condition::new(
                    "Reconciled",
                    ConditionStatus::Unknown,
                    "Waiting",
                    e.status_message().unwrap_or_default(),
                ));
            }
            Err(e) if e.is_ignorable() => {
                status.ready = false;
                status.message = e.status_message();
                status.set_condition(Condition::new(
                    "Reconciled",
                    ConditionStatus::False,
                    "MachinesIgnored",
                    e.status_message().unwrap_or_default(),
                ));
            }
            Err(e) => {
                status.ready = false;
                status.message = Some(e.to_string());
                status.set_condition(Condition::new(
                    "Reconciled",
                    ConditionStatus::False,
                    "Error",
                    e.to_string(),
                ));
            }
        }

        (status, outcome)
    }

    async fn process_inner(
        &self,
        cluster: &TrellisCluster,
        namespace: &str,
        name: &str,
        status: &mut TrellisClusterStatus,
    ) -> Result<(), Error> {
        cluster.spec.validate()?;

        if cluster.metadata.deletion_timestamp.is_some() {
            debug!("cluster deleting, skipping reconciliation");
            return Ok(());
        }

        let machines = self.machines.list_machines(namespace, name).await?;
        let mut plan = self.store.load(machines).await?;

        status.agent_connected = !plan.is_empty()
            && plan
                .entries
                .values()
                .all(|e| e.node.as_ref().is_some_and(|n| n.applied_plan.is_some()));

        let token = self.secrets.ensure_join_token(namespace, name).await?;

        // The join server the phase machines hand to non-init machines; may
        // legitimately be unknown early in the cluster's life.
        let join_server = plan
            .init_node()
            .and_then(|e| e.machine.join_url())
            .map(str::to_string);

        // Long-lived operations run to completion (or block the pass)
        // before any tier reconciliation.
        if etcd::snapshot_create(
            &self.store,
            self.secrets.as_ref(),
            cluster,
            &mut plan,
            status,
            &token,
            join_server.as_deref(),
        )
        .await?
        {
            return Err(Error::waiting("etcd snapshot to progress"));
        }
        if etcd::snapshot_restore(
            &self.store,
            self.machines.as_ref(),
            self.secrets.as_ref(),
            cluster,
            &mut plan,
            status,
        )
        .await?
        {
            return Err(Error::waiting("etcd snapshot restore to progress"));
        }
        if certs::rotate_certificates(
            &self.store,
            cluster,
            &mut plan,
            status,
            &token,
            join_server.as_deref(),
        )
        .await?
        {
            return Err(Error::waiting("certificates to rotate"));
        }
        if encryption::rotate_encryption_keys(
            &self.store,
            cluster,
            &mut plan,
            status,
            &token,
            join_server.as_deref(),
        )
        .await?
        {
            return Err(Error::waiting("encryption key rotation to progress"));
        }

        // Pause halts the machine tiers only; the phase machines above
        // already had their chance to run.
        if cluster.spec.paused {
            return Err(Error::waiting("cluster reconciliation to be unpaused"));
        }

        // Elect the init node, reloading after every label mutation so the
        // election never acts on a stale view.
        let (init_name, init_join_url) = {
            let mut retries = 0;
            loop {
                match initnode::elect_init_node(cluster, &plan, self.machines.as_ref()).await? {
                    Election::Settled { machine, join_url } => break (machine, join_url),
                    Election::Retry => {
                        retries += 1;
                        if retries > MAX_ELECTION_RETRIES {
                            return Err(Error::waiting("init node election to settle"));
                        }
                        let machines = self.machines.list_machines(namespace, name).await?;
                        plan = self.store.load(machines).await?;
                    }
                }
            }
        };
        debug!(init_node = %init_name, "init node elected");

        let strategy = &cluster.spec.upgrade_strategy;
        let ctx = TierContext {
            store: &self.store,
            machines: self.machines.as_ref(),
            cluster,
            token: &token,
            config_generation: status.config_generation,
        };
        let mut deferred: Option<Error> = None;

        // Bootstrap tier: the init node alone, no join server.
        defer_ignorable(
            reconcile_tier(
                &ctx,
                &mut plan,
                &TierSpec {
                    name: "bootstrap",
                    roles: RoleSet::ETCD,
                    required: true,
                },
                |e| e.name() != init_name,
                Some(&IntOrString::Int(1)),
                None,
                &strategy.control_plane_drain_options,
            )
            .await,
            &mut deferred,
        )?;

        // Nothing beyond the bootstrap tier may proceed without a join URL.
        let join_url = init_join_url
            .ok_or_else(|| Error::waiting("the init node to publish its join URL"))?;

        defer_ignorable(
            reconcile_tier(
                &ctx,
                &mut plan,
                &TierSpec {
                    name: "etcd",
                    roles: RoleSet::ETCD,
                    required: false,
                },
                |e| e.name() == init_name,
                strategy.control_plane_concurrency.as_ref(),
                Some(join_url.as_str()),
                &strategy.control_plane_drain_options,
            )
            .await,
            &mut deferred,
        )?;

        defer_ignorable(
            reconcile_tier(
                &ctx,
                &mut plan,
                &TierSpec {
                    name: "control plane",
                    roles: RoleSet::CONTROL_PLANE,
                    required: false,
                },
                |e| e.name() == init_name,
                strategy.control_plane_concurrency.as_ref(),
                Some(join_url.as_str()),
                &strategy.control_plane_drain_options,
            )
            .await,
            &mut deferred,
        )?;

        let cp_join_url = control_plane_join_url(&plan)
            .ok_or_else(|| Error::waiting("a control plane join URL"))?;

        if !status.initialized {
            info!("control plane initialized");
        }
        status.initialized = true;
        status.control_plane_join_url = Some(cp_join_url.clone());

        defer_ignorable(
            reconcile_tier(
                &ctx,
                &mut plan,
                &TierSpec {
                    name: "worker",
                    roles: RoleSet::WORKER,
                    required: false,
                },
                |e| e.machine.roles.is_server(),
                strategy.worker_concurrency.as_ref(),
                Some(cp_join_url.as_str()),
                &strategy.worker_drain_options,
            )
            .await,
            &mut deferred,
        )?;

        // Deferred machine problems surface only when nothing else needed
        // to report first.
        match deferred {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Keep the first ignorable error aside; propagate everything else
fn defer_ignorable(result: Result<(), Error>, deferred: &mut Option<Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_ignorable() => {
            if deferred.is_none() {
                *deferred = Some(e);
            }
            Ok(())
        }
        other => other,
    }
}

/// The join URL of any control-plane machine that has published one
fn control_plane_join_url(plan: &Plan) -> Option<String> {
    plan.entries
        .values()
        .filter(|e| e.machine.roles.contains(RoleSet::CONTROL_PLANE))
        .find_map(|e| e.machine.join_url())
        .map(str::to_string)
}
