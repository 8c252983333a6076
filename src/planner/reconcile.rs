//! Tier reconciliation engine
//!
//! Rolls the desired plan out across one role tier under a bounded
//! unavailability budget. Within a pass, machines are processed in name
//! order and every mutation is a sequential write; "concurrency" bounds how
//! many machines may be unavailable across passes, not parallelism.
//!
//! Per machine, the engine classifies the difference between the current
//! and desired plan: new plans and minor changes apply immediately, major
//! changes route through the drain handshake and consume budget, unchanged
//! plans wait for the agent, and in-sync machines are uncordoned and
//! reported ready.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::crd::{DrainOptions, TrellisCluster};
use crate::machine::{detail_names, MachineClient, RoleSet};
use crate::planner::drain::DrainCoordinator;
use crate::planner::generate::{self, PlanInput};
use crate::planner::plan::{NodePlan, PlanChange};
use crate::planner::store::{Plan, PlanEntry, PlanStore, DEFAULT_MAX_FAILURES};
use crate::Error;

/// Pass-scoped dependencies shared by every tier
pub struct TierContext<'a> {
    /// Plan persistence
    pub store: &'a PlanStore,
    /// Machine annotation/label mutations
    pub machines: &'a dyn MachineClient,
    /// The cluster being reconciled
    pub cluster: &'a TrellisCluster,
    /// Shared cluster join token
    pub token: &'a str,
    /// Current config generation stamped into every plan
    pub config_generation: i64,
}

/// One role tier to reconcile
pub struct TierSpec<'a> {
    /// Tier name used in status messages ("etcd", "control plane", ...)
    pub name: &'a str,
    /// Roles a machine must hold to belong to the tier
    pub roles: RoleSet,
    /// An empty tier is a waiting condition rather than trivially converged
    pub required: bool,
}

/// Compute the unavailability budget for a tier
///
/// `None` in, budget of 1. An absolute integer is used as-is; a percentage
/// is taken of the tier size and rounded up. A resolved budget of 0 means
/// unbounded, returned as `Ok(None)`.
pub fn concurrency_budget(
    value: Option<&IntOrString>,
    tier_size: usize,
) -> Result<Option<usize>, Error> {
    let count = match value {
        None => 1,
        Some(IntOrString::Int(i)) => {
            if *i < 0 {
                return Err(Error::invalid_concurrency(
                    i.to_string(),
                    "must not be negative",
                ));
            }
            *i as usize
        }
        Some(IntOrString::String(s)) => {
            if let Some(percent) = s.strip_suffix('%') {
                let percent: f64 = percent.trim().parse().map_err(|_| {
                    Error::invalid_concurrency(s.clone(), "not a valid percentage")
                })?;
                if !(0.0..=100.0).contains(&percent) {
                    return Err(Error::invalid_concurrency(
                        s.clone(),
                        "percentage out of range",
                    ));
                }
                (tier_size as f64 * percent / 100.0).ceil() as usize
            } else {
                s.parse::<usize>().map_err(|_| {
                    Error::invalid_concurrency(s.clone(), "not an integer or percentage")
                })?
            }
        }
    };

    Ok(if count == 0 { None } else { Some(count) })
}

fn is_unavailable(entry: &PlanEntry) -> bool {
    entry.node.as_ref().is_some_and(|n| !n.in_sync) || DrainCoordinator::is_draining(entry)
}

#[derive(Debug, Default)]
struct TierReport {
    ready: Vec<String>,
    out_of_sync: Vec<String>,
    reconciling: Vec<String>,
    draining: Vec<String>,
    uncordoned: Vec<String>,
    err_machines: Vec<String>,
    non_ready: Vec<String>,
}

impl TierReport {
    fn into_result(self) -> Result<(), Error> {
        let mut waiting = Vec::new();
        if !self.out_of_sync.is_empty() {
            waiting.push(format!(
                "plan to be applied on machine(s) {}",
                detail_names(&self.out_of_sync)
            ));
        }
        if !self.draining.is_empty() {
            waiting.push(format!(
                "machine(s) {} to drain",
                detail_names(&self.draining)
            ));
        }
        if !self.uncordoned.is_empty() {
            waiting.push(format!(
                "machine(s) {} to uncordon",
                detail_names(&self.uncordoned)
            ));
        }
        if !self.reconciling.is_empty() {
            waiting.push(format!(
                "an unavailability slot to reconcile machine(s) {}",
                detail_names(&self.reconciling)
            ));
        }
        if !waiting.is_empty() {
            return Err(Error::waiting(waiting.join("; ")));
        }

        // Nothing blocks; broken machines surface through the non-blocking
        // path so later tiers still reconcile.
        if !self.err_machines.is_empty() {
            return Err(Error::ignorable(
                detail_names(&self.err_machines),
                "plan failed too many times",
            ));
        }
        if !self.non_ready.is_empty() {
            return Err(Error::ignorable(
                detail_names(&self.non_ready),
                "node not registered",
            ));
        }

        Ok(())
    }
}

/// Reconcile one role tier
///
/// Returns `Ok(())` once every member is in sync, uncordoned, and has a
/// registered node; a waiting error while the rollout progresses; or an
/// ignorable error when only broken machines remain.
pub async fn reconcile_tier(
    ctx: &TierContext<'_>,
    plan: &mut Plan,
    tier: &TierSpec<'_>,
    exclude: impl Fn(&PlanEntry) -> bool,
    max_unavailable: Option<&IntOrString>,
    join_server: Option<&str>,
    drain_options: &DrainOptions,
) -> Result<(), Error> {
    let cluster_size = plan.len();
    let members: Vec<String> = plan
        .entries
        .values()
        .filter(|e| e.machine.roles.contains(tier.roles))
        .filter(|e| !e.machine.deleting)
        .filter(|e| !exclude(e))
        .map(|e| e.name().to_string())
        .collect();

    if members.is_empty() {
        if tier.required {
            return Err(Error::waiting(format!(
                "at least one {} machine",
                tier.name
            )));
        }
        return Ok(());
    }

    let budget = concurrency_budget(max_unavailable, members.len())?;
    let mut unavailable = members
        .iter()
        .filter(|name| is_unavailable(&plan.entries[name.as_str()]))
        .count();

    debug!(
        tier = %tier.name,
        members = members.len(),
        budget = ?budget,
        unavailable,
        "reconciling tier"
    );

    let coordinator = DrainCoordinator::new(ctx.machines, cluster_size);
    let input = PlanInput {
        cluster: ctx.cluster,
        token: ctx.token,
        join_server,
        config_generation: ctx.config_generation,
    };
    let mut report = TierReport::default();

    for name in &members {
        let entry = plan.entries[name].clone();

        if entry.failed() {
            report.err_machines.push(name.clone());
            continue;
        }

        let desired = generate::desired_plan(&input, &entry.machine)?;

        let Some(node) = &entry.node else {
            // First plan for this machine; no drain, no budget.
            ctx.store
                .update_plan(
                    plan.entries.get_mut(name).unwrap(),
                    &desired,
                    DEFAULT_MAX_FAILURES,
                )
                .await?;
            report.out_of_sync.push(name.clone());
            continue;
        };

        match NodePlan::classify_change(&node.plan, &desired) {
            PlanChange::None if !node.in_sync => {
                report.out_of_sync.push(name.clone());
            }
            PlanChange::None => {
                if DrainCoordinator::is_draining(&entry) {
                    if coordinator.uncordon(&entry, drain_options).await? {
                        report.ready.push(name.clone());
                    } else {
                        report.uncordoned.push(name.clone());
                    }
                } else if entry.machine.node_ref.is_none() {
                    report.non_ready.push(name.clone());
                } else {
                    report.ready.push(name.clone());
                }
            }
            PlanChange::Minor => {
                ctx.store
                    .update_plan(
                        plan.entries.get_mut(name).unwrap(),
                        &desired,
                        DEFAULT_MAX_FAILURES,
                    )
                    .await?;
                report.out_of_sync.push(name.clone());
            }
            PlanChange::Major => {
                let already_draining = DrainCoordinator::is_draining(&entry);
                let permitted = already_draining
                    || budget.is_none()
                    || unavailable < budget.unwrap_or(usize::MAX);

                if !permitted {
                    report.reconciling.push(name.clone());
                    continue;
                }

                if !already_draining && !is_unavailable(&entry) {
                    unavailable += 1;
                }

                if coordinator.drain(&entry, drain_options).await? {
                    ctx.store
                        .update_plan(
                            plan.entries.get_mut(name).unwrap(),
                            &desired,
                            DEFAULT_MAX_FAILURES,
                        )
                        .await?;
                }
                report.draining.push(name.clone());
            }
        }
    }

    report.into_result()
}
