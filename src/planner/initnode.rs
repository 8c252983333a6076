//! Init-node election
//!
//! Exactly one etcd-role machine carries the init-node mark: it bootstraps
//! the etcd cluster and every other machine joins through it. Election runs
//! on every pass and is self-healing: duplicate or stale marks are cleared
//! and re-elected rather than trusted.
//!
//! Label mutations return [`Election::Retry`], an explicit re-entrant step
//! result: the caller reloads the machine view and re-runs the election
//! instead of proceeding with a stale cache.

use tracing::{info, warn};

use crate::crd::TrellisCluster;
use crate::machine::{MachineClient, RoleSet, INIT_NODE_LABEL, MACHINE_ID_LABEL};
use crate::planner::store::{Plan, PlanEntry};
use crate::Error;

/// Outcome of one election pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Election {
    /// Labels were mutated; reload machines and re-run before trusting the
    /// view
    Retry,
    /// A single settled init node
    Settled {
        /// The init node's machine name
        machine: String,
        /// Its join URL, once the agent has published one
        join_url: Option<String>,
    },
}

fn eligible(entry: &PlanEntry) -> bool {
    entry.machine.roles.contains(RoleSet::ETCD)
        && !entry.machine.deleting
        && entry.machine.infra_ready
        && !entry.failed()
}

async fn clear_mark(machines: &dyn MachineClient, entry: &PlanEntry) -> Result<(), Error> {
    info!(machine = %entry.name(), "clearing init-node mark");
    machines
        .set_label(&entry.machine, INIT_NODE_LABEL, None)
        .await
}

async fn set_mark(machines: &dyn MachineClient, entry: &PlanEntry) -> Result<(), Error> {
    info!(machine = %entry.name(), "promoting init node");
    machines
        .set_label(&entry.machine, INIT_NODE_LABEL, Some("true".to_string()))
        .await
}

/// Elect or re-affirm the cluster's init node
///
/// Rules, in order: a pinned machine-id wins unconditionally; a single
/// eligible incumbent with a join URL is kept; an incumbent without a join
/// URL yields to a candidate that has one (by re-election, never a silent
/// switch); with no incumbent, the first eligible candidate with a join URL
/// is promoted (name order breaks ties), falling back to a provisional
/// promotion when no join URL exists anywhere yet.
pub async fn elect_init_node(
    cluster: &TrellisCluster,
    plan: &Plan,
    machines: &dyn MachineClient,
) -> Result<Election, Error> {
    let marked: Vec<&PlanEntry> = plan
        .entries
        .values()
        .filter(|e| e.machine.is_init_node())
        .collect();

    // Rule 1: a pinned machine-id forces that exact machine.
    if let Some(want_id) = cluster.spec.init_node_machine_id.as_deref() {
        let target = plan.entries.values().find(|e| {
            e.machine.labels.get(MACHINE_ID_LABEL).map(String::as_str) == Some(want_id)
        });
        let Some(target) = target else {
            return Err(Error::waiting(format!(
                "machine with machine-id {want_id} to exist for pinned init node"
            )));
        };

        let mut mutated = false;
        for entry in &marked {
            if entry.name() != target.name() {
                clear_mark(machines, entry).await?;
                mutated = true;
            }
        }
        if !target.machine.is_init_node() {
            set_mark(machines, target).await?;
            mutated = true;
        }
        if mutated {
            return Ok(Election::Retry);
        }
        return Ok(Election::Settled {
            machine: target.name().to_string(),
            join_url: target.machine.join_url().map(str::to_string),
        });
    }

    // Multiple marks are an unresolved state, never a silent pick.
    if marked.len() > 1 {
        warn!(count = marked.len(), "multiple init nodes marked, forcing re-election");
        for entry in &marked {
            clear_mark(machines, entry).await?;
        }
        return Ok(Election::Retry);
    }

    // Rules 2 and 3: keep a healthy incumbent, yield to a better candidate.
    if let Some(current) = marked.first() {
        if !eligible(current) {
            clear_mark(machines, current).await?;
            return Ok(Election::Retry);
        }

        if let Some(url) = current.machine.join_url() {
            return Ok(Election::Settled {
                machine: current.name().to_string(),
                join_url: Some(url.to_string()),
            });
        }

        let better_exists = plan
            .entries
            .values()
            .any(|e| e.name() != current.name() && eligible(e) && e.machine.join_url().is_some());
        if better_exists {
            info!(machine = %current.name(), "incumbent has no join URL but an alternative does, re-electing");
            clear_mark(machines, current).await?;
            return Ok(Election::Retry);
        }

        // Nobody is better; keep waiting on the incumbent's agent.
        return Ok(Election::Settled {
            machine: current.name().to_string(),
            join_url: None,
        });
    }

    // Rule 4: no incumbent. Promote the first eligible candidate with a
    // join URL (entries iterate in name order), else the first eligible one.
    let candidates: Vec<&PlanEntry> = plan.entries.values().filter(|e| eligible(e)).collect();
    let promoted = candidates
        .iter()
        .find(|e| e.machine.join_url().is_some())
        .or_else(|| candidates.first());

    match promoted {
        Some(entry) => {
            set_mark(machines, entry).await?;
            Ok(Election::Retry)
        }
        None => Err(Error::waiting(
            "at least one eligible etcd machine for init-node election",
        )),
    }
}
