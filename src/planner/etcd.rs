//! ETCD snapshot create and restore
//!
//! Two independent phase machines layered on the plan store.
//!
//! Create (`Started -> Finished`) assigns a one-time `etcd-snapshot save`
//! instruction to one etcd machine and waits for the agent. The request
//! block is compared by deep equality: any change restarts the sequence,
//! an unchanged block after `Finished` is a no-op.
//!
//! Restore (`Started -> Shutdown -> Restore -> Finished`) stops the runtime
//! everywhere, re-designates the init node (pinned for local snapshots,
//! freely elected for S3), runs `server --cluster-reset` on it, and finally
//! bumps the cluster's config generation so every machine re-provisions
//! against the restored datastore. `Finished` is terminal and idempotent.

use tracing::{info, warn};

use crate::crd::{
    Runtime, S3Config, SnapshotCreatePhase, SnapshotRestorePhase, TrellisCluster,
    TrellisClusterStatus,
};
use crate::machine::{MachineClient, RoleSet, INIT_NODE_LABEL};
use crate::planner::generate::{self, PlanInput};
use crate::planner::plan::{NodePlan, OneTimeInstruction, PlanFile};
use crate::planner::store::{Plan, PlanEntry, PlanStore, DEFAULT_MAX_FAILURES};
use crate::planner::token::ClusterSecrets;
use crate::Error;

fn tombstone_path(runtime: Runtime) -> String {
    format!("{}/server/db/etcd/tombstone", runtime.data_dir())
}

fn eligible_etcd(entry: &PlanEntry) -> bool {
    entry.machine.roles.contains(RoleSet::ETCD)
        && !entry.machine.deleting
        && entry.machine.infra_ready
        && !entry.failed()
}

/// Flags shared by snapshot save and restore when S3 is configured
fn s3_args(s3: &S3Config) -> Vec<String> {
    let mut args = vec!["--s3".to_string(), format!("--s3-bucket={}", s3.bucket)];
    if let Some(endpoint) = &s3.endpoint {
        args.push(format!("--s3-endpoint={endpoint}"));
    }
    if let Some(region) = &s3.region {
        args.push(format!("--s3-region={region}"));
    }
    if let Some(folder) = &s3.folder {
        args.push(format!("--s3-folder={folder}"));
    }
    if s3.skip_ssl_verify {
        args.push("--s3-skip-ssl-verify".to_string());
    }
    args
}

/// Resolve S3 credential env and the optional endpoint CA file
async fn s3_material(
    secrets: &dyn ClusterSecrets,
    namespace: &str,
    runtime: Runtime,
    s3: &S3Config,
) -> Result<(Vec<String>, Vec<String>, Vec<PlanFile>), Error> {
    let mut env = Vec::new();
    let mut args = s3_args(s3);
    let mut files = Vec::new();

    if let Some(secret_name) = &s3.cloud_credential_secret {
        let creds = secrets.s3_credentials(namespace, secret_name).await?;
        env.push(format!("AWS_ACCESS_KEY_ID={}", creds.access_key));
        env.push(format!("AWS_SECRET_ACCESS_KEY={}", creds.secret_key));
    }

    if let Some(ca) = &s3.endpoint_ca {
        let path = format!("{}/etcd-snapshot-s3-ca.pem", runtime.config_dir());
        files.push(PlanFile::new(path.clone(), ca.as_bytes()).permissions("0600"));
        args.push(format!("--s3-endpoint-ca={path}"));
    }

    Ok((args, env, files))
}

/// Advance snapshot creation by at most one phase
///
/// Returns `Ok(true)` when status transitioned, `Ok(false)` when idle, and
/// a waiting error while the snapshot instruction is in flight.
pub async fn snapshot_create(
    store: &PlanStore,
    secrets: &dyn ClusterSecrets,
    cluster: &TrellisCluster,
    plan: &mut Plan,
    status: &mut TrellisClusterStatus,
    token: &str,
    join_server: Option<&str>,
) -> Result<bool, Error> {
    let Some(request) = &cluster.spec.etcd_snapshot_create else {
        return Ok(false);
    };

    // Deep inequality of the request block restarts the sequence.
    if status.etcd_snapshot_create.as_ref() != Some(request) {
        info!(generation = request.generation, "starting etcd snapshot");
        status.etcd_snapshot_create = Some(request.clone());
        status.etcd_snapshot_create_phase = Some(SnapshotCreatePhase::Started);
        return Ok(true);
    }

    match status.etcd_snapshot_create_phase {
        Some(SnapshotCreatePhase::Finished) => return Ok(false),
        Some(SnapshotCreatePhase::Unknown) | None => {
            status.etcd_snapshot_create_phase = Some(SnapshotCreatePhase::Started);
            return Ok(true);
        }
        Some(SnapshotCreatePhase::Started) => {}
    }

    // A named node wins; otherwise the first eligible etcd machine.
    let target = match &request.node_name {
        Some(node_name) => plan
            .entries
            .values()
            .find(|e| e.machine.node_name() == Some(node_name.as_str()))
            .map(|e| e.name().to_string()),
        None => plan
            .entries
            .values()
            .find(|e| eligible_etcd(e))
            .map(|e| e.name().to_string()),
    };
    let Some(target) = target else {
        return Err(Error::waiting("an eligible etcd machine for the snapshot"));
    };

    let runtime = cluster.spec.kubernetes.runtime;
    let namespace = plan.entries[&target].machine.namespace.clone();

    let mut args = vec!["etcd-snapshot".to_string(), "save".to_string()];
    if let Some(name) = &request.name {
        args.push(format!("--name={name}"));
    }
    if let Some(node_name) = &request.node_name {
        args.push(format!("--node-name={node_name}"));
    }

    let mut env = Vec::new();
    let mut extra_files = Vec::new();
    if let Some(s3) = &request.s3 {
        let (s3_flags, s3_env, s3_files) = s3_material(secrets, &namespace, runtime, s3).await?;
        args.extend(s3_flags);
        env = s3_env;
        extra_files = s3_files;
    }

    let input = PlanInput {
        cluster,
        token,
        join_server: if plan.entries[&target].machine.is_init_node() {
            None
        } else {
            join_server
        },
        config_generation: status.config_generation,
    };
    let mut desired = generate::desired_plan(&input, &plan.entries[&target].machine)?;
    desired.files.extend(extra_files);
    desired.instructions.push(OneTimeInstruction {
        name: "etcd-snapshot".to_string(),
        command: runtime.binary().to_string(),
        args,
        env,
        save_output: true,
        ..Default::default()
    });

    let entry = plan.entries.get_mut(&target).unwrap();
    if store
        .ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES)
        .await?
        || !entry.in_sync()
    {
        return Err(Error::waiting(format!(
            "etcd snapshot to be taken on machine {target}"
        )));
    }

    info!(machine = %target, "etcd snapshot finished");
    status.etcd_snapshot_create_phase = Some(SnapshotCreatePhase::Finished);
    Ok(true)
}

/// The stop-everything plan assigned during restore shutdown
fn shutdown_plan(runtime: Runtime, roles: RoleSet) -> NodePlan {
    let mut files = Vec::new();
    if roles.contains(RoleSet::ETCD) {
        // The tombstone tells the runtime its datastore is defunct; the
        // restore instruction clears it on the node that keeps its data.
        files.push(PlanFile::new(tombstone_path(runtime), b"true"));
    }

    NodePlan {
        instructions: vec![
            OneTimeInstruction {
                name: "shutdown".to_string(),
                command: "systemctl".to_string(),
                args: vec![
                    "stop".to_string(),
                    runtime.unit(roles.is_server()).to_string(),
                ],
                ..Default::default()
            },
            OneTimeInstruction {
                name: "kill-all".to_string(),
                command: runtime.killall().to_string(),
                ..Default::default()
            },
        ],
        files,
        ..Default::default()
    }
}

/// Advance snapshot restore by at most one phase
pub async fn snapshot_restore(
    store: &PlanStore,
    machines: &dyn MachineClient,
    secrets: &dyn ClusterSecrets,
    cluster: &TrellisCluster,
    plan: &mut Plan,
    status: &mut TrellisClusterStatus,
) -> Result<bool, Error> {
    let Some(request) = &cluster.spec.etcd_snapshot_restore else {
        return Ok(false);
    };

    if request.generation != status.etcd_snapshot_restore_generation {
        info!(
            generation = request.generation,
            snapshot = %request.name,
            "starting etcd snapshot restore"
        );
        status.etcd_snapshot_restore_generation = request.generation;
        status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Started);
        return Ok(true);
    }

    let runtime = cluster.spec.kubernetes.runtime;
    match status
        .etcd_snapshot_restore_phase
        .unwrap_or(SnapshotRestorePhase::Started)
    {
        SnapshotRestorePhase::Finished => Ok(false),

        SnapshotRestorePhase::Unknown => {
            status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Started);
            Ok(true)
        }

        SnapshotRestorePhase::Started => {
            status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Shutdown);
            Ok(true)
        }

        SnapshotRestorePhase::Shutdown => {
            let servers: Vec<String> = plan
                .entries
                .values()
                .filter(|e| e.machine.roles.is_server() && !e.machine.deleting)
                .map(|e| e.name().to_string())
                .collect();

            let mut pending = Vec::new();
            for name in &servers {
                let desired = shutdown_plan(runtime, plan.entries[name].machine.roles);
                let entry = plan.entries.get_mut(name).unwrap();
                if store
                    .ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES)
                    .await?
                    || !entry.in_sync()
                {
                    pending.push(name.clone());
                }
            }

            if !pending.is_empty() {
                return Err(Error::waiting(format!(
                    "machine(s) {} to shut down for restore",
                    crate::machine::detail_names(&pending)
                )));
            }

            status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Restore);
            Ok(true)
        }

        SnapshotRestorePhase::Restore => {
            // Local restores are pinned to the node holding the snapshot;
            // S3 restores keep the current init node or elect the first
            // eligible machine.
            let target = if request.s3.is_none() {
                let node_name = request.node_name.as_deref().ok_or_else(|| {
                    Error::validation("local snapshot restore requires nodeName")
                })?;
                plan.entries
                    .values()
                    .find(|e| e.machine.node_name() == Some(node_name))
                    .map(|e| e.name().to_string())
                    .ok_or_else(|| {
                        Error::waiting(format!("machine for restore node {node_name} to exist"))
                    })?
            } else {
                plan.init_node()
                    .filter(|e| eligible_etcd(e))
                    .or_else(|| plan.entries.values().find(|e| eligible_etcd(e)))
                    .map(|e| e.name().to_string())
                    .ok_or_else(|| {
                        Error::waiting("an eligible etcd machine for the restore")
                    })?
            };

            // Re-designate the init node before resetting; every stale mark
            // is cleared first so the join topology is unambiguous.
            let mut mutated = false;
            let stale: Vec<String> = plan
                .entries
                .values()
                .filter(|e| e.machine.is_init_node() && e.name() != target)
                .map(|e| e.name().to_string())
                .collect();
            for name in &stale {
                warn!(machine = %name, "clearing stale init-node mark for restore");
                machines
                    .set_label(&plan.entries[name].machine, INIT_NODE_LABEL, None)
                    .await?;
                mutated = true;
            }
            if !plan.entries[&target].machine.is_init_node() {
                machines
                    .set_label(
                        &plan.entries[&target].machine,
                        INIT_NODE_LABEL,
                        Some("true".to_string()),
                    )
                    .await?;
                mutated = true;
            }
            if mutated {
                return Err(Error::waiting("init node re-designation for restore"));
            }

            let mut args = vec![
                "server".to_string(),
                "--cluster-reset".to_string(),
                format!("--cluster-reset-restore-path={}", request.name),
            ];
            let mut env = Vec::new();
            let mut files = Vec::new();
            if let Some(s3) = &request.s3 {
                let namespace = plan.entries[&target].machine.namespace.clone();
                let (s3_flags, s3_env, s3_files) =
                    s3_material(secrets, &namespace, runtime, s3).await?;
                args.extend(s3_flags);
                env = s3_env;
                files = s3_files;
            }

            let desired = NodePlan {
                instructions: vec![
                    OneTimeInstruction {
                        name: "remove-tombstone".to_string(),
                        command: "rm".to_string(),
                        args: vec!["-f".to_string(), tombstone_path(runtime)],
                        ..Default::default()
                    },
                    OneTimeInstruction {
                        name: "cluster-reset".to_string(),
                        command: runtime.binary().to_string(),
                        args,
                        env,
                        save_output: true,
                        ..Default::default()
                    },
                ],
                files,
                ..Default::default()
            };

            let entry = plan.entries.get_mut(&target).unwrap();
            if store
                .ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES)
                .await?
                || !entry.in_sync()
            {
                return Err(Error::waiting(format!(
                    "cluster reset to complete on machine {target}"
                )));
            }

            info!(machine = %target, "snapshot restore complete, forcing full re-provision");
            status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Finished);
            status.config_generation += 1;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdSnapshotCreate, EtcdSnapshotRestore};
    use crate::planner::fixtures::{
        FixtureCluster, FixtureSecrets, MachineOp, RecordingMachineClient,
    };

    // =========================================================================
    // Snapshot Create Stories
    // =========================================================================

    /// Story: a snapshot request targets the named node and finishes
    #[tokio::test]
    async fn story_create_targets_named_node() {
        let mut fx = FixtureCluster::new();
        fx.add_server("etcd-a");
        fx.add_server("etcd-b");
        fx.set_node_ref("etcd-b", "node-b");
        fx.converge_all().await;
        fx.snapshot_create(EtcdSnapshotCreate {
            generation: 1,
            name: Some("pre-upgrade".to_string()),
            node_name: Some("node-b".to_string()),
            s3: None,
        });

        let secrets = FixtureSecrets;
        let mut status = TrellisClusterStatus::default();

        // First pass records the request and enters Started.
        let mut plan = fx.load_plan().await;
        assert!(snapshot_create(
            fx.store(), &secrets, &fx.cluster(), &mut plan, &mut status, fx.token(), Some("https://init:9345")
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_create_phase,
            Some(SnapshotCreatePhase::Started)
        );

        // Second pass assigns the instruction to etcd-b and waits.
        let mut plan = fx.load_plan().await;
        let err = snapshot_create(
            fx.store(), &secrets, &fx.cluster(), &mut plan, &mut status, fx.token(), Some("https://init:9345")
        )
        .await
        .unwrap_err();
        assert!(err.is_waiting());

        let node = plan.entries["etcd-b"].node.as_ref().unwrap();
        let snapshot = node
            .plan
            .instructions
            .iter()
            .find(|i| i.name == "etcd-snapshot")
            .expect("snapshot instruction assigned");
        assert!(snapshot.args.contains(&"--name=pre-upgrade".to_string()));
        assert!(snapshot.args.contains(&"--node-name=node-b".to_string()));
        assert!(plan.entries["etcd-a"]
            .node
            .as_ref()
            .unwrap()
            .plan
            .instructions
            .iter()
            .all(|i| i.name != "etcd-snapshot"));

        // Agent applies; the machine advances to Finished.
        fx.agent_apply("etcd-b");
        let mut plan = fx.load_plan().await;
        assert!(snapshot_create(
            fx.store(), &secrets, &fx.cluster(), &mut plan, &mut status, fx.token(), Some("https://init:9345")
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_create_phase,
            Some(SnapshotCreatePhase::Finished)
        );

        // Unchanged request after Finished is a no-op.
        let mut plan = fx.load_plan().await;
        assert!(!snapshot_create(
            fx.store(), &secrets, &fx.cluster(), &mut plan, &mut status, fx.token(), Some("https://init:9345")
        )
        .await
        .unwrap());
    }

    /// Story: any change to the request block restarts from Started
    #[tokio::test]
    async fn story_create_restarts_on_deep_change() {
        let mut fx = FixtureCluster::new();
        fx.add_server("etcd-a");
        fx.converge_all().await;

        let request = EtcdSnapshotCreate {
            generation: 1,
            name: Some("nightly".to_string()),
            node_name: None,
            s3: None,
        };
        fx.snapshot_create(request.clone());

        let secrets = FixtureSecrets;
        let mut status = TrellisClusterStatus {
            etcd_snapshot_create: Some(request),
            etcd_snapshot_create_phase: Some(SnapshotCreatePhase::Finished),
            ..Default::default()
        };

        // Same generation, different name: deep inequality restarts.
        fx.snapshot_create(EtcdSnapshotCreate {
            generation: 1,
            name: Some("nightly-2".to_string()),
            node_name: None,
            s3: None,
        });
        let mut plan = fx.load_plan().await;
        assert!(snapshot_create(
            fx.store(), &secrets, &fx.cluster(), &mut plan, &mut status, fx.token(), Some("https://init:9345")
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_create_phase,
            Some(SnapshotCreatePhase::Started)
        );
    }

    // =========================================================================
    // Snapshot Restore Stories
    // =========================================================================

    fn restore_status() -> TrellisClusterStatus {
        TrellisClusterStatus {
            etcd_snapshot_restore_generation: 1,
            ..Default::default()
        }
    }

    /// Story: restore walks Started -> Shutdown -> Restore -> Finished
    ///
    /// A local restore pinned to node-b: every server shuts down, stale init
    /// marks move to node-b's machine, cluster-reset runs there, and the
    /// config generation bump forces a full re-provision.
    #[tokio::test]
    async fn story_restore_full_walkthrough() {
        let mut fx = FixtureCluster::new();
        fx.add_server("etcd-a");
        fx.add_server("etcd-b");
        fx.add_worker("worker-0");
        fx.make_init("etcd-a", "https://a:9345");
        fx.set_node_ref("etcd-b", "node-b");
        fx.converge_all().await;
        fx.snapshot_restore(EtcdSnapshotRestore {
            generation: 1,
            name: "on-demand-001".to_string(),
            node_name: Some("node-b".to_string()),
            s3: None,
        });

        let secrets = FixtureSecrets;
        let machines = RecordingMachineClient::new();
        let mut status = restore_status();
        status.etcd_snapshot_restore_phase = Some(SnapshotRestorePhase::Started);

        // Started -> Shutdown.
        let mut plan = fx.load_plan().await;
        assert!(snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_restore_phase,
            Some(SnapshotRestorePhase::Shutdown)
        );

        // Shutdown assigns stop/kill plans to the two servers, not the
        // worker, and waits for them.
        let mut plan = fx.load_plan().await;
        let err = snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap_err();
        assert!(err.is_waiting());
        let shutdown = &plan.entries["etcd-a"].node.as_ref().unwrap().plan;
        assert!(shutdown.instructions.iter().any(|i| i.name == "kill-all"));
        assert!(shutdown.files.iter().any(|f| f.path.ends_with("tombstone")));
        assert!(shutdown.probes.is_empty(), "no probes while shut down");
        let worker_plan = &plan.entries["worker-0"].node.as_ref().unwrap().plan;
        assert!(worker_plan.instructions.iter().all(|i| i.name != "kill-all"));

        fx.agent_apply("etcd-a");
        fx.agent_apply("etcd-b");
        let mut plan = fx.load_plan().await;
        assert!(snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_restore_phase,
            Some(SnapshotRestorePhase::Restore)
        );

        // Restore re-pins the init node onto etcd-b: the stale mark on
        // etcd-a is cleared and etcd-b is marked, then the pass waits.
        let machines = RecordingMachineClient::new();
        let mut plan = fx.load_plan().await;
        let err = snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap_err();
        assert!(err.is_waiting());
        assert_eq!(
            machines.ops(),
            vec![
                MachineOp::Label {
                    machine: "etcd-a".to_string(),
                    key: INIT_NODE_LABEL.to_string(),
                    value: None,
                },
                MachineOp::Label {
                    machine: "etcd-b".to_string(),
                    key: INIT_NODE_LABEL.to_string(),
                    value: Some("true".to_string()),
                },
            ]
        );

        // With the mark moved, cluster-reset is assigned to etcd-b.
        fx.clear_init("etcd-a");
        fx.make_init("etcd-b", "https://b:9345");
        let machines = RecordingMachineClient::new();
        let mut plan = fx.load_plan().await;
        let err = snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap_err();
        assert!(err.is_waiting());
        let reset = &plan.entries["etcd-b"].node.as_ref().unwrap().plan;
        assert!(reset.instructions.iter().any(|i| {
            i.name == "cluster-reset"
                && i.args
                    .contains(&"--cluster-reset-restore-path=on-demand-001".to_string())
        }));
        assert!(reset
            .instructions
            .iter()
            .any(|i| i.name == "remove-tombstone"));

        // Agent completes the reset: Finished, config generation bumped.
        fx.agent_apply("etcd-b");
        let mut plan = fx.load_plan().await;
        assert!(snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap());
        assert_eq!(
            status.etcd_snapshot_restore_phase,
            Some(SnapshotRestorePhase::Finished)
        );
        assert_eq!(status.config_generation, 1);

        // Finished is terminal and idempotent.
        let mut plan = fx.load_plan().await;
        assert!(!snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap());
    }

    /// Story: a new generation restarts the restore sequence
    #[tokio::test]
    async fn story_restore_generation_gated() {
        let mut fx = FixtureCluster::new();
        fx.add_server("etcd-a");
        fx.set_node_ref("etcd-a", "node-a");
        fx.converge_all().await;
        fx.snapshot_restore(EtcdSnapshotRestore {
            generation: 2,
            name: "newer".to_string(),
            node_name: Some("node-a".to_string()),
            s3: None,
        });

        let secrets = FixtureSecrets;
        let machines = RecordingMachineClient::new();
        let mut status = TrellisClusterStatus {
            etcd_snapshot_restore_generation: 1,
            etcd_snapshot_restore_phase: Some(SnapshotRestorePhase::Finished),
            ..Default::default()
        };

        let mut plan = fx.load_plan().await;
        assert!(snapshot_restore(
            fx.store(), &machines, &secrets, &fx.cluster(), &mut plan, &mut status
        )
        .await
        .unwrap());
        assert_eq!(status.etcd_snapshot_restore_generation, 2);
        assert_eq!(
            status.etcd_snapshot_restore_phase,
            Some(SnapshotRestorePhase::Started)
        );
    }
}
