//! Certificate rotation
//!
//! One-shot operation: when the rotation generation moves, every
//! etcd/control-plane machine gets a stop, `certificate rotate`, start
//! instruction sequence prepended to its plan, with no concurrency limit:
//! certificates are rotated everywhere at once or the cluster ends up with
//! a split trust horizon. The generation is recorded on assignment; there is
//! no intermediate phase because the operation is atomic per machine.

use tracing::info;

use crate::crd::{Runtime, TrellisCluster, TrellisClusterStatus};
use crate::planner::generate::{self, PlanInput};
use crate::planner::plan::OneTimeInstruction;
use crate::planner::store::{Plan, PlanStore, DEFAULT_MAX_FAILURES};
use crate::Error;

/// True when a rotation must run on this pass
///
/// Rotation requires an initialized control plane, a generation the status
/// has not recorded yet, and something to rotate (services or the CA).
pub fn should_rotate(cluster: &TrellisCluster, status: &TrellisClusterStatus) -> bool {
    let Some(rotate) = &cluster.spec.rotate_certificates else {
        return false;
    };
    status.initialized
        && rotate.generation != status.certificate_rotation_generation
        && (!rotate.services.is_empty() || rotate.ca_certificates)
}

/// The rotation instruction sequence for one server machine
fn rotation_instructions(runtime: Runtime, services: &[String], ca: bool) -> Vec<OneTimeInstruction> {
    let unit = runtime.server_unit();
    let mut instructions = vec![OneTimeInstruction {
        name: "stop-service".to_string(),
        command: "systemctl".to_string(),
        args: vec!["stop".to_string(), unit.to_string()],
        ..Default::default()
    }];

    if ca {
        // CA rotation re-issues everything; per-service selection is moot.
        instructions.push(OneTimeInstruction {
            name: "certificate-rotate".to_string(),
            command: runtime.binary().to_string(),
            args: vec!["certificate".to_string(), "rotate".to_string()],
            save_output: true,
            ..Default::default()
        });
    } else {
        for service in services {
            instructions.push(OneTimeInstruction {
                name: format!("certificate-rotate-{service}"),
                command: runtime.binary().to_string(),
                args: vec![
                    "certificate".to_string(),
                    "rotate".to_string(),
                    "-s".to_string(),
                    service.clone(),
                ],
                save_output: true,
                ..Default::default()
            });
        }
    }

    instructions.push(OneTimeInstruction {
        name: "start-service".to_string(),
        command: "systemctl".to_string(),
        args: vec!["start".to_string(), unit.to_string()],
        ..Default::default()
    });
    instructions
}

/// Assign the rotation sequence and record the generation
///
/// Returns `true` when the pass mutated plans (caller reports "rotating
/// certificates" and re-enters), `false` when there is nothing to do.
pub async fn rotate_certificates(
    store: &PlanStore,
    cluster: &TrellisCluster,
    plan: &mut Plan,
    status: &mut TrellisClusterStatus,
    token: &str,
    join_server: Option<&str>,
) -> Result<bool, Error> {
    if !should_rotate(cluster, status) {
        return Ok(false);
    }
    let rotate = cluster.spec.rotate_certificates.as_ref().unwrap();

    info!(
        generation = rotate.generation,
        services = ?rotate.services,
        ca = rotate.ca_certificates,
        "rotating certificates"
    );

    let runtime = cluster.spec.kubernetes.runtime;
    let extra = rotation_instructions(runtime, &rotate.services, rotate.ca_certificates);

    let servers: Vec<String> = plan
        .entries
        .values()
        .filter(|e| e.machine.roles.is_server() && !e.machine.deleting)
        .map(|e| e.name().to_string())
        .collect();

    for name in &servers {
        let entry = plan.entries.get_mut(name).unwrap();
        let input = PlanInput {
            cluster,
            token,
            join_server: if entry.machine.is_init_node() {
                None
            } else {
                join_server
            },
            config_generation: status.config_generation,
        };

        let mut desired = generate::desired_plan(&input, &entry.machine)?;
        let mut instructions = extra.clone();
        instructions.append(&mut desired.instructions);
        desired.instructions = instructions;

        // One write per machine per generation; re-entry with the recorded
        // generation never reaches this point.
        store
            .update_plan(entry, &desired, DEFAULT_MAX_FAILURES)
            .await?;
    }

    status.certificate_rotation_generation = rotate.generation;
    Ok(true)
}
