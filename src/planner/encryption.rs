//! Encryption-key rotation
//!
//! A distributed, multi-phase state machine driving the runtime's
//! `secrets-encrypt` workflow across the control plane:
//!
//! ```text
//! Start -> RestartLeader -> VerifyLeaderStatus -> RestartFollowers -> ApplyLeader
//!   ^                                                  |                  |
//!   +------------------- next increment / abort -------+------------------+
//! ```
//!
//! The leader is always the current init node. Each pass advances at most
//! one phase; every transition persists to status and re-enters, so the
//! machine survives duplicate and out-of-order events. The leader's current
//! rotation stage is read from the periodic `secrets-encrypt status` output
//! its agent captures; followers must self-report the same stage after a
//! restart or the whole sequence aborts back to `Start`.

use tracing::{info, warn};

use crate::crd::{EncryptionKeyRotationPhase as Phase, TrellisCluster, TrellisClusterStatus};
use crate::machine::{Machine, RoleSet};
use crate::planner::generate::{self, PlanInput, ENCRYPTION_STATUS_INSTRUCTION};
use crate::planner::plan::{NodePlan, OneTimeInstruction};
use crate::planner::store::{Plan, PlanEntry, PlanStore, DEFAULT_MAX_FAILURES};
use crate::Error;

/// Name prefix of one-time apply instructions ("secrets-encrypt-prepare"...)
const APPLY_INSTRUCTION_PREFIX: &str = "secrets-encrypt-";
/// Name prefix of tagged restart instructions
const RESTART_INSTRUCTION_PREFIX: &str = "encryption-restart-";

/// Rotation stage as reported by `secrets-encrypt status`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionStage {
    /// No rotation in progress
    Start,
    /// New key prepared
    Prepare,
    /// Keys rotated, old key retained
    Rotate,
    /// Re-encryption requested
    ReencryptRequest,
    /// Re-encryption running
    ReencryptActive,
    /// Re-encryption complete
    ReencryptFinished,
}

impl EncryptionStage {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "start" => Some(Self::Start),
            "prepare" => Some(Self::Prepare),
            "rotate" => Some(Self::Rotate),
            "reencrypt_request" => Some(Self::ReencryptRequest),
            "reencrypt_active" => Some(Self::ReencryptActive),
            "reencrypt_finished" => Some(Self::ReencryptFinished),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncryptionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Prepare => "prepare",
            Self::Rotate => "rotate",
            Self::ReencryptRequest => "reencrypt_request",
            Self::ReencryptActive => "reencrypt_active",
            Self::ReencryptFinished => "reencrypt_finished",
        };
        write!(f, "{s}")
    }
}

/// Parse the rotation stage out of captured `secrets-encrypt status` output
pub fn parse_status_output(stdout: &str) -> Option<EncryptionStage> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Current Rotation Stage" {
            EncryptionStage::parse(value.trim())
        } else {
            None
        }
    })
}

/// The next `secrets-encrypt` subcommand for one rotation increment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ApplyCommand {
    Prepare,
    Rotate,
    Reencrypt,
}

impl ApplyCommand {
    fn subcommand(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Rotate => "rotate",
            Self::Reencrypt => "reencrypt",
        }
    }

    fn from_instruction_name(name: &str) -> Option<Self> {
        match name.strip_prefix(APPLY_INSTRUCTION_PREFIX)? {
            "prepare" => Some(Self::Prepare),
            "rotate" => Some(Self::Rotate),
            "reencrypt" => Some(Self::Reencrypt),
            _ => None,
        }
    }

    /// Stages the runtime may legitimately report after this command applied
    fn expected_stages(self) -> &'static [EncryptionStage] {
        match self {
            Self::Prepare => &[EncryptionStage::Prepare],
            Self::Rotate => &[EncryptionStage::Rotate],
            Self::Reencrypt => &[
                EncryptionStage::ReencryptRequest,
                EncryptionStage::ReencryptActive,
                EncryptionStage::ReencryptFinished,
            ],
        }
    }
}

/// The command that advances the rotation from the given stage, if any
fn next_command(stage: EncryptionStage) -> Option<ApplyCommand> {
    match stage {
        EncryptionStage::Start | EncryptionStage::ReencryptFinished => Some(ApplyCommand::Prepare),
        EncryptionStage::Prepare => Some(ApplyCommand::Rotate),
        EncryptionStage::Rotate => Some(ApplyCommand::Reencrypt),
        // Re-encryption is in flight; nothing to issue until it settles.
        EncryptionStage::ReencryptRequest | EncryptionStage::ReencryptActive => None,
    }
}

fn stage_of(entry: &PlanEntry) -> Result<Option<EncryptionStage>, Error> {
    let Some(node) = &entry.node else {
        return Ok(None);
    };
    let Some(output) = node.periodic_output.get(ENCRYPTION_STATUS_INSTRUCTION) else {
        return Ok(None);
    };
    Ok(parse_status_output(&output.stdout_string()?))
}

fn restart_plan(
    input: &PlanInput<'_>,
    machine: &Machine,
    stage: EncryptionStage,
) -> Result<NodePlan, Error> {
    let runtime = input.cluster.spec.kubernetes.runtime;
    let mut plan = generate::desired_plan(input, machine)?;
    plan.instructions.push(OneTimeInstruction {
        name: format!("{RESTART_INSTRUCTION_PREFIX}{stage}"),
        command: "systemctl".to_string(),
        args: vec![
            "restart".to_string(),
            runtime.unit(machine.roles.is_server()).to_string(),
        ],
        // The runtime compares this against its own stage to self-detect
        // desync after out-of-band restarts.
        env: vec![format!("LAST_KNOWN_ENCRYPTION_STAGE={stage}")],
        ..Default::default()
    });
    Ok(plan)
}

fn apply_plan(
    input: &PlanInput<'_>,
    machine: &Machine,
    command: ApplyCommand,
) -> Result<NodePlan, Error> {
    let runtime = input.cluster.spec.kubernetes.runtime;
    let mut plan = generate::desired_plan(input, machine)?;
    plan.instructions.push(OneTimeInstruction {
        name: format!("{APPLY_INSTRUCTION_PREFIX}{}", command.subcommand()),
        command: runtime.binary().to_string(),
        args: vec![
            "secrets-encrypt".to_string(),
            command.subcommand().to_string(),
        ],
        save_output: true,
        ..Default::default()
    });
    Ok(plan)
}

/// Advance the encryption-key rotation by at most one phase
///
/// Returns `Ok(true)` when status transitioned (caller persists and
/// re-enters), `Ok(false)` when rotation is idle or complete for the current
/// generation, and a waiting error while a step is in flight.
pub async fn rotate_encryption_keys(
    store: &PlanStore,
    cluster: &TrellisCluster,
    plan: &mut Plan,
    status: &mut TrellisClusterStatus,
    token: &str,
    join_server: Option<&str>,
) -> Result<bool, Error> {
    let Some(request) = &cluster.spec.rotate_encryption_keys else {
        return Ok(false);
    };
    if !status.initialized {
        return Ok(false);
    }

    // A generation bump restarts the sequence cleanly from Start, no matter
    // where it was.
    if request.generation != status.rotate_encryption_keys_generation {
        info!(generation = request.generation, "starting encryption key rotation");
        status.rotate_encryption_keys_generation = request.generation;
        status.rotate_encryption_keys_phase = Phase::Start;
        return Ok(true);
    }

    match status.rotate_encryption_keys_phase {
        Phase::Done | Phase::Failed => return Ok(false),
        Phase::Unknown => {
            status.rotate_encryption_keys_phase = Phase::Start;
            return Ok(true);
        }
        _ => {}
    }

    let leader_name = plan
        .init_node()
        .map(|e| e.name().to_string())
        .ok_or_else(|| Error::waiting("an init node for encryption key rotation"))?;

    if plan.entries[&leader_name].failed() {
        warn!(leader = %leader_name, "leader failed during encryption key rotation");
        status.rotate_encryption_keys_phase = Phase::Failed;
        return Ok(true);
    }

    let leader_stage = stage_of(&plan.entries[&leader_name])?
        .ok_or_else(|| Error::waiting("leader encryption status to be reported"))?;

    let leader_input = PlanInput {
        cluster,
        token,
        join_server: None,
        config_generation: status.config_generation,
    };

    match status.rotate_encryption_keys_phase {
        Phase::Start => {
            status.rotate_encryption_keys_phase = Phase::RestartLeader;
            Ok(true)
        }

        Phase::RestartLeader => {
            let desired = restart_plan(&leader_input, &plan.entries[&leader_name].machine, leader_stage)?;
            let entry = plan.entries.get_mut(&leader_name).unwrap();
            if store.ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES).await? || !entry.in_sync() {
                return Err(Error::waiting("leader to restart for encryption key rotation"));
            }
            status.rotate_encryption_keys_phase = Phase::VerifyLeaderStatus;
            Ok(true)
        }

        Phase::VerifyLeaderStatus => {
            // The stage was re-read fresh above; that is the verification.
            status.rotate_encryption_keys_phase = Phase::RestartFollowers;
            Ok(true)
        }

        Phase::RestartFollowers => {
            let followers: Vec<String> = plan
                .entries
                .values()
                .filter(|e| {
                    e.machine.roles.contains(RoleSet::CONTROL_PLANE)
                        && !e.machine.is_init_node()
                        && !e.machine.deleting
                })
                .map(|e| e.name().to_string())
                .collect();

            let follower_input = PlanInput {
                cluster,
                token,
                join_server,
                config_generation: status.config_generation,
            };

            for name in &followers {
                let desired =
                    restart_plan(&follower_input, &plan.entries[name].machine, leader_stage)?;
                let entry = plan.entries.get_mut(name).unwrap();
                if store.ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES).await? || !entry.in_sync() {
                    return Err(Error::waiting("followers to restart for encryption key rotation"));
                }
            }

            for name in &followers {
                let stage = stage_of(&plan.entries[name])?
                    .ok_or_else(|| Error::waiting("follower encryption status to be reported"))?;
                if stage != leader_stage {
                    // A diverged follower invalidates the whole increment.
                    warn!(
                        follower = %name,
                        follower_stage = %stage,
                        leader_stage = %leader_stage,
                        "encryption stage mismatch, restarting rotation sequence"
                    );
                    status.rotate_encryption_keys_phase = Phase::Start;
                    return Ok(true);
                }
            }

            if leader_stage == EncryptionStage::ReencryptFinished {
                info!("encryption key rotation complete");
                status.rotate_encryption_keys_phase = Phase::Done;
            } else {
                status.rotate_encryption_keys_phase = Phase::ApplyLeader;
            }
            Ok(true)
        }

        Phase::ApplyLeader => {
            let pending = plan.entries[&leader_name]
                .node
                .as_ref()
                .and_then(|n| {
                    n.plan
                        .instructions
                        .iter()
                        .find_map(|i| ApplyCommand::from_instruction_name(&i.name))
                });

            match pending {
                None => match next_command(leader_stage) {
                    None => Err(Error::waiting("re-encryption to finish on the leader")),
                    Some(command) => {
                        info!(command = command.subcommand(), "issuing secrets-encrypt command");
                        let desired =
                            apply_plan(&leader_input, &plan.entries[&leader_name].machine, command)?;
                        let entry = plan.entries.get_mut(&leader_name).unwrap();
                        store.ensure_plan(entry, &desired, DEFAULT_MAX_FAILURES).await?;
                        Err(Error::waiting(format!(
                            "secrets-encrypt {} to apply on the leader",
                            command.subcommand()
                        )))
                    }
                },
                Some(_) if !plan.entries[&leader_name].in_sync() => Err(Error::waiting(
                    "secrets-encrypt command to apply on the leader",
                )),
                Some(command) => {
                    if !command.expected_stages().contains(&leader_stage) {
                        warn!(
                            command = command.subcommand(),
                            stage = %leader_stage,
                            "unexpected stage after secrets-encrypt command, restarting sequence"
                        );
                    }
                    // Converged increment (or abort): either way the next
                    // increment re-derives from the observed stage.
                    status.rotate_encryption_keys_phase = Phase::Start;
                    Ok(true)
                }
            }
        }

        Phase::Done | Phase::Failed | Phase::Unknown => unreachable!("handled above"),
    }
}
