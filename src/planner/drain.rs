//! Drain coordination
//!
//! Major plan changes are gated behind an annotation handshake with the
//! external node-drain handler. The planner writes the drain options payload
//! it requires; the handler cordons and drains the node, then mirrors the
//! exact payload into the drain-done annotation. Payload equality, not mere
//! presence, is what authorizes the plan write, so a stale acknowledgement
//! from an earlier drain can never leak a new plan through.
//!
//! After the plan applies, the handshake runs in reverse: post-drain hooks
//! acknowledge, the planner clears its annotations and raises the uncordon
//! flag, and the handler removes that flag once the node is schedulable.
//!
//! Single-machine clusters skip the physical drain (there is nowhere for the
//! pods to go) but still run the hook gating, with `enabled` forced off in
//! the payload.

use tracing::{debug, info};

use crate::crd::DrainOptions;
use crate::machine::{
    MachineClient, DRAIN_DONE_ANNOTATION, DRAIN_OPTIONS_ANNOTATION, UNCORDON_ANNOTATION,
};
use crate::planner::store::PlanEntry;
use crate::Error;

/// Coordinates the drain/uncordon handshake for one cluster pass
pub struct DrainCoordinator<'a> {
    machines: &'a dyn MachineClient,
    /// Machines in the cluster; a single-machine cluster never drains
    cluster_size: usize,
}

impl<'a> DrainCoordinator<'a> {
    /// Create a coordinator for a cluster of the given size
    pub fn new(machines: &'a dyn MachineClient, cluster_size: usize) -> Self {
        Self {
            machines,
            cluster_size,
        }
    }

    /// The drain payload required for this cluster
    fn payload(&self, options: &DrainOptions) -> Result<String, Error> {
        let mut effective = options.clone();
        if self.cluster_size < 2 {
            effective.enabled = false;
        }
        serde_json::to_string(&effective).map_err(|e| Error::decode("drain-options", e.to_string()))
    }

    /// True while the machine is anywhere in the drain/uncordon handshake
    pub fn is_draining(entry: &PlanEntry) -> bool {
        entry.machine.annotation(DRAIN_OPTIONS_ANNOTATION).is_some()
            || entry.machine.annotation(UNCORDON_ANNOTATION).is_some()
    }

    /// Advance the drain handshake; `true` once the plan may be applied
    ///
    /// Idempotent: re-invoking in any intermediate state performs at most
    /// one annotation write and reports the same answer.
    pub async fn drain(&self, entry: &PlanEntry, options: &DrainOptions) -> Result<bool, Error> {
        let payload = self.payload(options)?;

        // Requote the payload whenever the required options changed; the
        // handler restarts the drain against the new payload.
        if entry.machine.annotation(DRAIN_OPTIONS_ANNOTATION) != Some(payload.as_str()) {
            info!(machine = %entry.name(), "requesting drain");
            self.machines
                .set_annotation(&entry.machine, DRAIN_OPTIONS_ANNOTATION, Some(payload))
                .await?;
            return Ok(false);
        }

        for hook in &options.pre_drain_hooks {
            if entry.machine.annotation(&hook.annotation) != Some(payload.as_str()) {
                debug!(machine = %entry.name(), hook = %hook.annotation, "waiting for pre-drain hook");
                return Ok(false);
            }
        }

        let done = entry.machine.annotation(DRAIN_DONE_ANNOTATION) == Some(payload.as_str());
        if !done {
            debug!(machine = %entry.name(), "waiting for drain handler");
        }
        Ok(done)
    }

    /// Advance the uncordon handshake; `true` once the machine is restored
    ///
    /// Called only after the machine's plan is in sync again.
    pub async fn uncordon(&self, entry: &PlanEntry, options: &DrainOptions) -> Result<bool, Error> {
        let machine = &entry.machine;

        if let Some(payload) = machine.annotation(DRAIN_OPTIONS_ANNOTATION) {
            // Post-drain hooks gate the uncordon the same way pre-drain
            // hooks gated the plan write.
            for hook in &options.post_drain_hooks {
                if machine.annotation(&hook.annotation) != Some(payload) {
                    debug!(machine = %entry.name(), hook = %hook.annotation, "waiting for post-drain hook");
                    return Ok(false);
                }
            }

            info!(machine = %entry.name(), "signalling uncordon");
            self.machines
                .set_annotation(machine, UNCORDON_ANNOTATION, Some("true".to_string()))
                .await?;
            self.machines
                .set_annotation(machine, DRAIN_OPTIONS_ANNOTATION, None)
                .await?;
            self.machines
                .set_annotation(machine, DRAIN_DONE_ANNOTATION, None)
                .await?;
            return Ok(false);
        }

        if machine.annotation(UNCORDON_ANNOTATION).is_some() {
            debug!(machine = %entry.name(), "waiting for uncordon handler");
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DrainHook;
    use crate::machine::{Machine, RoleSet, POST_DRAIN_ANNOTATION, PRE_DRAIN_ANNOTATION};
    use crate::planner::fixtures::{MachineOp, RecordingMachineClient};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn entry_with_annotations(pairs: &[(&str, &str)]) -> PlanEntry {
        PlanEntry {
            machine: Machine {
                name: "worker-0".to_string(),
                namespace: "fleet".to_string(),
                roles: RoleSet::WORKER,
                annotations: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            node: None,
        }
    }

    fn enabled_options() -> DrainOptions {
        DrainOptions {
            enabled: true,
            ..Default::default()
        }
    }

    fn payload_for(options: &DrainOptions) -> String {
        serde_json::to_string(options).unwrap()
    }

    // =========================================================================
    // Drain Handshake Stories
    // =========================================================================

    /// Story: the first pass writes the payload and reports not-done
    #[tokio::test]
    async fn story_first_pass_requests_drain() {
        let options = enabled_options();
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);
        let entry = entry_with_annotations(&[]);

        assert!(!coordinator.drain(&entry, &options).await.unwrap());
        assert_eq!(
            machines.ops(),
            vec![MachineOp::Annotation {
                machine: "worker-0".to_string(),
                key: DRAIN_OPTIONS_ANNOTATION.to_string(),
                value: Some(payload_for(&options)),
            }]
        );
    }

    /// Story: a mirrored payload authorizes the plan write
    #[tokio::test]
    async fn story_mirrored_payload_completes_drain() {
        let options = enabled_options();
        let payload = payload_for(&options);
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);

        let entry = entry_with_annotations(&[
            (DRAIN_OPTIONS_ANNOTATION, payload.as_str()),
            (DRAIN_DONE_ANNOTATION, payload.as_str()),
        ]);
        assert!(coordinator.drain(&entry, &options).await.unwrap());
        assert!(machines.ops().is_empty(), "completion performs no writes");
    }

    /// Story: a stale acknowledgement never authorizes a new plan
    ///
    /// The handler acknowledged an older payload; the coordinator requotes
    /// and waits for a fresh acknowledgement.
    #[tokio::test]
    async fn story_stale_ack_requotes() {
        let mut options = enabled_options();
        let old_payload = payload_for(&options);
        options.force = true;

        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);
        let entry = entry_with_annotations(&[
            (DRAIN_OPTIONS_ANNOTATION, old_payload.as_str()),
            (DRAIN_DONE_ANNOTATION, old_payload.as_str()),
        ]);

        assert!(!coordinator.drain(&entry, &options).await.unwrap());
        assert_eq!(
            machines.ops(),
            vec![MachineOp::Annotation {
                machine: "worker-0".to_string(),
                key: DRAIN_OPTIONS_ANNOTATION.to_string(),
                value: Some(payload_for(&options)),
            }]
        );
    }

    /// Story: pre-drain hooks gate the acknowledgement
    #[tokio::test]
    async fn story_pre_drain_hook_gates_completion() {
        let mut options = enabled_options();
        options.pre_drain_hooks = vec![DrainHook {
            annotation: PRE_DRAIN_ANNOTATION.to_string(),
        }];
        let payload = payload_for(&options);
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);

        // Hook missing: not done even though the handler drained.
        let entry = entry_with_annotations(&[
            (DRAIN_OPTIONS_ANNOTATION, payload.as_str()),
            (DRAIN_DONE_ANNOTATION, payload.as_str()),
        ]);
        assert!(!coordinator.drain(&entry, &options).await.unwrap());

        // Hook acknowledged with the current payload: done.
        let entry = entry_with_annotations(&[
            (DRAIN_OPTIONS_ANNOTATION, payload.as_str()),
            (DRAIN_DONE_ANNOTATION, payload.as_str()),
            (PRE_DRAIN_ANNOTATION, payload.as_str()),
        ]);
        assert!(coordinator.drain(&entry, &options).await.unwrap());
        assert!(machines.ops().is_empty());
    }

    /// Story: single-machine clusters skip the physical drain
    ///
    /// The payload carries enabled=false so the handler acknowledges without
    /// evicting anything, but hooks still run.
    #[tokio::test]
    async fn story_single_machine_cluster_disables_drain() {
        let options = enabled_options();
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 1);
        let entry = entry_with_annotations(&[]);

        assert!(!coordinator.drain(&entry, &options).await.unwrap());

        let mut disabled = options.clone();
        disabled.enabled = false;
        assert_eq!(
            machines.ops(),
            vec![MachineOp::Annotation {
                machine: "worker-0".to_string(),
                key: DRAIN_OPTIONS_ANNOTATION.to_string(),
                value: Some(payload_for(&disabled)),
            }]
        );
    }

    // =========================================================================
    // Uncordon Handshake Stories
    // =========================================================================

    /// Story: after the plan applies, the coordinator flips to uncordon
    #[tokio::test]
    async fn story_uncordon_clears_drain_and_raises_flag() {
        let options = enabled_options();
        let payload = payload_for(&options);
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);

        let entry = entry_with_annotations(&[
            (DRAIN_OPTIONS_ANNOTATION, payload.as_str()),
            (DRAIN_DONE_ANNOTATION, payload.as_str()),
        ]);
        assert!(!coordinator.uncordon(&entry, &options).await.unwrap());

        let machine = "worker-0".to_string();
        assert_eq!(
            machines.ops(),
            vec![
                MachineOp::Annotation {
                    machine: machine.clone(),
                    key: UNCORDON_ANNOTATION.to_string(),
                    value: Some("true".to_string()),
                },
                MachineOp::Annotation {
                    machine: machine.clone(),
                    key: DRAIN_OPTIONS_ANNOTATION.to_string(),
                    value: None,
                },
                MachineOp::Annotation {
                    machine,
                    key: DRAIN_DONE_ANNOTATION.to_string(),
                    value: None,
                },
            ]
        );
    }

    /// Story: post-drain hooks hold the uncordon back
    #[tokio::test]
    async fn story_post_drain_hook_gates_uncordon() {
        let mut options = enabled_options();
        options.post_drain_hooks = vec![DrainHook {
            annotation: POST_DRAIN_ANNOTATION.to_string(),
        }];
        let payload = payload_for(&options);

        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);
        let entry = entry_with_annotations(&[(DRAIN_OPTIONS_ANNOTATION, payload.as_str())]);

        assert!(!coordinator.uncordon(&entry, &options).await.unwrap());
        assert!(machines.ops().is_empty(), "hook gate performs no writes");
    }

    /// Story: the handshake completes when the handler removes the flag
    #[tokio::test]
    async fn story_uncordon_completes_when_flag_removed() {
        let options = enabled_options();
        let machines = RecordingMachineClient::new();
        let coordinator = DrainCoordinator::new(&machines, 3);

        let waiting = entry_with_annotations(&[(UNCORDON_ANNOTATION, "true")]);
        assert!(!coordinator.uncordon(&waiting, &options).await.unwrap());
        assert!(DrainCoordinator::is_draining(&waiting));

        let restored = entry_with_annotations(&[]);
        assert!(coordinator.uncordon(&restored, &options).await.unwrap());
        assert!(!DrainCoordinator::is_draining(&restored));
    }
}
