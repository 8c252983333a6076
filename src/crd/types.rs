//! Shared types for the TrellisCluster CRD
//!
//! Spec-side types describe the desired distro configuration and the rollout
//! policy; status-side types carry the phase enums the long-running
//! operations persist between reconciliation passes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Distro runtime managed on every machine
///
/// The planner only issues install/restart/status commands to the runtime;
/// the runtime itself is out of scope.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// RKE2 (default)
    #[default]
    Rke2,
    /// K3s
    K3s,
}

impl Runtime {
    /// Binary name invoked in plan instructions
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Rke2 => "rke2",
            Self::K3s => "k3s",
        }
    }

    /// Config file directory on the machine
    pub fn config_dir(&self) -> &'static str {
        match self {
            Self::Rke2 => "/etc/rancher/rke2",
            Self::K3s => "/etc/rancher/k3s",
        }
    }

    /// Data directory on the machine
    pub fn data_dir(&self) -> &'static str {
        match self {
            Self::Rke2 => "/var/lib/rancher/rke2",
            Self::K3s => "/var/lib/rancher/k3s",
        }
    }

    /// Systemd unit for server (etcd / control-plane) machines
    pub fn server_unit(&self) -> &'static str {
        match self {
            Self::Rke2 => "rke2-server",
            Self::K3s => "k3s",
        }
    }

    /// Systemd unit for worker machines
    pub fn agent_unit(&self) -> &'static str {
        match self {
            Self::Rke2 => "rke2-agent",
            Self::K3s => "k3s-agent",
        }
    }

    /// Kill-all script shipped with the runtime
    pub fn killall(&self) -> &'static str {
        match self {
            Self::Rke2 => "rke2-killall.sh",
            Self::K3s => "k3s-killall.sh",
        }
    }

    /// Systemd unit for a machine with the given server-ness
    pub fn unit(&self, server: bool) -> &'static str {
        if server {
            self.server_unit()
        } else {
            self.agent_unit()
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary())
    }
}

/// Kubernetes distro version and runtime selection
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Distro version to converge every machine onto (e.g. "v1.33.1+rke2r1")
    pub version: String,

    /// Distro runtime (rke2 or k3s)
    #[serde(default)]
    pub runtime: Runtime,
}

/// Per-tier rollout policy
///
/// Concurrency values follow the Kubernetes int-or-percent convention:
/// an absolute count, or a percentage of the tier size rounded up.
/// `0` means unbounded. Unset defaults to 1.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    /// Max simultaneously-unavailable etcd/control-plane machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_concurrency: Option<IntOrString>,

    /// Max simultaneously-unavailable worker machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<IntOrString>,

    /// Drain behavior for etcd/control-plane machines
    #[serde(default)]
    pub control_plane_drain_options: DrainOptions,

    /// Drain behavior for worker machines
    #[serde(default)]
    pub worker_drain_options: DrainOptions,
}

/// Options handed to the external drain handler before a major plan change
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainOptions {
    /// Whether the node is cordoned and drained at all
    #[serde(default)]
    pub enabled: bool,

    /// Continue even when pods are not managed by a controller
    #[serde(default)]
    pub force: bool,

    /// Ignore DaemonSet-managed pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_daemon_sets: Option<bool>,

    /// Continue even when pods use emptyDir volumes
    #[serde(default)]
    pub delete_empty_dir_data: bool,

    /// Delete pods directly instead of using the eviction API
    #[serde(default)]
    pub disable_eviction: bool,

    /// Pod termination grace period override, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<i32>,

    /// Overall drain timeout, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,

    /// Skip waiting for pods past this deletion age, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_wait_for_delete_timeout_seconds: Option<i32>,

    /// Hooks that must acknowledge the drain payload before the plan applies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_drain_hooks: Vec<DrainHook>,

    /// Hooks that must acknowledge the drain payload before uncordoning
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_drain_hooks: Vec<DrainHook>,
}

/// A drain hook owned by an external system
///
/// The hook is complete once its annotation on the machine equals the
/// current drain payload.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainHook {
    /// Annotation the external system mirrors the drain payload into
    pub annotation: String,
}

/// Managed etcd configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// Disable the runtime's periodic snapshots
    #[serde(default)]
    pub disable_snapshots: bool,

    /// Cron expression for periodic snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_schedule_cron: Option<String>,

    /// Number of periodic snapshots to retain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_retention: Option<i32>,

    /// S3 target for snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// S3 endpoint and credential configuration for etcd snapshots
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,

    /// Endpoint override (defaults to AWS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Key prefix within the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    /// Name of the Secret holding access/secret keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret: Option<String>,

    /// PEM CA bundle for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_ca: Option<String>,

    /// Skip TLS verification against the endpoint
    #[serde(default)]
    pub skip_ssl_verify: bool,
}

/// Container registry mirrors and per-registry settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registries {
    /// Mirror endpoints keyed by registry host
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, Mirror>,

    /// Per-registry auth/TLS settings keyed by registry host
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, RegistryConfig>,
}

/// Mirror endpoints for one registry host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    /// Endpoint URLs tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

/// Auth/TLS settings for one registry host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Name of the Secret holding registry credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,

    /// Skip TLS verification for this registry
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Request to create an etcd snapshot
///
/// Restarted whenever any field of this block changes (deep inequality),
/// re-entering with an unchanged block after completion is a no-op.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSnapshotCreate {
    /// Strictly increasing trigger
    #[serde(default)]
    pub generation: i64,

    /// Snapshot name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Node to take the snapshot on (first eligible etcd node if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Upload to S3 instead of local disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// Request to restore an etcd snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSnapshotRestore {
    /// Strictly increasing trigger; equal generation is a no-op
    #[serde(default)]
    pub generation: i64,

    /// Snapshot name or path to restore
    pub name: String,

    /// Node holding the local snapshot (required unless restoring from S3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Restore from S3 instead of local disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// Request to rotate cluster certificates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RotateCertificates {
    /// Strictly increasing trigger; equal generation is a no-op
    #[serde(default)]
    pub generation: i64,

    /// Services whose certificates are rotated; ignored when rotating the CA
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,

    /// Rotate the cluster CA (implies all service certificates)
    #[serde(default)]
    pub ca_certificates: bool,
}

/// Request to rotate the secrets-encryption keys
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RotateEncryptionKeys {
    /// Strictly increasing trigger; equal generation is a no-op
    #[serde(default)]
    pub generation: i64,
}

/// Phases of the encryption-key rotation state machine
///
/// Advances monotonically, at most one transition per reconciliation pass.
/// `Failed` absorbs the sequence until the spec generation changes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EncryptionKeyRotationPhase {
    /// Sequence entry point; also the reset target after any abort
    #[default]
    Start,
    /// Restarting the init node's runtime
    RestartLeader,
    /// Re-reading the leader's rotation stage after restart
    VerifyLeaderStatus,
    /// Restarting and verifying every non-init control-plane machine
    RestartFollowers,
    /// Issuing the next secrets-encrypt command on the leader
    ApplyLeader,
    /// Rotation complete for the current generation
    Done,
    /// Rotation aborted; waits for a new generation
    Failed,
    /// Unrecognized persisted phase; treated as Start
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for EncryptionKeyRotationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "Start",
            Self::RestartLeader => "RestartLeader",
            Self::VerifyLeaderStatus => "VerifyLeaderStatus",
            Self::RestartFollowers => "RestartFollowers",
            Self::ApplyLeader => "ApplyLeader",
            Self::Done => "Done",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Phases of an etcd snapshot create operation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SnapshotCreatePhase {
    /// Snapshot instruction assigned, waiting for the agent
    #[default]
    Started,
    /// Snapshot confirmed applied
    Finished,
    /// Unrecognized persisted phase; treated as Started
    #[serde(other)]
    Unknown,
}

/// Phases of an etcd snapshot restore operation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SnapshotRestorePhase {
    /// Restore accepted
    #[default]
    Started,
    /// Stopping the runtime on every etcd/control-plane machine
    Shutdown,
    /// Running cluster-reset on the re-designated init node
    Restore,
    /// Restore complete; terminal and idempotent
    Finished,
    /// Unrecognized persisted phase; treated as Started
    #[serde(other)]
    Unknown,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A condition on the cluster status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Reconciled, Initialized)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Runtime Selection Stories
    // =========================================================================

    /// Story: RKE2 machines run split server/agent units
    #[test]
    fn story_rke2_units_split_by_role() {
        let rt = Runtime::Rke2;
        assert_eq!(rt.unit(true), "rke2-server");
        assert_eq!(rt.unit(false), "rke2-agent");
        assert_eq!(rt.binary(), "rke2");
        assert_eq!(rt.killall(), "rke2-killall.sh");
    }

    /// Story: K3s servers and agents share the k3s binary
    #[test]
    fn story_k3s_paths_and_units() {
        let rt = Runtime::K3s;
        assert_eq!(rt.unit(true), "k3s");
        assert_eq!(rt.unit(false), "k3s-agent");
        assert_eq!(rt.config_dir(), "/etc/rancher/k3s");
        assert_eq!(rt.data_dir(), "/var/lib/rancher/k3s");
    }

    // =========================================================================
    // Serialization Stories
    // =========================================================================
    //
    // Spec blocks are compared by deep equality (snapshot create) or by
    // generation (the rest); stable serialization is what makes the stored
    // copies in status meaningful.

    /// Story: user requests an S3 snapshot in YAML
    #[test]
    fn story_yaml_defines_s3_snapshot_request() {
        let yaml = r#"
generation: 3
name: pre-upgrade
s3:
  bucket: backups
  region: us-east-1
  cloudCredentialSecret: s3-creds
"#;
        let req: EtcdSnapshotCreate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(req.generation, 3);
        assert_eq!(req.name.as_deref(), Some("pre-upgrade"));
        let s3 = req.s3.unwrap();
        assert_eq!(s3.bucket, "backups");
        assert_eq!(s3.cloud_credential_secret.as_deref(), Some("s3-creds"));
    }

    /// Story: snapshot requests compare by deep equality
    ///
    /// Changing any field of the request block (not just the generation)
    /// restarts the create sequence.
    #[test]
    fn story_snapshot_create_deep_equality() {
        let a = EtcdSnapshotCreate {
            generation: 1,
            name: Some("nightly".into()),
            ..Default::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.node_name = Some("etcd-1".into());
        assert_ne!(a, b);
    }

    /// Story: unknown persisted phases decode to Unknown, not an error
    ///
    /// A status written by a newer version must not brick older planners;
    /// the state machines treat Unknown as a reset to the first phase.
    #[test]
    fn story_unknown_phase_decodes_to_unknown() {
        let phase: EncryptionKeyRotationPhase =
            serde_json::from_str("\"SomeFuturePhase\"").unwrap();
        assert_eq!(phase, EncryptionKeyRotationPhase::Unknown);

        let phase: SnapshotRestorePhase = serde_json::from_str("\"Defragment\"").unwrap();
        assert_eq!(phase, SnapshotRestorePhase::Unknown);
    }

    /// Story: drain options default to a disabled drain
    ///
    /// Plans still flow through the handshake, but the handler skips the
    /// physical drain unless the user opts in.
    #[test]
    fn story_drain_disabled_by_default() {
        let opts = DrainOptions::default();
        assert!(!opts.enabled);
        assert!(opts.pre_drain_hooks.is_empty());
        assert!(opts.post_drain_hooks.is_empty());
    }
}
