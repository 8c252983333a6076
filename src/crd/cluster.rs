//! TrellisCluster Custom Resource Definition
//!
//! A TrellisCluster declares the desired state of one distro cluster: the
//! version every machine converges onto, the rollout policy, etcd and
//! registry configuration, and the long-running operation requests
//! (snapshots, certificate and encryption-key rotation). The planner owns
//! the status side.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, EncryptionKeyRotationPhase, EtcdSnapshotCreate, EtcdSnapshotRestore, EtcdSpec,
    KubernetesSpec, Registries, RotateCertificates, RotateEncryptionKeys, SnapshotCreatePhase,
    SnapshotRestorePhase, UpgradeStrategy,
};

/// Specification for a TrellisCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "TrellisCluster",
    plural = "trellisclusters",
    shortname = "tc",
    status = "TrellisClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetes.version"}"#,
    printcolumn = r#"{"name":"Initialized","type":"boolean","jsonPath":".status.initialized"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrellisClusterSpec {
    /// Distro version and runtime
    pub kubernetes: KubernetesSpec,

    /// Per-tier concurrency and drain policy
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,

    /// Managed etcd configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdSpec>,

    /// Container registry mirrors and credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registries>,

    /// Values merged into the distro's bundled chart configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chart_values: BTreeMap<String, serde_json::Value>,

    /// Additional Subject Alternative Names for the API server certificate
    #[serde(rename = "tlsSANs", default, skip_serializing_if = "Vec::is_empty")]
    pub tls_sans: Vec<String>,

    /// Passthrough keys appended to every machine's runtime config
    ///
    /// Known config keys are owned by the planner and rejected here;
    /// see [`crate::planner::generate::RuntimeConfig`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_global_config: BTreeMap<String, serde_json::Value>,

    /// Pin the init node to the machine with this machine-id label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_node_machine_id: Option<String>,

    /// Halt machine-tier reconciliation (phase operations still run)
    #[serde(default)]
    pub paused: bool,

    /// Request certificate rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_certificates: Option<RotateCertificates>,

    /// Request encryption-key rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_encryption_keys: Option<RotateEncryptionKeys>,

    /// Request an etcd snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<EtcdSnapshotCreate>,

    /// Request an etcd snapshot restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore: Option<EtcdSnapshotRestore>,
}

impl TrellisClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.kubernetes.version.is_empty() {
            return Err(crate::Error::validation(
                "kubernetes.version must not be empty",
            ));
        }

        if let Some(id) = &self.init_node_machine_id {
            if id.is_empty() {
                return Err(crate::Error::validation(
                    "initNodeMachineId must not be empty when set",
                ));
            }
        }

        if let Some(restore) = &self.etcd_snapshot_restore {
            if restore.s3.is_none() && restore.node_name.is_none() {
                return Err(crate::Error::validation(
                    "etcdSnapshotRestore requires nodeName for local snapshots",
                ));
            }
        }

        crate::planner::generate::validate_extra_config(&self.machine_global_config)?;

        Ok(())
    }
}

/// Status for a TrellisCluster, owned by the planner
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrellisClusterStatus {
    /// Control plane has converged and published a join URL at least once
    #[serde(default)]
    pub initialized: bool,

    /// Every tier converged on the last pass
    #[serde(default)]
    pub ready: bool,

    /// Every machine's agent has checked in with an applied plan
    #[serde(default)]
    pub agent_connected: bool,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Spec generation observed by the last completed pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Join URL of the control plane, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_join_url: Option<String>,

    /// Bumped after a snapshot restore to force full re-provisioning
    #[serde(default)]
    pub config_generation: i64,

    /// Last applied certificate-rotation generation
    #[serde(default)]
    pub certificate_rotation_generation: i64,

    /// Current encryption-key rotation phase
    #[serde(default)]
    pub rotate_encryption_keys_phase: EncryptionKeyRotationPhase,

    /// Last completed encryption-key rotation generation
    #[serde(default)]
    pub rotate_encryption_keys_generation: i64,

    /// Current snapshot-create phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create_phase: Option<SnapshotCreatePhase>,

    /// Copy of the last handled snapshot-create request, for deep comparison
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<EtcdSnapshotCreate>,

    /// Current snapshot-restore phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore_phase: Option<SnapshotRestorePhase>,

    /// Generation of the snapshot-restore request being (or last) handled
    #[serde(default)]
    pub etcd_snapshot_restore_generation: i64,
}

impl TrellisClusterStatus {
    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition, replacing any existing condition of the same type
    pub fn set_condition(&mut self, condition: Condition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }
}

impl TrellisCluster {
    /// Current status, defaulting when the planner has not written one yet
    pub fn current_status(&self) -> TrellisClusterStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::Runtime;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_spec() -> TrellisClusterSpec {
        TrellisClusterSpec {
            kubernetes: KubernetesSpec {
                version: "v1.33.1+rke2r1".to_string(),
                runtime: Runtime::Rke2,
            },
            upgrade_strategy: UpgradeStrategy::default(),
            etcd: None,
            registries: None,
            chart_values: BTreeMap::new(),
            tls_sans: Vec::new(),
            machine_global_config: BTreeMap::new(),
            init_node_machine_id: None,
            paused: false,
            rotate_certificates: None,
            rotate_encryption_keys: None,
            etcd_snapshot_create: None,
            etcd_snapshot_restore: None,
        }
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: a minimal cluster spec passes validation
    #[test]
    fn story_minimal_spec_is_valid() {
        assert!(sample_spec().validate().is_ok());
    }

    /// Story: an empty version is rejected before any planning happens
    #[test]
    fn story_empty_version_fails_validation() {
        let mut spec = sample_spec();
        spec.kubernetes.version = String::new();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    /// Story: local restore without a node name is rejected
    ///
    /// A local snapshot lives on one node's disk; without a node name the
    /// restore phase could not pin the init node anywhere.
    #[test]
    fn story_local_restore_requires_node_name() {
        let mut spec = sample_spec();
        spec.etcd_snapshot_restore = Some(EtcdSnapshotRestore {
            generation: 1,
            name: "on-demand-001".to_string(),
            node_name: None,
            s3: None,
        });
        assert!(spec.validate().is_err());

        spec.etcd_snapshot_restore.as_mut().unwrap().node_name = Some("node-b".to_string());
        assert!(spec.validate().is_ok());
    }

    /// Story: passthrough config cannot shadow planner-owned keys
    #[test]
    fn story_global_config_rejects_reserved_keys() {
        let mut spec = sample_spec();
        spec.machine_global_config
            .insert("token".to_string(), serde_json::json!("oops"));
        assert!(spec.validate().is_err());

        let mut spec = sample_spec();
        spec.machine_global_config
            .insert("kubelet-arg".to_string(), serde_json::json!(["v=2"]));
        assert!(spec.validate().is_ok());
    }

    // =========================================================================
    // Status Stories
    // =========================================================================

    /// Story: the planner replaces conditions of the same type
    #[test]
    fn story_set_condition_replaces_same_type() {
        use crate::crd::types::ConditionStatus;

        let mut status = TrellisClusterStatus::default();
        status.set_condition(Condition::new(
            "Reconciled",
            ConditionStatus::Unknown,
            "Waiting",
            "waiting: plan to be applied",
        ));
        status.set_condition(Condition::new(
            "Reconciled",
            ConditionStatus::True,
            "Converged",
            "",
        ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    /// Story: spec survives a YAML roundtrip
    ///
    /// Specs are stored in etcd and compared by equality; lossy
    /// serialization would break phase-request comparison.
    #[test]
    fn story_spec_survives_yaml_roundtrip() {
        let mut spec = sample_spec();
        spec.rotate_certificates = Some(RotateCertificates {
            generation: 2,
            services: vec!["kube-apiserver".to_string()],
            ca_certificates: false,
        });

        let yaml = serde_yaml::to_string(&spec).unwrap();
        let parsed: TrellisClusterSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, parsed);
    }
}
