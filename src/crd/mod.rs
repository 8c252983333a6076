//! Custom Resource Definitions for Trellis
//!
//! This module contains the TrellisCluster CRD and the spec/status types the
//! planner reads and writes.

mod cluster;
mod types;

pub use cluster::{TrellisCluster, TrellisClusterSpec, TrellisClusterStatus};
pub use types::{
    Condition, ConditionStatus, DrainHook, DrainOptions, EncryptionKeyRotationPhase,
    EtcdSnapshotCreate, EtcdSnapshotRestore, EtcdSpec, KubernetesSpec, Mirror, Registries,
    RegistryConfig, RotateCertificates, RotateEncryptionKeys, Runtime, S3Config,
    SnapshotCreatePhase, SnapshotRestorePhase, UpgradeStrategy,
};
