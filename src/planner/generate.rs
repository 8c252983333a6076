//! Desired-plan generation
//!
//! Builds the full [`NodePlan`] for one machine from the cluster spec, the
//! machine's roles, the join server, and the cluster join token. Generation
//! is pure: the same inputs always produce byte-identical plans, which is
//! what makes plan equality a meaningful rollout signal.
//!
//! The distro config is a typed [`RuntimeConfig`] with explicit fields and a
//! small passthrough map for keys the planner does not own; passthrough keys
//! are validated against the reserved set at construction, not at use.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::crd::{Runtime, TrellisCluster};
use crate::machine::{
    Machine, RoleSet, LABELS_ANNOTATION, NODE_NAME_ANNOTATION, TAINTS_ANNOTATION,
};
use crate::planner::plan::{NodePlan, OneTimeInstruction, PeriodicInstruction, PlanFile, Probe};
use crate::Error;

/// Image repository prefix for the installer payloads
const INSTALLER_IMAGE_PREFIX: &str = "index.docker.io/trellis";

/// Periodic instruction publishing the runtime's encryption rotation stage
pub const ENCRYPTION_STATUS_INSTRUCTION: &str = "secrets-encrypt-status";

/// Config keys owned by the planner; rejected in passthrough maps
pub const RESERVED_CONFIG_KEYS: &[&str] = &[
    "server",
    "token",
    "tls-san",
    "node-name",
    "node-label",
    "node-taint",
    "cluster-init",
    "etcd-disable-snapshots",
    "etcd-snapshot-schedule-cron",
    "etcd-snapshot-retention",
    "private-registry",
];

/// Reject passthrough keys that shadow planner-owned config fields
pub fn validate_extra_config(
    extra: &BTreeMap<String, serde_json::Value>,
) -> Result<(), Error> {
    for key in extra.keys() {
        if RESERVED_CONFIG_KEYS.contains(&key.as_str()) {
            return Err(Error::validation(format!(
                "config key {key:?} is owned by the planner and cannot be overridden"
            )));
        }
    }
    Ok(())
}

/// Typed distro config serialized into the machine's config file
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RuntimeConfig {
    /// Join server URL; unset on the init node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Shared cluster join token
    pub token: String,

    /// Extra API server certificate SANs
    #[serde(rename = "tls-san", skip_serializing_if = "Vec::is_empty")]
    pub tls_san: Vec<String>,

    /// Node name override
    #[serde(rename = "node-name", skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Extra node labels in key=value form
    #[serde(rename = "node-label", skip_serializing_if = "Vec::is_empty")]
    pub node_label: Vec<String>,

    /// Extra node taints in key=value:Effect form
    #[serde(rename = "node-taint", skip_serializing_if = "Vec::is_empty")]
    pub node_taint: Vec<String>,

    /// Initialize a new etcd cluster (K3s init node only)
    #[serde(rename = "cluster-init", skip_serializing_if = "std::ops::Not::not")]
    pub cluster_init: bool,

    /// Disable the runtime's periodic etcd snapshots
    #[serde(
        rename = "etcd-disable-snapshots",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub etcd_disable_snapshots: bool,

    /// Periodic snapshot schedule
    #[serde(
        rename = "etcd-snapshot-schedule-cron",
        skip_serializing_if = "Option::is_none"
    )]
    pub etcd_snapshot_schedule_cron: Option<String>,

    /// Periodic snapshot retention
    #[serde(
        rename = "etcd-snapshot-retention",
        skip_serializing_if = "Option::is_none"
    )]
    pub etcd_snapshot_retention: Option<i32>,

    /// Path of the registries file, when registries are configured
    #[serde(rename = "private-registry", skip_serializing_if = "Option::is_none")]
    pub private_registry: Option<String>,

    /// Validated passthrough keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RuntimeConfig {
    /// Serialize to the config file's YAML form
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::decode("config", e.to_string()))
    }
}

/// Pass-scoped inputs shared by every machine's plan generation
#[derive(Clone, Copy, Debug)]
pub struct PlanInput<'a> {
    /// The cluster being reconciled
    pub cluster: &'a TrellisCluster,
    /// Shared cluster join token
    pub token: &'a str,
    /// Join server for this machine; `None` on the init node
    pub join_server: Option<&'a str>,
    /// Current config generation; stamped into every plan so a bump
    /// re-provisions the whole cluster
    pub config_generation: i64,
}

/// Build the desired plan for one machine
pub fn desired_plan(input: &PlanInput<'_>, machine: &Machine) -> Result<NodePlan, Error> {
    let spec = &input.cluster.spec;
    let runtime = spec.kubernetes.runtime;
    let server = machine.roles.is_server();

    validate_extra_config(&spec.machine_global_config)?;

    let mut files = Vec::new();

    let registries_path = spec.registries.as_ref().map(|registries| {
        let path = format!("{}/registries.yaml", runtime.config_dir());
        files.push(
            PlanFile::new(
                path.clone(),
                serde_yaml::to_string(registries)
                    .unwrap_or_default()
                    .as_bytes(),
            )
            .permissions("0600"),
        );
        path
    });

    let config = runtime_config(input, machine, registries_path)?;
    files.insert(
        0,
        PlanFile::new(
            format!("{}/config.yaml", runtime.config_dir()),
            config.to_yaml()?.as_bytes(),
        )
        .permissions("0600"),
    );

    // Chart values roll out without a drain; the runtime picks the manifest
    // change up on its own.
    if server && !spec.chart_values.is_empty() {
        let content = serde_yaml::to_string(&spec.chart_values)
            .map_err(|e| Error::decode("chartValues", e.to_string()))?;
        files.push(
            PlanFile::new(
                format!(
                    "{}/server/manifests/{}-chart-values.yaml",
                    runtime.data_dir(),
                    runtime.binary()
                ),
                content.as_bytes(),
            )
            .minor(),
        );
    }

    let mut periodic_instructions = Vec::new();
    if machine.roles.contains(RoleSet::CONTROL_PLANE) {
        periodic_instructions.push(PeriodicInstruction {
            name: ENCRYPTION_STATUS_INSTRUCTION.to_string(),
            command: runtime.binary().to_string(),
            args: vec!["secrets-encrypt".to_string(), "status".to_string()],
            save_output: true,
            period_seconds: 300,
            ..Default::default()
        });
    }

    Ok(NodePlan {
        instructions: vec![install_instruction(input, runtime)],
        periodic_instructions,
        files,
        probes: probes_for(runtime, machine.roles),
    })
}

fn runtime_config(
    input: &PlanInput<'_>,
    machine: &Machine,
    registries_path: Option<String>,
) -> Result<RuntimeConfig, Error> {
    let spec = &input.cluster.spec;
    let runtime = spec.kubernetes.runtime;
    let init_node = input.join_server.is_none();

    let split = |value: Option<&str>| -> Vec<String> {
        value
            .map(|v| v.split(',').map(str::trim).map(str::to_string).collect())
            .unwrap_or_default()
    };

    let etcd = spec.etcd.as_ref();
    let config = RuntimeConfig {
        server: input.join_server.map(str::to_string),
        token: input.token.to_string(),
        tls_san: if machine.roles.contains(RoleSet::CONTROL_PLANE) {
            spec.tls_sans.clone()
        } else {
            Vec::new()
        },
        node_name: machine
            .annotation(NODE_NAME_ANNOTATION)
            .map(str::to_string),
        node_label: split(machine.annotation(LABELS_ANNOTATION)),
        node_taint: split(machine.annotation(TAINTS_ANNOTATION)),
        cluster_init: init_node && runtime == Runtime::K3s,
        etcd_disable_snapshots: etcd.map(|e| e.disable_snapshots).unwrap_or(false),
        etcd_snapshot_schedule_cron: etcd.and_then(|e| e.snapshot_schedule_cron.clone()),
        etcd_snapshot_retention: etcd.and_then(|e| e.snapshot_retention),
        private_registry: registries_path,
        extra: spec.machine_global_config.clone(),
    };

    Ok(config)
}

fn install_instruction(input: &PlanInput<'_>, runtime: Runtime) -> OneTimeInstruction {
    let version = &input.cluster.spec.kubernetes.version;
    OneTimeInstruction {
        name: "install".to_string(),
        image: Some(format!(
            "{INSTALLER_IMAGE_PREFIX}/system-agent-installer-{}:{}",
            runtime.binary(),
            version.replace('+', "-"),
        )),
        env: vec![
            format!(
                "INSTALL_{}_VERSION={version}",
                runtime.binary().to_uppercase()
            ),
            format!("CONFIG_GENERATION={}", input.config_generation),
        ],
        ..Default::default()
    }
}

fn probes_for(runtime: Runtime, roles: RoleSet) -> BTreeMap<String, Probe> {
    let data = runtime.data_dir();
    let mut probes = BTreeMap::new();

    probes.insert(
        "kubelet".to_string(),
        Probe {
            url: "http://127.0.0.1:10248/healthz".to_string(),
            initial_delay_seconds: 10,
            timeout_seconds: 5,
            success_threshold: 1,
            failure_threshold: 2,
            ..Default::default()
        },
    );

    if roles.contains(RoleSet::ETCD) {
        probes.insert(
            "etcd".to_string(),
            Probe {
                url: "https://127.0.0.1:2379/health".to_string(),
                ca_cert: format!("{data}/server/tls/etcd/server-ca.crt"),
                client_cert: format!("{data}/server/tls/etcd/server-client.crt"),
                client_key: format!("{data}/server/tls/etcd/server-client.key"),
                initial_delay_seconds: 30,
                timeout_seconds: 5,
                success_threshold: 1,
                failure_threshold: 3,
                ..Default::default()
            },
        );
    }

    if roles.contains(RoleSet::CONTROL_PLANE) {
        probes.insert(
            "kube-apiserver".to_string(),
            Probe {
                url: "https://127.0.0.1:6443/readyz".to_string(),
                ca_cert: format!("{data}/server/tls/server-ca.crt"),
                client_cert: format!("{data}/server/tls/client-kube-apiserver.crt"),
                client_key: format!("{data}/server/tls/client-kube-apiserver.key"),
                initial_delay_seconds: 30,
                timeout_seconds: 5,
                success_threshold: 1,
                failure_threshold: 3,
                ..Default::default()
            },
        );
        probes.insert(
            "kube-scheduler".to_string(),
            Probe {
                url: "https://127.0.0.1:10259/healthz".to_string(),
                initial_delay_seconds: 30,
                timeout_seconds: 5,
                success_threshold: 1,
                failure_threshold: 2,
                ..Default::default()
            },
        );
        probes.insert(
            "kube-controller-manager".to_string(),
            Probe {
                url: "https://127.0.0.1:10257/healthz".to_string(),
                initial_delay_seconds: 30,
                timeout_seconds: 5,
                success_threshold: 1,
                failure_threshold: 2,
                ..Default::default()
            },
        );
    }

    probes
}
