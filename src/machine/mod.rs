//! Typed view over CAPI machines
//!
//! The planner never creates or deletes machines; CAPI owns their lifecycle.
//! This module decodes the dynamic CAPI Machine objects into a small typed
//! view ([`Machine`]), models roles as an explicit bitset instead of label
//! predicates, and defines the label/annotation protocol the planner and the
//! external drain handler exchange.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::core::ApiResource;
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Label marking the single bootstrap node among etcd machines
pub const INIT_NODE_LABEL: &str = "trellis.dev/init-node";
/// Label carrying a machine's stable machine-id
pub const MACHINE_ID_LABEL: &str = "trellis.dev/machine-id";
/// Role label for etcd machines
pub const ETCD_ROLE_LABEL: &str = "trellis.dev/etcd-role";
/// Role label for control-plane machines
pub const CONTROL_PLANE_ROLE_LABEL: &str = "trellis.dev/control-plane-role";
/// Role label for worker machines
pub const WORKER_ROLE_LABEL: &str = "trellis.dev/worker-role";

/// Annotation where the agent publishes the machine's join URL
pub const JOIN_URL_ANNOTATION: &str = "trellis.dev/join-url";
/// Annotation carrying the drain payload the planner requires
pub const DRAIN_OPTIONS_ANNOTATION: &str = "trellis.dev/drain-options";
/// Annotation the drain handler mirrors the payload into when drained
pub const DRAIN_DONE_ANNOTATION: &str = "trellis.dev/drain-done";
/// Default pre-drain hook annotation
pub const PRE_DRAIN_ANNOTATION: &str = "trellis.dev/pre-drain";
/// Default post-drain hook annotation
pub const POST_DRAIN_ANNOTATION: &str = "trellis.dev/post-drain";
/// Annotation signalling the drain handler to uncordon the node
pub const UNCORDON_ANNOTATION: &str = "trellis.dev/uncordon";
/// Annotation carrying extra node taints
pub const TAINTS_ANNOTATION: &str = "trellis.dev/taints";
/// Annotation carrying extra node labels
pub const LABELS_ANNOTATION: &str = "trellis.dev/labels";
/// Annotation overriding the node name
pub const NODE_NAME_ANNOTATION: &str = "trellis.dev/node-name";

/// CAPI label selecting the machines of one cluster
pub const CAPI_CLUSTER_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Bootstrap config kind the planner owns; machines using any other
/// bootstrap provider are never written to
pub const BOOTSTRAP_KIND: &str = "TrellisBootstrapConfig";

/// Set of roles held by one machine
///
/// Roles compose as a bitset so tier membership is plain set arithmetic
/// rather than label lookups scattered through the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoleSet(u8);

impl RoleSet {
    /// No roles
    pub const NONE: RoleSet = RoleSet(0);
    /// etcd member
    pub const ETCD: RoleSet = RoleSet(1);
    /// control-plane member
    pub const CONTROL_PLANE: RoleSet = RoleSet(1 << 1);
    /// worker
    pub const WORKER: RoleSet = RoleSet(1 << 2);

    /// Decode roles from machine labels
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut roles = Self::NONE;
        if labels.get(ETCD_ROLE_LABEL).map(String::as_str) == Some("true") {
            roles = roles | Self::ETCD;
        }
        if labels.get(CONTROL_PLANE_ROLE_LABEL).map(String::as_str) == Some("true") {
            roles = roles | Self::CONTROL_PLANE;
        }
        if labels.get(WORKER_ROLE_LABEL).map(String::as_str) == Some("true") {
            roles = roles | Self::WORKER;
        }
        roles
    }

    /// True if every role in `other` is present
    pub fn contains(self, other: RoleSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any role in `other` is present
    pub fn intersects(self, other: RoleSet) -> bool {
        self.0 & other.0 != 0
    }

    /// True if the machine has no recognized role
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True for etcd or control-plane machines (run the server unit)
    pub fn is_server(self) -> bool {
        self.intersects(Self::ETCD | Self::CONTROL_PLANE)
    }
}

impl std::ops::BitOr for RoleSet {
    type Output = RoleSet;

    fn bitor(self, rhs: RoleSet) -> RoleSet {
        RoleSet(self.0 | rhs.0)
    }
}

/// Read-only view of one CAPI machine
///
/// Rebuilt from the API on every reconciliation pass; mutations go through
/// [`MachineClient`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Machine {
    /// Machine name
    pub name: String,
    /// Namespace the machine (and its plan record) lives in
    pub namespace: String,
    /// Roles decoded from labels
    pub roles: RoleSet,
    /// All machine labels
    pub labels: BTreeMap<String, String>,
    /// All machine annotations
    pub annotations: BTreeMap<String, String>,
    /// Deletion timestamp set
    pub deleting: bool,
    /// Infrastructure provider reported ready
    pub infra_ready: bool,
    /// Name of the Kubernetes node backing this machine, once registered
    pub node_ref: Option<String>,
    /// Kind of the machine's bootstrap config reference
    pub bootstrap_kind: String,
}

impl Machine {
    /// Decode a typed view from a dynamic CAPI Machine object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, Error> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::decode("machine", "machine has no name"))?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let labels = obj.metadata.labels.clone().unwrap_or_default();
        let annotations = obj.metadata.annotations.clone().unwrap_or_default();

        let bootstrap_kind = obj.data["spec"]["bootstrap"]["configRef"]["kind"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let infra_ready = obj.data["status"]["infrastructureReady"]
            .as_bool()
            .unwrap_or(false);
        let node_ref = obj.data["status"]["nodeRef"]["name"]
            .as_str()
            .map(str::to_string);

        Ok(Self {
            name,
            namespace,
            roles: RoleSet::from_labels(&labels),
            deleting: obj.metadata.deletion_timestamp.is_some(),
            infra_ready,
            node_ref,
            bootstrap_kind,
            labels,
            annotations,
        })
    }

    /// True if this machine carries the init-node mark
    pub fn is_init_node(&self) -> bool {
        self.labels.get(INIT_NODE_LABEL).map(String::as_str) == Some("true")
    }

    /// The machine's published join URL, if non-empty
    pub fn join_url(&self) -> Option<&str> {
        self.annotations
            .get(JOIN_URL_ANNOTATION)
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }

    /// An annotation value under the trellis protocol
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The node name this machine registers as
    pub fn node_name(&self) -> Option<&str> {
        self.annotation(NODE_NAME_ANNOTATION).or(self.node_ref.as_deref())
    }
}

/// Trait abstracting machine list/patch operations
///
/// Allows mocking the CAPI machine API in tests while using the real
/// dynamic client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// List the machines belonging to a cluster, sorted by name
    async fn list_machines(&self, namespace: &str, cluster_name: &str)
        -> Result<Vec<Machine>, Error>;

    /// Set or clear (value `None`) a label on a machine
    async fn set_label(
        &self,
        machine: &Machine,
        key: &str,
        value: Option<String>,
    ) -> Result<(), Error>;

    /// Set or clear (value `None`) an annotation on a machine
    async fn set_annotation(
        &self,
        machine: &Machine,
        key: &str,
        value: Option<String>,
    ) -> Result<(), Error>;
}

/// Real machine client using the dynamic CAPI Machine API
pub struct CapiMachineClient {
    client: Client,
    resource: ApiResource,
}

impl CapiMachineClient {
    /// Create a client for the `cluster.x-k8s.io/v1beta1` Machine resource
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Machine");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    async fn patch_metadata(
        &self,
        machine: &Machine,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        self.api(&machine.namespace)
            .patch(
                &machine.name,
                &PatchParams::apply("trellis-planner"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MachineClient for CapiMachineClient {
    async fn list_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        let params =
            ListParams::default().labels(&format!("{CAPI_CLUSTER_LABEL}={cluster_name}"));
        let list = self.api(namespace).list(&params).await?;

        let mut machines = list
            .items
            .iter()
            .map(Machine::from_dynamic)
            .collect::<Result<Vec<_>, _>>()?;
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    async fn set_label(
        &self,
        machine: &Machine,
        key: &str,
        value: Option<String>,
    ) -> Result<(), Error> {
        self.patch_metadata(machine, json!({ "metadata": { "labels": { key: value } } }))
            .await
    }

    async fn set_annotation(
        &self,
        machine: &Machine,
        key: &str,
        value: Option<String>,
    ) -> Result<(), Error> {
        self.patch_metadata(
            machine,
            json!({ "metadata": { "annotations": { key: value } } }),
        )
        .await
    }
}

/// Format at most three names plus a count of the remainder
///
/// Keeps status messages stable on large clusters: "a, b, c and 12 more".
pub fn detail_names(names: &[String]) -> String {
    const SHOWN: usize = 3;
    if names.len() <= SHOWN {
        names.join(", ")
    } else {
        format!(
            "{} and {} more",
            names[..SHOWN].join(", "),
            names.len() - SHOWN
        )
    }
}
