//! NodePlan value types
//!
//! A NodePlan is the full desired state for one machine: ordered one-time
//! instructions, periodic instructions, files, and health probes. The
//! on-node agent consumes the serialized form; the planner only ever
//! compares plans for equality, so the serialized bytes are the contract.
//!
//! Rollout decisions hinge on the *kind* of difference between the current
//! and desired plan: a change confined to files flagged `minor` applies
//! immediately, anything else requires the drain handshake first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Desired state for one machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    /// One-time instructions, executed in order on every plan change
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<OneTimeInstruction>,

    /// Instructions re-executed on a fixed period
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periodic_instructions: Vec<PeriodicInstruction>,

    /// Files written before any instruction runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PlanFile>,

    /// Health probes keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probes: BTreeMap<String, Probe>,
}

/// A single one-shot instruction
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeInstruction {
    /// Instruction name, unique within the plan
    pub name: String,

    /// Command to execute; empty when the image entrypoint is used
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment in KEY=VALUE form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Image the agent extracts the payload from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Capture stdout/stderr into the record's applied output
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub save_output: bool,
}

/// An instruction re-executed on a period
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicInstruction {
    /// Instruction name, unique within the plan
    pub name: String,

    /// Command to execute
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment in KEY=VALUE form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Image the agent extracts the payload from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Capture stdout/stderr into the record's applied periodic output
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub save_output: bool,

    /// Seconds between executions
    pub period_seconds: u32,
}

/// A file the agent writes to the machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    /// Absolute path on the machine
    pub path: String,

    /// Base64-encoded file content
    pub content: String,

    /// File owner (defaults to root on the agent side)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Octal permission string (e.g. "0600")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,

    /// Content is re-resolved by the agent at apply time
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,

    /// Changes to this file alone never require a drain
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub minor: bool,
}

impl PlanFile {
    /// Create a file from raw content, base64-encoding it
    pub fn new(path: impl Into<String>, content: &[u8]) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        Self {
            path: path.into(),
            content: STANDARD.encode(content),
            ..Default::default()
        }
    }

    /// Mark the file minor and return self for chaining
    pub fn minor(mut self) -> Self {
        self.minor = true;
        self
    }

    /// Set permissions and return self for chaining
    pub fn permissions(mut self, perms: impl Into<String>) -> Self {
        self.permissions = Some(perms.into());
        self
    }
}

/// A health probe the agent evaluates against a local endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Probe URL (https probes present the client certificate)
    pub url: String,

    /// CA certificate path for https probes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,

    /// Client certificate path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_cert: String,

    /// Client key path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_key: String,

    /// Seconds to wait before the first evaluation
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_seconds: u32,

    /// Per-attempt timeout in seconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout_seconds: u32,

    /// Consecutive successes before the probe is healthy
    #[serde(default, skip_serializing_if = "is_zero")]
    pub success_threshold: u32,

    /// Consecutive failures before the probe is unhealthy
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failure_threshold: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Kind of difference between a current and desired plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanChange {
    /// Plans are identical
    None,
    /// Only minor-flagged files differ; applies without draining
    Minor,
    /// Anything else differs; requires the drain handshake
    Major,
}

impl NodePlan {
    /// Serialize to the persisted wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::decode("plan", e.to_string()))
    }

    /// Decode from the persisted wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::decode("plan", e.to_string()))
    }

    /// True when the plan has no content at all
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
            && self.periodic_instructions.is_empty()
            && self.files.is_empty()
            && self.probes.is_empty()
    }

    /// The plan with minor-flagged files stripped
    fn major_view(&self) -> NodePlan {
        let mut view = self.clone();
        view.files.retain(|f| !f.minor);
        view
    }

    /// Classify the difference between the current and desired plan
    pub fn classify_change(current: &NodePlan, desired: &NodePlan) -> PlanChange {
        if current == desired {
            PlanChange::None
        } else if current.major_view() == desired.major_view() {
            PlanChange::Minor
        } else {
            PlanChange::Major
        }
    }
}
