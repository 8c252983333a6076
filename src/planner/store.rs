//! Per-machine plan persistence
//!
//! Each machine has one plan record (a Secret) that the planner writes the
//! desired [`NodePlan`] into and the on-node agent writes applied state back
//! into. The record store is an explicit key-value interface with a version
//! token, so the underlying store's conflict semantics are a contract rather
//! than an accident of the Secret API.
//!
//! The in-sync rule is deliberately narrow: a machine is in sync **iff** the
//! stored `plan` bytes equal the stored `appliedPlan` bytes. Nothing else
//! (not the checksum, not probe health) ever promotes a machine to in-sync.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::machine::{Machine, BOOTSTRAP_KIND};
use crate::planner::plan::NodePlan;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Record field: serialized desired plan
pub const FIELD_PLAN: &str = "plan";
/// Record field: serialized plan last confirmed by the agent
pub const FIELD_APPLIED_PLAN: &str = "appliedPlan";
/// Record field: hash of `plan` as last observed by the agent
pub const FIELD_APPLIED_CHECKSUM: &str = "applied-checksum";
/// Record field: compressed captured one-time instruction output
pub const FIELD_APPLIED_OUTPUT: &str = "applied-output";
/// Record field: compressed captured periodic instruction output
pub const FIELD_APPLIED_PERIODIC_OUTPUT: &str = "applied-periodic-output";
/// Record field: consecutive apply failures reported by the agent
pub const FIELD_FAILURE_COUNT: &str = "failure-count";
/// Record field: failure budget before the machine is considered failed
pub const FIELD_MAX_FAILURES: &str = "max-failures";

/// Default failure budget written with every plan
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Raw persisted state of one machine's plan record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanRecord {
    /// Store version token; `None` means the record does not exist yet
    pub version: Option<String>,
    /// Serialized desired plan
    pub plan: Vec<u8>,
    /// Serialized applied plan, written by the agent
    pub applied_plan: Vec<u8>,
    /// Checksum of `plan` as last observed by the agent
    pub applied_checksum: String,
    /// Gzip-compressed JSON map of captured instruction output
    pub applied_output: Vec<u8>,
    /// Gzip-compressed JSON map of captured periodic instruction output
    pub applied_periodic_output: Vec<u8>,
    /// Consecutive apply failures
    pub failure_count: u32,
    /// Failure budget; 0 disables failure tracking
    pub max_failures: u32,
}

/// Key-value store holding one record per machine
///
/// `put` must fail when the caller's version token no longer matches the
/// stored record, and return the new token on success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlanRecordStore: Send + Sync {
    /// Read a machine's record, `None` if it does not exist
    async fn get(&self, namespace: &str, machine: &str) -> Result<Option<PlanRecord>, Error>;

    /// Write a machine's record, compare-and-swap on `record.version`
    async fn put(
        &self,
        namespace: &str,
        machine: &str,
        record: &PlanRecord,
    ) -> Result<PlanRecord, Error>;
}

/// Output captured from one instruction
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstructionOutput {
    /// Process exit code
    #[serde(default)]
    pub exit_code: i32,
    /// Base64-encoded stdout
    #[serde(default)]
    pub stdout: String,
    /// Base64-encoded stderr
    #[serde(default)]
    pub stderr: String,
    /// RFC 3339 timestamp of the last successful run, for periodic output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_run: Option<String>,
}

impl InstructionOutput {
    /// Decoded stdout
    pub fn stdout_bytes(&self) -> Result<Vec<u8>, Error> {
        STANDARD
            .decode(&self.stdout)
            .map_err(|e| Error::decode("stdout", e.to_string()))
    }

    /// Decoded stdout as a lossy string
    pub fn stdout_string(&self) -> Result<String, Error> {
        Ok(String::from_utf8_lossy(&self.stdout_bytes()?).into_owned())
    }
}

/// Decoded plan state of one machine
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// Last-written desired plan
    pub plan: NodePlan,
    /// Last plan the agent confirmed applied, if any
    pub applied_plan: Option<NodePlan>,
    /// Stored plan bytes equal stored applied-plan bytes
    pub in_sync: bool,
    /// Failure budget exhausted while out of sync
    pub failed: bool,
    /// Captured one-time instruction output keyed by instruction name
    pub output: BTreeMap<String, InstructionOutput>,
    /// Captured periodic instruction output keyed by instruction name
    pub periodic_output: BTreeMap<String, InstructionOutput>,
}

impl Node {
    /// Decode a node from its persisted record
    ///
    /// Returns `None` when no plan has ever been written: a machine without
    /// a plan is never "in sync by vacuity".
    pub fn from_record(record: &PlanRecord) -> Result<Option<Self>, Error> {
        if record.plan.is_empty() {
            return Ok(None);
        }

        let plan = NodePlan::from_bytes(&record.plan)?;
        let applied_plan = if record.applied_plan.is_empty() {
            None
        } else {
            Some(NodePlan::from_bytes(&record.applied_plan)?)
        };

        let in_sync = !record.applied_plan.is_empty() && record.plan == record.applied_plan;
        let failed =
            !in_sync && record.max_failures > 0 && record.failure_count >= record.max_failures;

        Ok(Some(Self {
            plan,
            applied_plan,
            in_sync,
            failed,
            output: decode_output(FIELD_APPLIED_OUTPUT, &record.applied_output)?,
            periodic_output: decode_output(
                FIELD_APPLIED_PERIODIC_OUTPUT,
                &record.applied_periodic_output,
            )?,
        }))
    }
}

fn decode_output(
    field: &str,
    compressed: &[u8],
) -> Result<BTreeMap<String, InstructionOutput>, Error> {
    if compressed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let mut decoder = GzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::decode(field, e.to_string()))?;

    serde_json::from_slice(&raw).map_err(|e| Error::decode(field, e.to_string()))
}

/// One machine's state within a single reconciliation pass
///
/// Ephemeral: rebuilt from the API and the record store every pass, never
/// persisted.
#[derive(Clone, Debug)]
pub struct PlanEntry {
    /// The machine
    pub machine: Machine,
    /// The machine's decoded plan state, if a plan was ever written
    pub node: Option<Node>,
}

impl PlanEntry {
    /// Machine name
    pub fn name(&self) -> &str {
        &self.machine.name
    }

    /// True once the agent confirmed the current plan byte-for-byte
    pub fn in_sync(&self) -> bool {
        self.node.as_ref().is_some_and(|n| n.in_sync)
    }

    /// True when the machine exhausted its failure budget
    pub fn failed(&self) -> bool {
        self.node.as_ref().is_some_and(|n| n.failed)
    }
}

/// All machines and plan state for one cluster, loaded once per pass
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Entries keyed (and therefore ordered) by machine name
    pub entries: BTreeMap<String, PlanEntry>,
}

impl Plan {
    /// The entry carrying the init-node mark, if exactly one exists
    pub fn init_node(&self) -> Option<&PlanEntry> {
        let mut marked = self.entries.values().filter(|e| e.machine.is_init_node());
        match (marked.next(), marked.next()) {
            (Some(entry), None) => Some(entry),
            _ => None,
        }
    }

    /// Total number of machines in the cluster
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the cluster has no machines yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads and writes per-machine plan state
pub struct PlanStore {
    records: Arc<dyn PlanRecordStore>,
    retry: RetryConfig,
}

impl PlanStore {
    /// Create a store over the given record backend
    pub fn new(records: Arc<dyn PlanRecordStore>) -> Self {
        Self {
            records,
            retry: RetryConfig::default(),
        }
    }

    /// Load the full plan snapshot for one cluster
    ///
    /// Decode failure of any record is a hard error: the planner must not
    /// overwrite state it cannot read.
    pub async fn load(&self, machines: Vec<Machine>) -> Result<Plan, Error> {
        let mut entries = BTreeMap::new();

        for machine in machines {
            let node = match self.records.get(&machine.namespace, &machine.name).await? {
                Some(record) => Node::from_record(&record)?,
                None => None,
            };
            entries.insert(machine.name.clone(), PlanEntry { machine, node });
        }

        Ok(Plan { entries })
    }

    /// Write a machine's desired plan
    ///
    /// Serializes the plan, writes it through the record store (retrying
    /// version conflicts), and invalidates the entry's in-sync state until
    /// the agent completes a checksum round trip. Callers must not invoke
    /// this more than once per logical desired-state change per pass.
    pub async fn update_plan(
        &self,
        entry: &mut PlanEntry,
        desired: &NodePlan,
        max_failures: u32,
    ) -> Result<(), Error> {
        if entry.machine.bootstrap_kind != BOOTSTRAP_KIND {
            return Err(Error::validation(format!(
                "machine {} uses bootstrap kind {:?}, expected {BOOTSTRAP_KIND}",
                entry.name(),
                entry.machine.bootstrap_kind,
            )));
        }

        let bytes = desired.to_bytes()?;
        let namespace = entry.machine.namespace.clone();
        let name = entry.name().to_string();

        let written = retry_with_backoff(&self.retry, "update_plan", || async {
            let mut record = self
                .records
                .get(&namespace, &name)
                .await?
                .unwrap_or_default();
            record.plan = bytes.clone();
            record.max_failures = max_failures;
            record.failure_count = 0;
            self.records.put(&namespace, &name, &record).await
        })
        .await?;

        debug!(machine = %name, version = ?written.version, "plan updated");

        // The write invalidates in-sync until the agent round-trips the new
        // checksum; reflect that in the pass-local view immediately.
        entry.node = Node::from_record(&written)?;
        Ok(())
    }

    /// Write `desired` unless it is already the machine's current plan
    ///
    /// Returns whether a write happened. This is the once-per-change guard
    /// the phase machines rely on: re-entering with an unchanged desired
    /// plan performs no store write.
    pub async fn ensure_plan(
        &self,
        entry: &mut PlanEntry,
        desired: &NodePlan,
        max_failures: u32,
    ) -> Result<bool, Error> {
        if entry.node.as_ref().is_some_and(|n| n.plan == *desired) {
            return Ok(false);
        }
        self.update_plan(entry, desired, max_failures).await?;
        Ok(true)
    }
}

/// SHA-256 checksum of plan bytes, as the agent reports it
pub fn plan_checksum(bytes: &[u8]) -> String {
    use aws_lc_rs::digest::{digest, SHA256};
    let hash = digest(&SHA256, bytes);
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Real record store backed by one Secret per machine
pub struct SecretPlanRecordStore {
    client: Client,
}

impl SecretPlanRecordStore {
    /// Secret name suffix for plan records
    const SUFFIX: &'static str = "machine-plan";

    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secret_name(machine: &str) -> String {
        format!("{machine}-{}", Self::SUFFIX)
    }

    fn decode(secret: &Secret) -> PlanRecord {
        fn bytes(data: Option<&BTreeMap<String, ByteString>>, key: &str) -> Vec<u8> {
            data.and_then(|d| d.get(key)).map(|b| b.0.clone()).unwrap_or_default()
        }
        fn number(data: Option<&BTreeMap<String, ByteString>>, key: &str) -> u32 {
            data.and_then(|d| d.get(key))
                .and_then(|b| std::str::from_utf8(&b.0).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        }

        let data = secret.data.as_ref();
        PlanRecord {
            version: secret.metadata.resource_version.clone(),
            plan: bytes(data, FIELD_PLAN),
            applied_plan: bytes(data, FIELD_APPLIED_PLAN),
            applied_checksum: String::from_utf8_lossy(&bytes(data, FIELD_APPLIED_CHECKSUM))
                .into_owned(),
            applied_output: bytes(data, FIELD_APPLIED_OUTPUT),
            applied_periodic_output: bytes(data, FIELD_APPLIED_PERIODIC_OUTPUT),
            failure_count: number(data, FIELD_FAILURE_COUNT),
            max_failures: number(data, FIELD_MAX_FAILURES),
        }
    }

    fn encode(namespace: &str, machine: &str, record: &PlanRecord) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(FIELD_PLAN.to_string(), ByteString(record.plan.clone()));
        if !record.applied_plan.is_empty() {
            data.insert(
                FIELD_APPLIED_PLAN.to_string(),
                ByteString(record.applied_plan.clone()),
            );
        }
        if !record.applied_checksum.is_empty() {
            data.insert(
                FIELD_APPLIED_CHECKSUM.to_string(),
                ByteString(record.applied_checksum.clone().into_bytes()),
            );
        }
        data.insert(
            FIELD_MAX_FAILURES.to_string(),
            ByteString(record.max_failures.to_string().into_bytes()),
        );
        data.insert(
            FIELD_FAILURE_COUNT.to_string(),
            ByteString(record.failure_count.to_string().into_bytes()),
        );

        Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(machine)),
                namespace: Some(namespace.to_string()),
                resource_version: record.version.clone(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PlanRecordStore for SecretPlanRecordStore {
    async fn get(&self, namespace: &str, machine: &str) -> Result<Option<PlanRecord>, Error> {
        let secret = self
            .api(namespace)
            .get_opt(&Self::secret_name(machine))
            .await?;
        Ok(secret.as_ref().map(Self::decode))
    }

    async fn put(
        &self,
        namespace: &str,
        machine: &str,
        record: &PlanRecord,
    ) -> Result<PlanRecord, Error> {
        let api = self.api(namespace);
        let secret = Self::encode(namespace, machine, record);

        let written = if record.version.is_none() {
            api.create(&PostParams::default(), &secret).await?
        } else {
            // resourceVersion in the payload makes this a compare-and-swap:
            // the API server rejects the write with a conflict if the record
            // moved underneath us.
            api.patch(
                &Self::secret_name(machine),
                &PatchParams::default(),
                &Patch::Merge(&secret),
            )
            .await?
        };

        Ok(Self::decode(&written))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory record store shared by planner tests

    use super::*;
    use std::sync::Mutex;

    /// In-memory [`PlanRecordStore`] with version-token semantics
    #[derive(Default)]
    pub struct MemoryRecordStore {
        records: Mutex<BTreeMap<String, PlanRecord>>,
    }

    impl MemoryRecordStore {
        fn key(namespace: &str, machine: &str) -> String {
            format!("{namespace}/{machine}")
        }

        /// Simulate the agent confirming the current plan byte-for-byte
        pub fn agent_apply(&self, namespace: &str, machine: &str) {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(&Self::key(namespace, machine)) {
                record.applied_plan = record.plan.clone();
                record.applied_checksum = plan_checksum(&record.plan);
            }
        }

        /// Simulate the agent reporting periodic output for one instruction
        pub fn agent_periodic_output(
            &self,
            namespace: &str,
            machine: &str,
            instruction: &str,
            stdout: &str,
        ) {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::io::Write;

            let output = BTreeMap::from([(
                instruction.to_string(),
                InstructionOutput {
                    exit_code: 0,
                    stdout: STANDARD.encode(stdout.as_bytes()),
                    ..Default::default()
                },
            )]);

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&serde_json::to_vec(&output).unwrap())
                .unwrap();

            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(&Self::key(namespace, machine)) {
                record.applied_periodic_output = encoder.finish().unwrap();
            }
        }

        /// Simulate repeated agent failures against the current plan
        pub fn agent_fail(&self, namespace: &str, machine: &str, count: u32) {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(&Self::key(namespace, machine)) {
                record.failure_count = count;
            }
        }
    }

    #[async_trait]
    impl PlanRecordStore for MemoryRecordStore {
        async fn get(&self, namespace: &str, machine: &str) -> Result<Option<PlanRecord>, Error> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&Self::key(namespace, machine))
                .cloned())
        }

        async fn put(
            &self,
            namespace: &str,
            machine: &str,
            record: &PlanRecord,
        ) -> Result<PlanRecord, Error> {
            let mut records = self.records.lock().unwrap();
            let key = Self::key(namespace, machine);
            let current_version = records.get(&key).and_then(|r| r.version.clone());

            if record.version != current_version {
                return Err(Error::internal("store", "record version conflict"));
            }

            let mut written = record.clone();
            let next: u64 = current_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
                + 1;
            written.version = Some(next.to_string());
            records.insert(key, written.clone());
            Ok(written)
        }
    }
}
