//! Trellis - declarative lifecycle planner for multi-node distro clusters
//!
//! Trellis converges Kubernetes-distribution clusters (control-plane, etcd,
//! and worker machines) from a declarative `TrellisCluster` spec to a
//! running state. For every machine it computes the instructions, files,
//! and probes the machine's local agent must apply, persists that desired
//! state, and advances the cluster through ordered tiers (bootstrap etcd,
//! etcd, control plane, worker) under bounded-unavailability and safe-drain
//! constraints. Long-lived operations (etcd snapshot create/restore,
//! certificate rotation, encryption-key rotation) run as independent phase
//! state machines ahead of any tier work.
//!
//! Everything is built on eventually-consistent, at-least-once-delivered
//! watch events: no pass ever blocks, every phase transition is a pure
//! function of spec and status, and all state is re-derived on every pass.
//!
//! # Modules
//!
//! - [`crd`] - the TrellisCluster CRD and its spec/status types
//! - [`machine`] - typed view over CAPI machines and the annotation protocol
//! - [`planner`] - the reconciliation engine (the core of this crate)
//! - [`controller`] - kube-runtime wiring and requeue policy
//! - [`retry`] - bounded backoff for store writes
//! - [`error`] - the waiting/ignorable/hard error taxonomy

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod machine;
pub mod planner;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
