//! Error types for the Trellis planner
//!
//! Errors fall into three families with different handling in the
//! reconciliation loop:
//!
//! - **Waiting**: an expected, transient condition ("waiting for plan to be
//!   applied"). Converted into a user-facing status message and a requeue;
//!   never a failure.
//! - **Ignorable**: a per-machine condition (stuck or non-ready machine)
//!   that is reported on status but must not block reconciliation of the
//!   remaining tiers.
//! - Hard errors: malformed persisted data, store API failures, invalid
//!   concurrency specs. Propagated to the caller and retried with the
//!   controller's standard backoff. Nothing is permanently fatal: all state
//!   is re-derived from spec and status on every pass.

use thiserror::Error;

/// Main error type for planner operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An expected condition that resolves on a later pass
    #[error("waiting: {reason}")]
    Waiting {
        /// What the planner is waiting for, in user-facing form
        reason: String,
    },

    /// A per-machine condition that must not block other tiers
    #[error("ignoring machine(s) {machines}: {reason}")]
    Ignorable {
        /// Affected machine names, pre-formatted
        machines: String,
        /// Why the machines are being ignored
        reason: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed persisted data (plan records, annotation payloads)
    #[error("decode error for {field}: {message}")]
    Decode {
        /// The record field or payload that failed to decode
        field: String,
        /// Description of what went wrong
        message: String,
    },

    /// Invalid concurrency / max-unavailable specification
    #[error("invalid max-unavailable value {value:?}: {message}")]
    InvalidConcurrency {
        /// The offending value as written in the spec
        value: String,
        /// Why it is invalid
        message: String,
    },

    /// Validation error for cluster or machine specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "planner", "store")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a waiting condition with the given user-facing reason
    pub fn waiting(reason: impl Into<String>) -> Self {
        Self::Waiting {
            reason: reason.into(),
        }
    }

    /// Create an ignorable per-machine condition
    pub fn ignorable(machines: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Ignorable {
            machines: machines.into(),
            reason: reason.into(),
        }
    }

    /// Create a decode error for a record field or payload
    pub fn decode(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-concurrency error
    pub fn invalid_concurrency(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConcurrency {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True for expected "not ready yet" conditions
    pub fn is_waiting(&self) -> bool {
        matches!(self, Error::Waiting { .. })
    }

    /// True for per-machine conditions that must not block later tiers
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::Ignorable { .. })
    }

    /// Check if this error is retryable
    ///
    /// Waiting and ignorable conditions always re-trigger. Hard errors retry
    /// with backoff except where a spec change is required to make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Waiting { .. } | Error::Ignorable { .. } => true,
            Error::Kube(source) => {
                // Don't hot-loop on 4xx errors; the watch event for the
                // corrected object re-triggers reconciliation.
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Decode { .. } => true,
            Error::InvalidConcurrency { .. } => false,
            Error::Validation(_) => false,
            Error::Internal { .. } => true,
        }
    }

    /// The user-facing status message for this error, if it has one
    ///
    /// Waiting and ignorable conditions carry a message meant for the
    /// cluster status; hard errors are reported through conditions instead.
    pub fn status_message(&self) -> Option<String> {
        match self {
            Error::Waiting { reason } => Some(format!("waiting: {reason}")),
            Error::Ignorable { machines, reason } => {
                Some(format!("ignoring machine(s) {machines}: {reason}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Taxonomy in the Reconciliation Loop
    // ==========================================================================
    //
    // The planner never sleeps. Every "not done yet" condition is a typed
    // return value the controller converts into a requeue; these tests pin
    // down which family each condition belongs to.

    /// Story: a tier that has not converged yet is a waiting condition
    ///
    /// Waiting errors carry the status message shown to the user and always
    /// re-trigger reconciliation.
    #[test]
    fn story_unconverged_tier_is_waiting_not_failure() {
        let err = Error::waiting("plan to be applied on machine(s) worker-1");
        assert!(err.is_waiting());
        assert!(!err.is_ignorable());
        assert!(err.is_retryable());
        assert_eq!(
            err.status_message().unwrap(),
            "waiting: plan to be applied on machine(s) worker-1"
        );
    }

    /// Story: one broken machine must not starve the other tiers
    ///
    /// A machine that exhausted its failure budget is reported through the
    /// ignorable path so the worker tier still converges.
    #[test]
    fn story_broken_machine_is_ignorable() {
        let err = Error::ignorable("etcd-2", "plan failed too many times");
        assert!(err.is_ignorable());
        assert!(!err.is_waiting());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("etcd-2"));
    }

    /// Story: malformed persisted data is a hard error, not a silent skip
    ///
    /// A plan record that no longer decodes means the store was corrupted or
    /// written by an incompatible version; reconciliation must stop and
    /// surface it rather than overwrite state it cannot read.
    #[test]
    fn story_corrupt_plan_record_is_hard_error() {
        let err = Error::decode("appliedPlan", "invalid JSON at byte 12");
        assert!(!err.is_waiting());
        assert!(!err.is_ignorable());
        assert!(err.is_retryable());
        assert!(err.status_message().is_none());
        assert!(err.to_string().contains("appliedPlan"));
    }

    /// Story: an invalid concurrency spec requires a spec fix, not a retry
    #[test]
    fn story_invalid_concurrency_is_not_retryable() {
        let err = Error::invalid_concurrency("15x", "not an integer or percentage");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("15x"));
    }

    /// Story: hard errors keep their context for debugging
    #[test]
    fn story_internal_errors_carry_context() {
        let err = Error::internal("store", "record version missing after write");
        assert!(err.to_string().contains("[store]"));
        assert!(err.is_retryable());
    }
}
