//! Error taxonomy for hotplug operations.
//!
//! Every variant carries the VM it concerns and, where one applies, the
//! interface name, so a caller can retry or diagnose without re-reading logs.

use thiserror::Error;

pub type Result<T, E = HotplugError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HotplugError {
    /// A conditional patch's `test` operation did not match the stored
    /// object. Nothing was applied; re-read and retry.
    #[error("conflict patching {vm} at {path}: object changed since it was read")]
    Conflict { vm: String, path: String },

    /// Duplicate add, removal of an unknown or already-absent interface,
    /// or a malformed request. Never retried.
    #[error("invalid request for {vm}, interface {iface}: {reason}")]
    InvalidRequest {
        vm: String,
        iface: String,
        reason: String,
    },

    /// A bounded wait ran out. The desired state is left as requested.
    #[error("timed out after {waited_secs}s waiting for {vm}: {what} (expected {expected}, observed {observed})")]
    ConvergenceTimeout {
        vm: String,
        what: String,
        expected: String,
        observed: String,
        waited_secs: u64,
    },

    /// The migration subsystem reported a terminal failure.
    #[error("migration {migration_id} of {vm} failed: {reason}")]
    MigrationFailed {
        vm: String,
        migration_id: String,
        reason: String,
        /// Whether the source instance was verified unchanged afterwards.
        source_preserved: bool,
    },

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("backend error [{context}]: {message}")]
    Backend {
        context: String,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HotplugError {
    pub fn conflict(vm: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Conflict {
            vm: vm.into(),
            path: path.into(),
        }
    }

    pub fn invalid(vm: impl Into<String>, iface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            vm: vm.into(),
            iface: iface.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(
        vm: impl Into<String>,
        what: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
        waited_secs: u64,
    ) -> Self {
        Self::ConvergenceTimeout {
            vm: vm.into(),
            what: what.into(),
            expected: expected.into(),
            observed: observed.into(),
            waited_secs,
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// A transient backend failure (transport, throttling).
    pub fn backend(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            context: context.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A backend failure that will not go away by retrying.
    pub fn backend_permanent(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            context: context.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether re-reading and retrying the operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Backend { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
