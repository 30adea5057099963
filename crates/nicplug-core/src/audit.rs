use serde::{Deserialize, Serialize};

/// Controller event types recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    InterfaceAddRequested,
    InterfaceRemoveRequested,
    TemplatePatched,
    PatchConflict,
    DeliveryStarted,
    InterfacesConverged,
    ConvergenceTimedOut,
    MigrationSucceeded,
    MigrationFailed,
    RestartRequested,
    InstanceReplaced,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub namespace: String,
    pub vm: String,
    pub interface: Option<String>,
    pub action: AuditAction,
    pub detail: Option<String>,
}
