use serde::Serialize;
use tabled::Tabled;

use nicplug_controller::controller::InterfaceReport;
use nicplug_core::audit::AuditEntry;
use nicplug_core::status::ObservedInterfaceStatus;

fn or_dash(v: Option<&str>) -> String {
    v.filter(|s| !s.is_empty()).unwrap_or("-").to_string()
}

/// Row for the per-interface convergence view.
#[derive(Debug, Serialize, Tabled)]
pub struct InterfaceRow {
    #[tabled(rename = "INTERFACE")]
    pub name: String,
    #[tabled(rename = "STATE")]
    pub state: String,
    #[tabled(rename = "PHASE")]
    pub phase: String,
    #[tabled(rename = "DEVICE")]
    pub device: String,
    #[tabled(rename = "MAC")]
    pub mac: String,
}

impl From<&InterfaceReport> for InterfaceRow {
    fn from(r: &InterfaceReport) -> Self {
        Self {
            name: r.name.clone(),
            state: r.state.to_string(),
            phase: r.phase.to_string(),
            device: or_dash(r.device.as_deref()),
            mac: or_dash(r.mac.as_deref()),
        }
    }
}

/// Row for observed interface status on an instance.
#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    #[tabled(rename = "INTERFACE")]
    pub name: String,
    #[tabled(rename = "DEVICE")]
    pub device: String,
    #[tabled(rename = "MAC")]
    pub mac: String,
    #[tabled(rename = "QUEUES")]
    pub queues: u32,
    #[tabled(rename = "SOURCES")]
    pub sources: String,
}

impl From<&ObservedInterfaceStatus> for StatusRow {
    fn from(s: &ObservedInterfaceStatus) -> Self {
        Self {
            name: s.name.clone(),
            device: or_dash(Some(&s.interface_name)),
            mac: or_dash(Some(&s.mac)),
            queues: s.queue_count,
            sources: s.info_source.to_string(),
        }
    }
}

/// Row for the audit trail.
#[derive(Debug, Serialize, Tabled)]
pub struct AuditRow {
    #[tabled(rename = "TIME")]
    pub timestamp: String,
    #[tabled(rename = "VM")]
    pub vm: String,
    #[tabled(rename = "INTERFACE")]
    pub interface: String,
    #[tabled(rename = "ACTION")]
    pub action: String,
    #[tabled(rename = "DETAIL")]
    pub detail: String,
}

impl From<&AuditEntry> for AuditRow {
    fn from(e: &AuditEntry) -> Self {
        Self {
            timestamp: e.timestamp.clone(),
            vm: format!("{}/{}", e.namespace, e.vm),
            interface: or_dash(e.interface.as_deref()),
            action: format!("{:?}", e.action),
            detail: or_dash(e.detail.as_deref()),
        }
    }
}
