use serde::{Deserialize, Serialize};

use crate::error::{HotplugError, Result};
use crate::iface::InterfaceSpec;
use crate::status::{InfoSources, ObservedInterfaceStatus};

/// Per-interface hotplug phase, derived from desired spec and observed status.
///
/// Add:    Absent -> Requested -> Confirmed
/// Remove: Confirmed -> PendingAbsent -> Absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfacePhase {
    /// Not desired and not live.
    Absent,
    /// Desired present, not yet confirmed by every source.
    Requested,
    /// Desired present and confirmed by every required source.
    Confirmed,
    /// Marked absent but still reported on the instance.
    PendingAbsent,
}

impl std::fmt::Display for InterfacePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Requested => write!(f, "requested"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::PendingAbsent => write!(f, "pending-absent"),
        }
    }
}

/// Derive the phase of one interface.
pub fn derive_phase(
    spec: Option<&InterfaceSpec>,
    status: Option<&ObservedInterfaceStatus>,
    required: &InfoSources,
) -> InterfacePhase {
    let desired = spec.is_some_and(|s| !s.is_absent());
    match (desired, status) {
        (true, Some(s)) if s.is_fully_reported(required) => InterfacePhase::Confirmed,
        (true, _) => InterfacePhase::Requested,
        (false, Some(_)) => InterfacePhase::PendingAbsent,
        (false, None) => InterfacePhase::Absent,
    }
}

/// Validate that a phase transition is allowed.
pub fn validate_transition(iface: &str, from: InterfacePhase, to: InterfacePhase) -> Result<()> {
    use InterfacePhase::*;

    if from == to {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Plug requested (new episode after a removal too)
        (Absent, Requested)
        // All sources agree
        | (Requested, Confirmed)
        // A source dropped the device again before removal
        | (Confirmed, Requested)
        // Unplug requested
        | (Confirmed, PendingAbsent)
        // Unplug requested before confirmation
        | (Requested, PendingAbsent)
        // Removed before anything was reported
        | (Requested, Absent)
        // Last source withdrew
        | (PendingAbsent, Absent)
    );

    if valid {
        Ok(())
    } else {
        Err(HotplugError::invalid(
            "-",
            iface,
            format!("invalid interface transition: {} -> {}", from, to),
        ))
    }
}
