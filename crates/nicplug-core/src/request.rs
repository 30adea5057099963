use serde::{Deserialize, Serialize};

use crate::instance::VmRef;
use crate::template::DesiredConfiguration;

/// What a live instance has to change to match its VM's template.
///
/// Ephemeral: computed from a diff right before delivery and consumed by
/// exactly one strategy run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugRequest {
    pub vm: VmRef,
    /// Interfaces to attach, in template order.
    pub plug: Vec<String>,
    /// Interfaces to detach.
    pub unplug: Vec<String>,
    /// The template the instance should end up wired for.
    pub desired: DesiredConfiguration,
}

impl HotplugRequest {
    /// Diff a live instance's spec against the desired template.
    ///
    /// Plug: present in desired, and missing or absent on the instance.
    /// Unplug: absent (or gone) in desired, present on the instance.
    /// Only secondary networks take part; the primary interface is never
    /// hotplugged.
    pub fn between(vm: VmRef, instance: &DesiredConfiguration, desired: &DesiredConfiguration) -> Self {
        let live: Vec<&str> = instance
            .secondary_interfaces()
            .iter()
            .map(|(_, i)| i.name.as_str())
            .collect();
        let wanted: Vec<&str> = desired
            .secondary_interfaces()
            .iter()
            .map(|(_, i)| i.name.as_str())
            .collect();

        let plug = wanted
            .iter()
            .filter(|n| !live.contains(n))
            .map(|n| n.to_string())
            .collect();
        let unplug = live
            .iter()
            .filter(|n| !wanted.contains(n))
            .map(|n| n.to_string())
            .collect();

        Self {
            vm,
            plug,
            unplug,
            desired: desired.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plug.is_empty() && self.unplug.is_empty()
    }
}

impl std::fmt::Display for HotplugRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: plug [{}] unplug [{}]",
            self.vm,
            self.plug.join(", "),
            self.unplug.join(", ")
        )
    }
}
