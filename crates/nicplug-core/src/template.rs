use serde::{Deserialize, Serialize};

use crate::error::{HotplugError, Result};
use crate::iface::{InterfaceSpec, lookup_interface};
use crate::network::{NetworkAttachment, lookup_network};

/// The desired (network, interface) lists of a VM template.
///
/// Order matters: secondary device names are assigned by position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredConfiguration {
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

impl DesiredConfiguration {
    /// A template with only the masquerade-bound pod network.
    pub fn with_pod_network() -> Self {
        let net = NetworkAttachment::default_pod();
        let iface = InterfaceSpec::default_masquerade(&net.name);
        Self {
            networks: vec![net],
            interfaces: vec![iface],
        }
    }

    /// Builder helper: append a network/interface pair.
    pub fn with_pair(mut self, network: NetworkAttachment, iface: InterfaceSpec) -> Self {
        self.networks.push(network);
        self.interfaces.push(iface);
        self
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceSpec> {
        lookup_interface(&self.interfaces, name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkAttachment> {
        lookup_network(&self.networks, name)
    }

    /// Non-absent interfaces whose network is a non-default secondary,
    /// in template order. These are the hotplug-managed interfaces.
    pub fn secondary_interfaces(&self) -> Vec<(&NetworkAttachment, &InterfaceSpec)> {
        self.interfaces
            .iter()
            .filter(|i| !i.is_absent())
            .filter_map(|i| self.network(&i.name).map(|n| (n, i)))
            .filter(|(n, _)| n.is_secondary())
            .collect()
    }

    /// Check the structural invariants of the template.
    ///
    /// Names are unique per list and every present interface has exactly one
    /// network with the same name.
    pub fn validate(&self, vm: &str) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for net in &self.networks {
            if !seen.insert(net.name.as_str()) {
                return Err(HotplugError::invalid(
                    vm,
                    &net.name,
                    "network name appears more than once",
                ));
            }
        }
        seen.clear();
        for iface in &self.interfaces {
            if !seen.insert(iface.name.as_str()) {
                return Err(HotplugError::invalid(
                    vm,
                    &iface.name,
                    "interface name appears more than once",
                ));
            }
            if !iface.is_absent() && self.network(&iface.name).is_none() {
                return Err(HotplugError::invalid(
                    vm,
                    &iface.name,
                    "present interface has no matching network",
                ));
            }
        }
        Ok(())
    }
}
