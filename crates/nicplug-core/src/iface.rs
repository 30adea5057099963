use serde::{Deserialize, Serialize};

/// How the guest NIC is wired to its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingMethod {
    Bridge,
    Masquerade,
    Sriov,
}

impl BindingMethod {
    /// Only bridge-bound interfaces can be hotplugged onto a secondary network.
    pub fn supports_hotplug(self) -> bool {
        matches!(self, Self::Bridge)
    }
}

impl std::fmt::Display for BindingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Masquerade => write!(f, "masquerade"),
            Self::Sriov => write!(f, "sriov"),
        }
    }
}

/// Desired presence of an interface.
///
/// `Absent` is a tombstone: the entry stays in the interface list so that
/// removal is idempotent and the history of the template stays readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceState {
    #[default]
    Present,
    Absent,
}

impl InterfaceState {
    pub fn is_present(&self) -> bool {
        *self == Self::Present
    }
}

impl std::fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present => write!(f, "present"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// A guest network interface in a template. Identity is the name, which
/// matches the name of its `NetworkAttachment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    pub name: String,
    pub binding: BindingMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "InterfaceState::is_present")]
    pub state: InterfaceState,
}

impl InterfaceSpec {
    /// The masquerade-bound primary interface on the pod network.
    pub fn default_masquerade(name: &str) -> Self {
        Self {
            name: name.to_string(),
            binding: BindingMethod::Masquerade,
            mac_address: None,
            state: InterfaceState::Present,
        }
    }

    pub fn bridge(name: &str) -> Self {
        Self {
            name: name.to_string(),
            binding: BindingMethod::Bridge,
            mac_address: None,
            state: InterfaceState::Present,
        }
    }

    pub fn with_mac(mut self, mac: &str) -> Self {
        self.mac_address = Some(mac.to_string());
        self
    }

    pub fn is_absent(&self) -> bool {
        self.state == InterfaceState::Absent
    }
}

/// Find an interface by name.
pub fn lookup_interface<'a>(ifaces: &'a [InterfaceSpec], name: &str) -> Option<&'a InterfaceSpec> {
    ifaces.iter().find(|i| i.name == name)
}

/// Interfaces that are not tombstoned.
pub fn present_interfaces(ifaces: &[InterfaceSpec]) -> impl Iterator<Item = &InterfaceSpec> {
    ifaces.iter().filter(|i| !i.is_absent())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_state_is_omitted_from_json() {
        let iface = InterfaceSpec::bridge("iface1");
        let json = serde_json::to_value(&iface).unwrap();
        assert_eq!(json, serde_json::json!({"name": "iface1", "binding": "bridge"}));

        let parsed: InterfaceSpec = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.state, InterfaceState::Present);
    }

    #[test]
    fn test_absent_state_is_serialized() {
        let mut iface = InterfaceSpec::bridge("blue");
        iface.state = InterfaceState::Absent;
        let json = serde_json::to_string(&iface).unwrap();
        assert!(json.contains("\"state\":\"absent\""));
    }

    #[test]
    fn test_only_bridge_supports_hotplug() {
        assert!(BindingMethod::Bridge.supports_hotplug());
        assert!(!BindingMethod::Masquerade.supports_hotplug());
        assert!(!BindingMethod::Sriov.supports_hotplug());
    }

    #[test]
    fn test_present_interfaces_skips_tombstones() {
        let mut blue = InterfaceSpec::bridge("blue");
        blue.state = InterfaceState::Absent;
        let ifaces = vec![InterfaceSpec::bridge("red"), blue];
        let names: Vec<&str> = present_interfaces(&ifaces).map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["red"]);
        assert!(lookup_interface(&ifaces, "blue").unwrap().is_absent());
    }
}
