use serde::{Deserialize, Serialize};

/// Name of the pod network attachment every VM starts with.
pub const DEFAULT_POD_NETWORK: &str = "default";

/// Where a network attachment gets its connectivity from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkSource {
    /// The cluster pod network. Always the primary interface.
    Pod {},
    /// An externally defined network, addressed by attachment reference.
    Secondary(SecondaryNetwork),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryNetwork {
    /// Name of the network attachment definition, e.g. "skynet".
    pub attachment_ref: String,
    /// A default secondary network replaces the pod network as primary.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// A named network an interface can bind to. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub name: String,
    #[serde(flatten)]
    pub source: NetworkSource,
}

impl NetworkAttachment {
    /// The pod network attachment named "default".
    pub fn default_pod() -> Self {
        Self {
            name: DEFAULT_POD_NETWORK.to_string(),
            source: NetworkSource::Pod {},
        }
    }

    /// A non-default secondary attachment.
    pub fn secondary(name: &str, attachment_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            source: NetworkSource::Secondary(SecondaryNetwork {
                attachment_ref: attachment_ref.to_string(),
                default: false,
            }),
        }
    }

    /// True for secondary networks that are not flagged as the primary.
    /// Only these are hotplug targets and get `ethN` ordinals.
    pub fn is_secondary(&self) -> bool {
        matches!(&self.source, NetworkSource::Secondary(s) if !s.default)
    }

    pub fn attachment_ref(&self) -> Option<&str> {
        match &self.source {
            NetworkSource::Secondary(s) => Some(&s.attachment_ref),
            NetworkSource::Pod {} => None,
        }
    }
}

/// Find a network by name.
pub fn lookup_network<'a>(
    networks: &'a [NetworkAttachment],
    name: &str,
) -> Option<&'a NetworkAttachment> {
    networks.iter().find(|n| n.name == name)
}
