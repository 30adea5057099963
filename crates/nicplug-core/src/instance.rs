use serde::{Deserialize, Serialize};

use crate::status::ObservedInterfaceStatus;
use crate::template::DesiredConfiguration;

/// Namespace + name address of a VM (and of its instance, which shares it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub namespace: String,
    pub name: String,
}

impl VmRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Changes whenever the object is recreated (restart, migration).
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store on every accepted write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn vm_ref(&self) -> VmRef {
        VmRef::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Whether an instance should be running for this VM.
    #[serde(default)]
    pub running: bool,
    pub template: DesiredConfiguration,
}

/// The long-lived VM object holding the desired configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub metadata: ObjectMeta,
    pub spec: VmSpec,
}

impl VirtualMachine {
    pub fn template(&self) -> &DesiredConfiguration {
        &self.spec.template
    }
}

/// Instance lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstancePhase {
    #[default]
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
}

impl InstancePhase {
    /// Created but not yet Running. It will reach Running without outside help.
    pub fn is_starting(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub node_name: String,
    /// Written only by the backend's information sources.
    #[serde(default)]
    pub interfaces: Vec<ObservedInterfaceStatus>,
}

/// A running incarnation of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInstance {
    pub metadata: ObjectMeta,
    /// The configuration the instance is currently wired for.
    pub spec: DesiredConfiguration,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl VmInstance {
    pub fn is_running(&self) -> bool {
        self.status.phase == InstancePhase::Running
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Status entries for the spec's non-default secondary networks only.
    /// The primary interface and anything not in the spec are ignored.
    pub fn secondary_statuses(&self) -> Vec<ObservedInterfaceStatus> {
        self.status
            .interfaces
            .iter()
            .filter(|s| {
                self.spec
                    .network(&s.name)
                    .is_some_and(|n| n.is_secondary())
            })
            .cloned()
            .collect()
    }
}
