//! Boundary to the orchestration backend.
//!
//! The API server, the device backend, and the migration engine are external
//! collaborators. The controller only reads objects, sends conditional
//! patches, and asks for restarts or migrations, then polls for the outcome.

use async_trait::async_trait;
use json_patch::Patch;
use serde::{Deserialize, Serialize};

use nicplug_core::Result;
use nicplug_core::iface::InterfaceSpec;
use nicplug_core::instance::{VirtualMachine, VmInstance, VmRef};
use nicplug_core::network::NetworkAttachment;

/// Terminal and non-terminal phases of a live migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationPhase {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Object store and lifecycle operations of the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_vm(&self, vm: &VmRef) -> Result<VirtualMachine>;

    /// The running (or starting) instance of a VM, if any.
    async fn get_instance(&self, vm: &VmRef) -> Result<Option<VmInstance>>;

    /// Apply a JSON patch to the VM atomically. A failed `test` operation
    /// must surface as `HotplugError::Conflict` with nothing applied.
    async fn patch_vm(&self, vm: &VmRef, patch: &Patch) -> Result<VirtualMachine>;

    /// Same contract as `patch_vm`, against the instance's spec.
    async fn patch_instance(&self, vm: &VmRef, patch: &Patch) -> Result<VmInstance>;

    /// Stop the current instance and create a new one from the template.
    async fn restart_vm(&self, vm: &VmRef) -> Result<()>;

    /// Start a live migration. Returns the migration id.
    async fn start_migration(&self, vm: &VmRef) -> Result<String>;

    async fn migration_phase(&self, vm: &VmRef, migration_id: &str) -> Result<MigrationPhase>;
}

/// Hot attach/detach on a live instance. Completion is only visible
/// through the instance's interface status.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn attach(
        &self,
        instance_uid: &str,
        network: &NetworkAttachment,
        iface: &InterfaceSpec,
    ) -> Result<()>;

    async fn detach(&self, instance_uid: &str, iface: &str) -> Result<()>;
}
