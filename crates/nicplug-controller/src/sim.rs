//! In-memory cluster backend.
//!
//! Holds VMs as raw JSON documents patched with the same conditional
//! patches a real API server would receive, and instances as typed objects.
//! Attach and detach complete asynchronously: each information source
//! reports after its own delay, so status converges out of order the way it
//! does on a live node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use json_patch::Patch;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use nicplug_core::iface::InterfaceSpec;
use nicplug_core::instance::{
    InstancePhase, InstanceStatus, ObjectMeta, VirtualMachine, VmInstance, VmRef, VmSpec,
};
use nicplug_core::naming;
use nicplug_core::network::NetworkAttachment;
use nicplug_core::status::{
    InfoSource, ObservedInterfaceStatus, SourceReport, merge_report, withdraw_source,
};
use nicplug_core::template::DesiredConfiguration;
use nicplug_core::{HotplugError, Result};

use crate::backend::{ClusterApi, DeviceBackend, MigrationPhase};
use crate::patch::{self, VM_INTERFACES};

/// Timing of the simulated node.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub domain_delay: Duration,
    pub guest_agent_delay: Duration,
    pub attachment_status_delay: Duration,
    /// Scheduled -> Running after start or restart.
    pub boot_delay: Duration,
    /// Total time from migration start to a terminal phase.
    pub migration_delay: Duration,
    /// Nodes instances are placed on. Migrations move to the next one.
    pub nodes: Vec<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            domain_delay: Duration::from_millis(150),
            guest_agent_delay: Duration::from_millis(400),
            attachment_status_delay: Duration::from_millis(80),
            boot_delay: Duration::from_millis(300),
            migration_delay: Duration::from_millis(600),
            nodes: vec!["node01".to_string(), "node02".to_string()],
        }
    }
}

impl SimConfig {
    /// Millisecond-scale delays for tests. The guest agent still reports last.
    pub fn fast() -> Self {
        Self {
            domain_delay: Duration::from_millis(5),
            guest_agent_delay: Duration::from_millis(15),
            attachment_status_delay: Duration::from_millis(2),
            boot_delay: Duration::from_millis(10),
            migration_delay: Duration::from_millis(30),
            ..Default::default()
        }
    }

    fn delay(&self, source: InfoSource) -> Duration {
        match source {
            InfoSource::Domain => self.domain_delay,
            InfoSource::GuestAgent => self.guest_agent_delay,
            InfoSource::AttachmentStatus => self.attachment_status_delay,
        }
    }
}

struct SimMigration {
    vm: VmRef,
    phase: MigrationPhase,
}

#[derive(Default)]
struct SimState {
    vms: HashMap<VmRef, Value>,
    instances: HashMap<VmRef, VmInstance>,
    migrations: HashMap<String, SimMigration>,
    failing_migration: Option<String>,
    stalled: BTreeSet<InfoSource>,
    pending_conflicts: u32,
}

impl SimState {
    fn vm(&self, vm: &VmRef) -> Result<VirtualMachine> {
        let doc = self
            .vms
            .get(vm)
            .ok_or_else(|| HotplugError::not_found("vm", vm.to_string()))?;
        Ok(serde_json::from_value(doc.clone())?)
    }

    fn instance_by_uid(&mut self, uid: &str) -> Option<&mut VmInstance> {
        self.instances.values_mut().find(|i| i.metadata.uid == uid)
    }

    /// A fresh instance wired for the VM's current template.
    fn new_instance(&self, vm: &VmRef, node: &str) -> Result<VmInstance> {
        let template = self.vm(vm)?.spec.template;
        Ok(VmInstance {
            metadata: ObjectMeta {
                namespace: vm.namespace.clone(),
                name: vm.name.clone(),
                uid: naming::generate_uid(),
                resource_version: 1,
            },
            spec: template,
            status: InstanceStatus {
                phase: InstancePhase::Scheduled,
                node_name: node.to_string(),
                interfaces: Vec::new(),
            },
        })
    }
}

/// Mark an instance Running with every present interface reported by
/// every source that is not stalled. Absent interfaces are not created.
fn boot(instance: &mut VmInstance, stalled: &BTreeSet<InfoSource>) {
    let mut statuses = Vec::new();
    for iface in instance.spec.interfaces.iter().filter(|i| !i.is_absent()) {
        let Some(dev) = device_for(&instance.spec, &iface.name) else {
            continue;
        };
        let mac = mac_for(instance.uid(), iface);
        for source in InfoSource::ALL {
            if !stalled.contains(&source) {
                merge_report(&mut statuses, &report_for(source, &iface.name, &dev, &mac));
            }
        }
    }
    instance.status.phase = InstancePhase::Running;
    instance.status.interfaces = statuses;
    instance.metadata.resource_version += 1;
}

/// Guest device name of an interface under the given spec.
fn device_for(spec: &DesiredConfiguration, name: &str) -> Option<String> {
    let network = spec.network(name)?;
    if !network.is_secondary() {
        return Some(naming::device_name(0));
    }
    naming::secondary_device_names(spec)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, dev)| dev)
}

fn mac_for(instance_uid: &str, iface: &InterfaceSpec) -> String {
    iface
        .mac_address
        .clone()
        .unwrap_or_else(|| naming::mac_address(instance_uid, &iface.name))
}

/// What each source knows about a device.
fn report_for(source: InfoSource, name: &str, dev: &str, mac: &str) -> SourceReport {
    match source {
        InfoSource::Domain => SourceReport::new(source, name).mac(mac).queue_count(1),
        InfoSource::GuestAgent => SourceReport::new(source, name).interface_name(dev).mac(mac),
        InfoSource::AttachmentStatus => SourceReport::new(source, name),
    }
}

/// The guest renumbers devices when the spec order changes.
fn refresh_device_names(instance: &mut VmInstance) {
    let names = naming::secondary_device_names(&instance.spec);
    for status in instance.status.interfaces.iter_mut() {
        if !status.info_source.contains(InfoSource::GuestAgent) {
            continue;
        }
        if let Some((_, dev)) = names.iter().find(|(n, _)| *n == status.name) {
            status.interface_name = dev.clone();
        }
    }
}

/// Simulated API server, device backend and migration engine.
#[derive(Clone)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
    config: Arc<SimConfig>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedCluster {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            config: Arc::new(config),
        }
    }

    fn node(&self, index: usize) -> String {
        self.config
            .nodes
            .get(index % self.config.nodes.len().max(1))
            .cloned()
            .unwrap_or_else(|| "node01".to_string())
    }

    /// The node after `current` in placement order.
    fn next_node(&self, current: &str) -> String {
        let idx = self
            .config
            .nodes
            .iter()
            .position(|n| n == current)
            .map_or(0, |i| i + 1);
        self.node(idx)
    }

    /// Create a VM. With `running` an instance is scheduled and boots after
    /// the configured delay.
    pub async fn create_vm(
        &self,
        vm: &VmRef,
        template: DesiredConfiguration,
        running: bool,
    ) -> Result<VirtualMachine> {
        template.validate(&vm.to_string())?;
        let object = VirtualMachine {
            metadata: ObjectMeta {
                namespace: vm.namespace.clone(),
                name: vm.name.clone(),
                uid: naming::generate_uid(),
                resource_version: 1,
            },
            spec: VmSpec { running, template },
        };
        {
            let mut state = self.state.lock().await;
            if state.vms.contains_key(vm) {
                return Err(HotplugError::invalid(vm.to_string(), "-", "vm already exists"));
            }
            state.vms.insert(vm.clone(), serde_json::to_value(&object)?);
        }
        info!(vm = %vm, running, "VM created");
        if running {
            self.start_instance(vm).await?;
        }
        Ok(object)
    }

    async fn start_instance(&self, vm: &VmRef) -> Result<()> {
        let uid = {
            let mut state = self.state.lock().await;
            let instance = state.new_instance(vm, &self.node(0))?;
            let uid = instance.uid().to_string();
            state.instances.insert(vm.clone(), instance);
            uid
        };
        debug!(vm = %vm, uid = %uid, "Instance scheduled");

        let state = self.state.clone();
        let delay = self.config.boot_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = state.lock().await;
            let st = &mut *guard;
            if let Some(instance) = st.instances.values_mut().find(|i| i.metadata.uid == uid) {
                boot(instance, &st.stalled);
            }
        });
        Ok(())
    }

    /// Poll until the VM's instance is Running.
    pub async fn wait_running(&self, vm: &VmRef) -> Result<VmInstance> {
        let limit = self.config.boot_delay * 10 + Duration::from_secs(1);
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(instance) = self.instance(vm).await.filter(VmInstance::is_running) {
                return Ok(instance);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HotplugError::timeout(
                    vm.to_string(),
                    "simulated instance to boot",
                    "running",
                    "not running",
                    limit.as_secs(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn vm(&self, vm: &VmRef) -> Option<VirtualMachine> {
        self.state.lock().await.vm(vm).ok()
    }

    /// The stored VM document as the API server would return it.
    pub async fn vm_json(&self, vm: &VmRef) -> Option<Value> {
        self.state.lock().await.vms.get(vm).cloned()
    }

    pub async fn instance(&self, vm: &VmRef) -> Option<VmInstance> {
        self.state.lock().await.instances.get(vm).cloned()
    }

    /// Make the next migration end in `Failed` without touching the source.
    pub async fn fail_next_migration(&self, reason: &str) {
        self.state.lock().await.failing_migration = Some(reason.to_string());
    }

    /// Stop a source from reporting anything until resumed.
    pub async fn stall_source(&self, source: InfoSource) {
        self.state.lock().await.stalled.insert(source);
    }

    pub async fn resume_source(&self, source: InfoSource) {
        self.state.lock().await.stalled.remove(&source);
    }

    /// Reject the next `n` VM patches as if another writer got there first.
    pub async fn inject_conflicts(&self, n: u32) {
        self.state.lock().await.pending_conflicts = n;
    }

    /// Change a VM's template directly, as a concurrent writer would.
    pub async fn update_template(
        &self,
        vm: &VmRef,
        f: impl FnOnce(&mut DesiredConfiguration),
    ) -> Result<VirtualMachine> {
        let mut state = self.state.lock().await;
        let mut object = state.vm(vm)?;
        f(&mut object.spec.template);
        object.metadata.resource_version += 1;
        state.vms.insert(vm.clone(), serde_json::to_value(&object)?);
        Ok(object)
    }

    fn spawn_report(&self, uid: &str, iface: &InterfaceSpec, source: InfoSource) {
        let state = self.state.clone();
        let delay = self.config.delay(source);
        let uid = uid.to_string();
        let name = iface.name.clone();
        let mac = mac_for(&uid, iface);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut st = state.lock().await;
            if st.stalled.contains(&source) {
                return;
            }
            let Some(instance) = st.instance_by_uid(&uid) else {
                return;
            };
            if instance.spec.interface(&name).is_none_or(|i| i.is_absent()) {
                return;
            }
            let Some(dev) = device_for(&instance.spec, &name) else {
                return;
            };
            merge_report(
                &mut instance.status.interfaces,
                &report_for(source, &name, &dev, &mac),
            );
            refresh_device_names(instance);
            instance.metadata.resource_version += 1;
            debug!(uid = %uid, iface = %name, %source, "Source reported interface");
        });
    }

    fn spawn_withdraw(&self, uid: &str, name: &str, source: InfoSource) {
        let state = self.state.clone();
        let delay = self.config.delay(source);
        let uid = uid.to_string();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut st = state.lock().await;
            if st.stalled.contains(&source) {
                return;
            }
            let Some(instance) = st.instance_by_uid(&uid) else {
                return;
            };
            withdraw_source(&mut instance.status.interfaces, &name, source);
            refresh_device_names(instance);
            instance.metadata.resource_version += 1;
            debug!(uid = %uid, iface = %name, %source, "Source withdrew interface");
        });
    }

    async fn running_by_uid(&self, uid: &str) -> Result<VmInstance> {
        let mut state = self.state.lock().await;
        let instance = state
            .instance_by_uid(uid)
            .ok_or_else(|| HotplugError::not_found("instance", uid))?;
        if !instance.is_running() {
            return Err(HotplugError::backend_permanent(
                "device",
                format!("instance {} is {}", uid, instance.status.phase),
            ));
        }
        Ok(instance.clone())
    }
}

#[async_trait]
impl ClusterApi for SimulatedCluster {
    async fn get_vm(&self, vm: &VmRef) -> Result<VirtualMachine> {
        self.state.lock().await.vm(vm)
    }

    async fn get_instance(&self, vm: &VmRef) -> Result<Option<VmInstance>> {
        Ok(self.instance(vm).await)
    }

    async fn patch_vm(&self, vm: &VmRef, patch: &Patch) -> Result<VirtualMachine> {
        let mut state = self.state.lock().await;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(HotplugError::conflict(
                vm.to_string(),
                format!("/{}", VM_INTERFACES.join("/")),
            ));
        }
        let mut doc = state
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| HotplugError::not_found("vm", vm.to_string()))?;
        patch::apply(&mut doc, patch, &vm.to_string())?;
        let mut object: VirtualMachine = serde_json::from_value(doc)?;
        object.metadata.resource_version += 1;
        state.vms.insert(vm.clone(), serde_json::to_value(&object)?);
        debug!(vm = %vm, rv = object.metadata.resource_version, "VM patched");
        Ok(object)
    }

    async fn patch_instance(&self, vm: &VmRef, patch: &Patch) -> Result<VmInstance> {
        let mut state = self.state.lock().await;
        let current = state
            .instances
            .get(vm)
            .ok_or_else(|| HotplugError::not_found("instance", vm.to_string()))?;
        let mut doc = serde_json::to_value(current)?;
        patch::apply(&mut doc, patch, &vm.to_string())?;
        let mut instance: VmInstance = serde_json::from_value(doc)?;
        instance.metadata.resource_version += 1;
        state.instances.insert(vm.clone(), instance.clone());
        debug!(vm = %vm, rv = instance.metadata.resource_version, "Instance patched");
        Ok(instance)
    }

    async fn restart_vm(&self, vm: &VmRef) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let mut object = state.vm(vm)?;
            object.spec.running = true;
            state.vms.insert(vm.clone(), serde_json::to_value(&object)?);
            if let Some(old) = state.instances.remove(vm) {
                info!(vm = %vm, uid = %old.uid(), "Instance stopped");
            }
        }
        self.start_instance(vm).await
    }

    async fn start_migration(&self, vm: &VmRef) -> Result<String> {
        let id = format!("migration-{}", naming::generate_uid());
        let (failure, target) = {
            let mut state = self.state.lock().await;
            let Some(source_node) = state
                .instances
                .get(vm)
                .filter(|i| i.is_running())
                .map(|i| i.status.node_name.clone())
            else {
                return Err(HotplugError::invalid(
                    vm.to_string(),
                    "-",
                    "no running instance to migrate",
                ));
            };
            // Drop finished migrations of this VM; in-flight ones stay queryable.
            state
                .migrations
                .retain(|_, m| m.vm != *vm || !m.phase.is_terminal());
            state.migrations.insert(
                id.clone(),
                SimMigration {
                    vm: vm.clone(),
                    phase: MigrationPhase::Pending,
                },
            );
            (state.failing_migration.take(), self.next_node(&source_node))
        };

        let state = self.state.clone();
        let half = self.config.migration_delay / 2;
        let vm = vm.clone();
        let mid = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(half).await;
            if let Some(m) = state.lock().await.migrations.get_mut(&mid) {
                m.phase = MigrationPhase::Running;
            }
            tokio::time::sleep(half).await;

            let mut st = state.lock().await;
            let phase = match failure {
                Some(reason) => MigrationPhase::Failed { reason },
                None => match st.new_instance(&vm, &target) {
                    Ok(mut instance) => {
                        boot(&mut instance, &st.stalled);
                        info!(vm = %vm, uid = %instance.uid(), node = %target, "Migration target running");
                        st.instances.insert(vm.clone(), instance);
                        MigrationPhase::Succeeded
                    }
                    Err(e) => MigrationPhase::Failed {
                        reason: e.to_string(),
                    },
                },
            };
            if let Some(m) = st.migrations.get_mut(&mid) {
                m.phase = phase;
            }
        });
        Ok(id)
    }

    async fn migration_phase(&self, vm: &VmRef, migration_id: &str) -> Result<MigrationPhase> {
        let state = self.state.lock().await;
        match state.migrations.get(migration_id) {
            Some(m) if m.vm == *vm => Ok(m.phase.clone()),
            _ => Err(HotplugError::not_found("migration", migration_id)),
        }
    }
}

#[async_trait]
impl DeviceBackend for SimulatedCluster {
    async fn attach(
        &self,
        instance_uid: &str,
        network: &NetworkAttachment,
        iface: &InterfaceSpec,
    ) -> Result<()> {
        let instance = self.running_by_uid(instance_uid).await?;
        if instance.spec.network(&network.name).is_none()
            || instance.spec.interface(&iface.name).is_none_or(|i| i.is_absent())
        {
            return Err(HotplugError::invalid(
                instance.metadata.vm_ref().to_string(),
                &iface.name,
                "interface is not in the instance spec",
            ));
        }
        for source in InfoSource::ALL {
            self.spawn_report(instance_uid, iface, source);
        }
        Ok(())
    }

    async fn detach(&self, instance_uid: &str, iface: &str) -> Result<()> {
        self.running_by_uid(instance_uid).await?;
        for source in InfoSource::ALL {
            self.spawn_withdraw(instance_uid, iface, source);
        }
        Ok(())
    }
}

/// Secondary statuses of the VM's instance, for assertions.
pub async fn secondary_statuses(sim: &SimulatedCluster, vm: &VmRef) -> Vec<ObservedInterfaceStatus> {
    sim.instance(vm)
        .await
        .map(|i| i.secondary_statuses())
        .unwrap_or_default()
}
