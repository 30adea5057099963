use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use json_patch::Patch;
use serde_json::Value;

use nicplug::controller::backend::{ClusterApi, MigrationPhase};
use nicplug::controller::controller::Delivery;
use nicplug::controller::patch::AddInterface;
use nicplug::controller::sim::{SimConfig, SimulatedCluster};
use nicplug::core::audit::AuditAction;
use nicplug::core::config::{HotplugConfig, StrategyKind};
use nicplug::core::iface::InterfaceSpec;
use nicplug::core::instance::{VirtualMachine, VmInstance, VmRef};
use nicplug::core::lifecycle::InterfacePhase;
use nicplug::core::network::NetworkAttachment;
use nicplug::core::status::{InfoSource, InfoSources};
use nicplug::core::template::DesiredConfiguration;
use nicplug::{HotplugController, HotplugError};

fn config(strategy: StrategyKind) -> HotplugConfig {
    HotplugConfig {
        strategy,
        convergence_timeout_secs: 10,
        poll_interval_ms: 10,
        migration_timeout_secs: 10,
        running_timeout_secs: 10,
        conflict_backoff_ms: 1,
        ..Default::default()
    }
}

async fn running_vm(sim: &SimulatedCluster) -> VmRef {
    let vm = VmRef::new("default", "testvm");
    sim.create_vm(&vm, DesiredConfiguration::with_pod_network(), true)
        .await
        .unwrap();
    sim.wait_running(&vm).await.unwrap();
    vm
}

fn controller(sim: &SimulatedCluster, strategy: StrategyKind) -> HotplugController {
    HotplugController::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        config(strategy),
    )
}

fn count(ctl: &HotplugController, action: AuditAction) -> usize {
    ctl.audit_trail()
        .iter()
        .filter(|e| e.action == action)
        .count()
}

async fn add_then_remove(strategy: StrategyKind) {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, strategy);

    let added = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    let template_mac = added
        .template
        .interface("iface1")
        .and_then(|i| i.mac_address.clone())
        .unwrap();

    let inst = sim.instance(&vm).await.unwrap();
    let statuses = inst.secondary_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "iface1");
    assert_eq!(statuses[0].interface_name, "eth1");
    assert_eq!(statuses[0].mac, template_mac);
    assert_eq!(statuses[0].info_source, InfoSources::all());
    assert_eq!(statuses[0].queue_count, 1);

    let removed = ctl.remove_interface(&vm, "iface1").await.unwrap();
    assert!(removed.template.interface("iface1").unwrap().is_absent());
    assert!(removed.template.network("iface1").is_some());
    let inst = sim.instance(&vm).await.unwrap();
    assert!(inst.secondary_statuses().is_empty());

    let status = ctl.convergence_status(&vm).await.unwrap();
    assert!(status.converged);
    assert_eq!(status.interfaces[0].phase, InterfacePhase::Absent);
}

#[tokio::test]
async fn test_add_then_remove_in_place() {
    add_then_remove(StrategyKind::InPlace).await;
}

#[tokio::test]
async fn test_add_then_remove_via_migration() {
    add_then_remove(StrategyKind::Migration).await;
}

#[tokio::test]
async fn test_migration_delivery_replaces_instance() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let before = sim.instance(&vm).await.unwrap();
    let ctl = controller(&sim, StrategyKind::Migration);

    let report = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    let Delivery::Delivered(outcome) = report.delivery else {
        panic!("expected delivery");
    };
    assert_eq!(outcome.previous_uid, before.uid());
    assert_ne!(outcome.instance_uid, before.uid());
    assert_eq!(count(&ctl, AuditAction::MigrationSucceeded), 1);
}

#[tokio::test]
async fn test_in_place_delivery_keeps_instance() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let before = sim.instance(&vm).await.unwrap();
    let ctl = controller(&sim, StrategyKind::InPlace);

    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    assert_eq!(sim.instance(&vm).await.unwrap().uid(), before.uid());
}

#[tokio::test]
async fn test_duplicate_add_on_running_vm() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, StrategyKind::InPlace);
    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    let before = sim.vm_json(&vm).await.unwrap();

    let err = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap_err();
    assert!(matches!(err, HotplugError::InvalidRequest { .. }));
    assert_eq!(sim.vm_json(&vm).await.unwrap(), before);
}

#[tokio::test]
async fn test_remove_already_absent_is_rejected() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, StrategyKind::InPlace);
    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    ctl.remove_interface(&vm, "iface1").await.unwrap();

    let err = ctl.remove_interface(&vm, "iface1").await.unwrap_err();
    assert!(matches!(err, HotplugError::InvalidRequest { .. }));
}

#[tokio::test]
async fn test_stopped_vm_remove_conserves_networks() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = VmRef::new("default", "stopped");
    let template = DesiredConfiguration::with_pod_network()
        .with_pair(
            NetworkAttachment::secondary("red", "skynet"),
            InterfaceSpec::bridge("red"),
        )
        .with_pair(
            NetworkAttachment::secondary("blue", "skynet"),
            InterfaceSpec::bridge("blue"),
        );
    sim.create_vm(&vm, template.clone(), false).await.unwrap();
    let ctl = controller(&sim, StrategyKind::InPlace);
    let before = sim.vm_json(&vm).await.unwrap();

    let report = ctl.remove_interface(&vm, "red").await.unwrap();
    assert_eq!(report.delivery, Delivery::TemplateOnly);

    let after = sim.vm_json(&vm).await.unwrap();
    assert_eq!(
        before["spec"]["template"]["networks"],
        after["spec"]["template"]["networks"]
    );
    let vm_after: VirtualMachine = serde_json::from_value(after).unwrap();
    let t = vm_after.template();
    assert!(t.interface("red").unwrap().is_absent());
    assert!(!t.interface("blue").unwrap().is_absent());
    assert!(sim.instance(&vm).await.is_none());
}

#[tokio::test]
async fn test_failed_migration_is_crash_only() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let api = Arc::new(WrappedApi::new(sim.clone(), false));
    let ctl = HotplugController::new(
        api.clone(),
        Arc::new(sim.clone()),
        config(StrategyKind::Migration),
    );

    sim.fail_next_migration("target pod evicted").await;
    let err = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap_err();
    match err {
        HotplugError::MigrationFailed {
            reason,
            source_preserved,
            ..
        } => {
            assert_eq!(reason, "target pod evicted");
            assert!(source_preserved);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Neither the VM document nor the source instance moved.
    let (doc_before, instance_before) = api.before_migration().unwrap();
    assert_eq!(sim.vm_json(&vm).await.unwrap(), doc_before);
    let instance_after = sim.instance(&vm).await.unwrap();
    assert_eq!(instance_after, instance_before);
    assert_eq!(instance_after.uid(), instance_before.uid());
    assert_eq!(count(&ctl, AuditAction::MigrationFailed), 1);

    // The template keeps the requested interface; a later migration delivers it.
    let template: DesiredConfiguration =
        serde_json::from_value(doc_before["spec"]["template"].clone()).unwrap();
    assert!(!template.interface("iface1").unwrap().is_absent());
    let status = ctl.convergence_status(&vm).await.unwrap();
    assert!(!status.converged);
    assert_eq!(status.interfaces[0].phase, InterfacePhase::Requested);
    let outcome = ctl.migrate(&vm).await.unwrap();
    assert_eq!(outcome.interfaces.len(), 1);
}

async fn device_names_follow_spec_order(strategy: StrategyKind) {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, strategy);

    ctl.add_interface(&vm, AddInterface::bridge("a", "skynet"))
        .await
        .unwrap();
    ctl.add_interface(&vm, AddInterface::bridge("b", "skynet"))
        .await
        .unwrap();
    let status = ctl.convergence_status(&vm).await.unwrap();
    let devices: Vec<(String, Option<String>)> = status
        .interfaces
        .iter()
        .map(|i| (i.name.clone(), i.device.clone()))
        .collect();
    assert_eq!(
        devices,
        vec![
            ("a".to_string(), Some("eth1".to_string())),
            ("b".to_string(), Some("eth2".to_string())),
        ]
    );

    // Removing "a" shifts "b" down to eth1.
    ctl.remove_interface(&vm, "a").await.unwrap();
    let inst = sim.instance(&vm).await.unwrap();
    let statuses = inst.secondary_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "b");
    assert_eq!(statuses[0].interface_name, "eth1");
}

#[tokio::test]
async fn test_device_names_follow_spec_order_in_place() {
    device_names_follow_spec_order(StrategyKind::InPlace).await;
}

#[tokio::test]
async fn test_device_names_follow_spec_order_via_migration() {
    device_names_follow_spec_order(StrategyKind::Migration).await;
}

/// Wraps the simulated cluster: can let another writer change the template
/// between the controller's read and its first patch, and records the VM
/// document and instance as they were when a migration was requested.
struct WrappedApi {
    inner: SimulatedCluster,
    race_pending: AtomicBool,
    before_migration: Mutex<Option<(Value, VmInstance)>>,
}

impl WrappedApi {
    fn new(inner: SimulatedCluster, race: bool) -> Self {
        Self {
            inner,
            race_pending: AtomicBool::new(race),
            before_migration: Mutex::new(None),
        }
    }

    fn before_migration(&self) -> Option<(Value, VmInstance)> {
        self.before_migration.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for WrappedApi {
    async fn get_vm(&self, vm: &VmRef) -> nicplug::Result<VirtualMachine> {
        self.inner.get_vm(vm).await
    }

    async fn get_instance(&self, vm: &VmRef) -> nicplug::Result<Option<VmInstance>> {
        self.inner.get_instance(vm).await
    }

    async fn patch_vm(&self, vm: &VmRef, patch: &Patch) -> nicplug::Result<VirtualMachine> {
        if self.race_pending.swap(false, Ordering::SeqCst) {
            self.inner
                .update_template(vm, |t| {
                    t.networks.push(NetworkAttachment::secondary("other", "skynet"));
                    t.interfaces.push(InterfaceSpec::bridge("other"));
                })
                .await?;
        }
        self.inner.patch_vm(vm, patch).await
    }

    async fn patch_instance(&self, vm: &VmRef, patch: &Patch) -> nicplug::Result<VmInstance> {
        self.inner.patch_instance(vm, patch).await
    }

    async fn restart_vm(&self, vm: &VmRef) -> nicplug::Result<()> {
        self.inner.restart_vm(vm).await
    }

    async fn start_migration(&self, vm: &VmRef) -> nicplug::Result<String> {
        let doc = self.inner.vm_json(vm).await;
        let instance = self.inner.instance(vm).await;
        if let (Some(doc), Some(instance)) = (doc, instance) {
            *self.before_migration.lock().unwrap() = Some((doc, instance));
        }
        self.inner.start_migration(vm).await
    }

    async fn migration_phase(&self, vm: &VmRef, id: &str) -> nicplug::Result<MigrationPhase> {
        self.inner.migration_phase(vm, id).await
    }
}

#[tokio::test]
async fn test_concurrent_writer_conflict_is_retried() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = VmRef::new("default", "testvm");
    sim.create_vm(&vm, DesiredConfiguration::with_pod_network(), false)
        .await
        .unwrap();
    let api = Arc::new(WrappedApi::new(sim.clone(), true));
    let ctl = HotplugController::new(api, Arc::new(sim.clone()), config(StrategyKind::InPlace));

    let report = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    // Both writers' changes survive: the retry re-read the list.
    assert!(report.template.interface("other").is_some());
    assert!(report.template.interface("iface1").is_some());
    assert_eq!(report.template.networks.len(), 3);
    assert_eq!(count(&ctl, AuditAction::PatchConflict), 1);
}

#[tokio::test]
async fn test_re_add_overwrites_tombstone() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, StrategyKind::InPlace);

    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    ctl.remove_interface(&vm, "iface1").await.unwrap();
    let report = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "othernet"))
        .await
        .unwrap();

    assert_eq!(report.template.interfaces.len(), 2);
    assert_eq!(report.template.networks.len(), 2);
    assert!(!report.template.interface("iface1").unwrap().is_absent());
    assert_eq!(
        report.template.network("iface1").unwrap().attachment_ref(),
        Some("othernet")
    );
    let statuses = sim.instance(&vm).await.unwrap().secondary_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].interface_name, "eth1");
}

async fn restart_keeps_plugged_interface(strategy: StrategyKind) {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, strategy);
    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    let before = sim.instance(&vm).await.unwrap();

    let after = ctl.restart(&vm).await.unwrap();
    assert_ne!(after.uid(), before.uid());
    let statuses = after.secondary_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "iface1");
    assert_eq!(statuses[0].interface_name, "eth1");
    assert_eq!(count(&ctl, AuditAction::InstanceReplaced), 1);
}

#[tokio::test]
async fn test_restart_keeps_plugged_interface_in_place() {
    restart_keeps_plugged_interface(StrategyKind::InPlace).await;
}

#[tokio::test]
async fn test_restart_keeps_plugged_interface_via_migration() {
    restart_keeps_plugged_interface(StrategyKind::Migration).await;
}

async fn restart_does_not_materialise_removed_interface(strategy: StrategyKind) {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, strategy);
    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    ctl.remove_interface(&vm, "iface1").await.unwrap();

    let after = ctl.restart(&vm).await.unwrap();
    assert!(after.secondary_statuses().is_empty());
    assert!(after.spec.interface("iface1").unwrap().is_absent());
}

#[tokio::test]
async fn test_restart_does_not_materialise_removed_interface_in_place() {
    restart_does_not_materialise_removed_interface(StrategyKind::InPlace).await;
}

#[tokio::test]
async fn test_restart_does_not_materialise_removed_interface_via_migration() {
    restart_does_not_materialise_removed_interface(StrategyKind::Migration).await;
}

async fn add_while_instance_starts(strategy: StrategyKind) {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = VmRef::new("default", "testvm");
    sim.create_vm(&vm, DesiredConfiguration::with_pod_network(), true)
        .await
        .unwrap();
    let ctl = controller(&sim, strategy);

    let report = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();
    assert!(matches!(report.delivery, Delivery::Delivered(_)));

    let inst = sim.instance(&vm).await.unwrap();
    assert!(inst.is_running());
    assert!(!inst.spec.interface("iface1").unwrap().is_absent());
    let statuses = inst.secondary_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].interface_name, "eth1");

    let status = ctl.convergence_status(&vm).await.unwrap();
    assert!(status.converged);
    assert_eq!(status.interfaces[0].phase, InterfacePhase::Confirmed);
}

#[tokio::test]
async fn test_add_while_instance_starts_in_place() {
    add_while_instance_starts(StrategyKind::InPlace).await;
}

#[tokio::test]
async fn test_add_while_instance_starts_via_migration() {
    add_while_instance_starts(StrategyKind::Migration).await;
}

#[tokio::test]
async fn test_plain_migration_keeps_interfaces() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, StrategyKind::InPlace);
    ctl.add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap();

    let outcome = ctl.migrate(&vm).await.unwrap();
    assert!(outcome.replaced_instance());
    assert_eq!(outcome.interfaces.len(), 1);
    assert_eq!(outcome.interfaces[0].interface_name, "eth1");
}

#[tokio::test]
async fn test_stalled_source_times_out_without_rollback() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = HotplugController::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        HotplugConfig {
            convergence_timeout_secs: 1,
            poll_interval_ms: 20,
            ..Default::default()
        },
    );
    sim.stall_source(InfoSource::GuestAgent).await;

    let err = ctl
        .add_interface(&vm, AddInterface::bridge("iface1", "skynet"))
        .await
        .unwrap_err();
    match &err {
        HotplugError::ConvergenceTimeout {
            expected,
            waited_secs,
            ..
        } => {
            assert!(expected.contains("iface1/eth1"));
            assert_eq!(*waited_secs, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count(&ctl, AuditAction::ConvergenceTimedOut), 1);

    // Desired state stays as requested.
    let vm_now = sim.vm(&vm).await.unwrap();
    assert!(!vm_now.template().interface("iface1").unwrap().is_absent());
    let status = ctl.convergence_status(&vm).await.unwrap();
    assert_eq!(status.interfaces[0].phase, InterfacePhase::Requested);

    // Once the source resumes, a restart confirms the interface.
    sim.resume_source(InfoSource::GuestAgent).await;
    let after = ctl.restart(&vm).await.unwrap();
    assert_eq!(after.secondary_statuses().len(), 1);
}

#[tokio::test]
async fn test_rejects_non_bridge_binding() {
    let sim = SimulatedCluster::new(SimConfig::fast());
    let vm = running_vm(&sim).await;
    let ctl = controller(&sim, StrategyKind::InPlace);

    let mut req = AddInterface::bridge("iface1", "skynet");
    req.binding = nicplug::core::iface::BindingMethod::Sriov;
    let err = ctl.add_interface(&vm, req).await.unwrap_err();
    assert!(matches!(err, HotplugError::InvalidRequest { .. }));
    assert!(sim.vm(&vm).await.unwrap().template().interface("iface1").is_none());
}
