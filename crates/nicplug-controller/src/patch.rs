//! Spec diff engine.
//!
//! Every template change is a single JSON patch made of `test` + `replace`
//! pairs: the `test` asserts the list still holds the value we read, the
//! `replace` writes the new list. A concurrent writer makes the `test` fail
//! and the store rejects the whole patch.

use json_patch::{Patch, PatchErrorKind, PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use serde::Serialize;

use nicplug_core::iface::{BindingMethod, InterfaceSpec, InterfaceState};
use nicplug_core::instance::{VirtualMachine, VmInstance};
use nicplug_core::naming;
use nicplug_core::network::NetworkAttachment;
use nicplug_core::template::DesiredConfiguration;
use nicplug_core::{HotplugError, Result};

pub const VM_NETWORKS: [&str; 3] = ["spec", "template", "networks"];
pub const VM_INTERFACES: [&str; 3] = ["spec", "template", "interfaces"];
pub const INSTANCE_NETWORKS: [&str; 2] = ["spec", "networks"];
pub const INSTANCE_INTERFACES: [&str; 2] = ["spec", "interfaces"];

/// An add request as it arrives from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddInterface {
    pub name: String,
    /// Network attachment definition to connect to, e.g. "skynet".
    pub attachment_ref: String,
    pub binding: BindingMethod,
    /// Leave empty to derive one from the VM uid and interface name.
    pub mac: Option<String>,
}

impl AddInterface {
    /// Bridge-bound interface on `attachment_ref` with a derived MAC.
    pub fn bridge(name: &str, attachment_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            attachment_ref: attachment_ref.to_string(),
            binding: BindingMethod::Bridge,
            mac: None,
        }
    }
}

/// A conditional patch plus the configuration it produces when accepted.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub patch: Patch,
    pub desired: DesiredConfiguration,
}

impl PlannedChange {
    /// RFC 6902 wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.patch)?)
    }
}

fn test_and_replace<T: Serialize>(
    ops: &mut Vec<PatchOperation>,
    tokens: &[&str],
    previous: &T,
    next: &T,
) -> Result<()> {
    let path = PointerBuf::from_tokens(tokens.iter().copied());
    ops.push(PatchOperation::Test(TestOperation {
        path: path.clone(),
        value: serde_json::to_value(previous)?,
    }));
    ops.push(PatchOperation::Replace(ReplaceOperation {
        path,
        value: serde_json::to_value(next)?,
    }));
    Ok(())
}

/// Plan the addition of a secondary interface to a VM template.
///
/// Rejects a name that is already present. A tombstoned (absent) entry of
/// the same name is overwritten in place together with its network, which
/// starts a new attachment episode.
pub fn plan_add(vm: &VirtualMachine, req: &AddInterface) -> Result<PlannedChange> {
    let vm_name = vm.metadata.vm_ref().to_string();
    let current = vm.template();

    naming::validate_interface_name(&vm_name, &req.name)?;
    if !req.binding.supports_hotplug() {
        return Err(HotplugError::invalid(
            &vm_name,
            &req.name,
            format!("{} binding cannot be hotplugged", req.binding),
        ));
    }
    if req.attachment_ref.is_empty() {
        return Err(HotplugError::invalid(
            &vm_name,
            &req.name,
            "attachment reference is empty",
        ));
    }

    let tombstone = match current.interface(&req.name) {
        Some(iface) if !iface.is_absent() => {
            return Err(HotplugError::invalid(
                &vm_name,
                &req.name,
                "interface is already present",
            ));
        }
        Some(_) => true,
        None => {
            if current.network(&req.name).is_some() {
                return Err(HotplugError::invalid(
                    &vm_name,
                    &req.name,
                    "a network with this name exists without an interface",
                ));
            }
            false
        }
    };

    let mac = req
        .mac
        .clone()
        .unwrap_or_else(|| naming::mac_address(&vm.metadata.uid, &req.name));
    if current
        .interfaces
        .iter()
        .any(|i| !i.is_absent() && i.mac_address.as_deref() == Some(mac.as_str()))
    {
        return Err(HotplugError::invalid(
            &vm_name,
            &req.name,
            format!("MAC {} is already in use", mac),
        ));
    }

    let network = NetworkAttachment::secondary(&req.name, &req.attachment_ref);
    let iface = InterfaceSpec {
        name: req.name.clone(),
        binding: req.binding,
        mac_address: Some(mac),
        state: InterfaceState::Present,
    };

    let mut desired = current.clone();
    match desired.networks.iter_mut().find(|n| n.name == req.name) {
        Some(slot) => *slot = network,
        None => desired.networks.push(network),
    }
    if tombstone {
        if let Some(slot) = desired.interfaces.iter_mut().find(|i| i.name == req.name) {
            *slot = iface;
        }
    } else {
        desired.interfaces.push(iface);
    }
    desired.validate(&vm_name)?;

    let mut ops = Vec::with_capacity(4);
    test_and_replace(&mut ops, &VM_NETWORKS, &current.networks, &desired.networks)?;
    test_and_replace(&mut ops, &VM_INTERFACES, &current.interfaces, &desired.interfaces)?;

    Ok(PlannedChange {
        patch: Patch(ops),
        desired,
    })
}

/// Plan marking an interface absent.
///
/// Only the interface list is tested and replaced; the network list is
/// left untouched so the attachment definition stays linked.
pub fn plan_remove(vm: &VirtualMachine, name: &str) -> Result<PlannedChange> {
    let vm_name = vm.metadata.vm_ref().to_string();
    let current = vm.template();

    let iface = current
        .interface(name)
        .ok_or_else(|| HotplugError::invalid(&vm_name, name, "unknown interface"))?;
    if iface.is_absent() {
        return Err(HotplugError::invalid(
            &vm_name,
            name,
            "interface is already absent",
        ));
    }
    if !current.network(name).is_some_and(|n| n.is_secondary()) {
        return Err(HotplugError::invalid(
            &vm_name,
            name,
            "only secondary interfaces can be unplugged",
        ));
    }

    let mut desired = current.clone();
    for slot in desired.interfaces.iter_mut().filter(|i| i.name == name) {
        slot.state = InterfaceState::Absent;
    }

    let mut ops = Vec::with_capacity(2);
    test_and_replace(&mut ops, &VM_INTERFACES, &current.interfaces, &desired.interfaces)?;

    Ok(PlannedChange {
        patch: Patch(ops),
        desired,
    })
}

/// Plan rewiring a live instance's spec to the desired configuration.
/// Returns `None` when the instance already matches.
pub fn plan_instance_sync(
    instance: &VmInstance,
    desired: &DesiredConfiguration,
) -> Result<Option<Patch>> {
    if instance.spec == *desired {
        return Ok(None);
    }
    let mut ops = Vec::with_capacity(4);
    test_and_replace(
        &mut ops,
        &INSTANCE_NETWORKS,
        &instance.spec.networks,
        &desired.networks,
    )?;
    test_and_replace(
        &mut ops,
        &INSTANCE_INTERFACES,
        &instance.spec.interfaces,
        &desired.interfaces,
    )?;
    Ok(Some(Patch(ops)))
}

/// Apply a patch to a stored JSON document, all or nothing.
///
/// Stores call this; a failed `test` maps to `Conflict` and the document
/// is left exactly as it was.
pub fn apply(doc: &mut serde_json::Value, patch: &Patch, object: &str) -> Result<()> {
    json_patch::patch(doc, &patch.0).map_err(|e| match e.kind {
        PatchErrorKind::TestFailed => HotplugError::conflict(object, e.path.to_string()),
        _ => HotplugError::backend_permanent("patch", e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicplug_core::instance::{ObjectMeta, VmSpec};

    fn vm_with(template: DesiredConfiguration) -> VirtualMachine {
        VirtualMachine {
            metadata: ObjectMeta {
                namespace: "default".to_string(),
                name: "testvm".to_string(),
                uid: "vm-uid".to_string(),
                resource_version: 1,
            },
            spec: VmSpec {
                running: false,
                template,
            },
        }
    }

    fn red_blue() -> DesiredConfiguration {
        DesiredConfiguration::with_pod_network()
            .with_pair(
                NetworkAttachment::secondary("red", "skynet"),
                InterfaceSpec::bridge("red"),
            )
            .with_pair(
                NetworkAttachment::secondary("blue", "skynet"),
                InterfaceSpec::bridge("blue"),
            )
    }

    fn ops_json(change: &PlannedChange) -> serde_json::Value {
        serde_json::to_value(&change.patch).unwrap()
    }

    #[test]
    fn test_add_tests_and_replaces_both_lists() {
        let vm = vm_with(DesiredConfiguration::with_pod_network());
        let change = plan_add(&vm, &AddInterface::bridge("iface1", "skynet")).unwrap();

        let ops = ops_json(&change);
        let ops = ops.as_array().unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0]["op"], "test");
        assert_eq!(ops[0]["path"], "/spec/template/networks");
        assert_eq!(ops[1]["op"], "replace");
        assert_eq!(ops[2]["op"], "test");
        assert_eq!(ops[2]["path"], "/spec/template/interfaces");
        assert_eq!(ops[3]["value"].as_array().unwrap().len(), 2);

        let iface = change.desired.interface("iface1").unwrap();
        assert_eq!(iface.binding, BindingMethod::Bridge);
        assert_eq!(
            iface.mac_address.as_deref(),
            Some(naming::mac_address("vm-uid", "iface1").as_str())
        );
        assert_eq!(
            change.desired.network("iface1").unwrap().attachment_ref(),
            Some("skynet")
        );
    }

    #[test]
    fn test_add_duplicate_is_rejected() {
        let vm = vm_with(red_blue());
        let err = plan_add(&vm, &AddInterface::bridge("red", "skynet")).unwrap_err();
        assert!(matches!(err, HotplugError::InvalidRequest { .. }));
    }

    #[test]
    fn test_add_rejects_non_bridge_binding() {
        let vm = vm_with(DesiredConfiguration::with_pod_network());
        let mut req = AddInterface::bridge("iface1", "skynet");
        req.binding = BindingMethod::Masquerade;
        assert!(plan_add(&vm, &req).is_err());
        req.binding = BindingMethod::Sriov;
        assert!(plan_add(&vm, &req).is_err());
    }

    #[test]
    fn test_add_rejects_bad_name_and_reused_mac() {
        let vm = vm_with(red_blue());
        assert!(plan_add(&vm, &AddInterface::bridge("Bad_Name", "skynet")).is_err());

        let mut template = red_blue();
        template.interfaces[1].mac_address = Some("02:00:00:00:00:aa".to_string());
        let vm = vm_with(template);
        let mut req = AddInterface::bridge("green", "skynet");
        req.mac = Some("02:00:00:00:00:aa".to_string());
        let err = plan_add(&vm, &req).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_add_over_tombstone_replaces_in_place() {
        let mut template = red_blue();
        template.interfaces[1].state = InterfaceState::Absent;
        let vm = vm_with(template);

        let change = plan_add(&vm, &AddInterface::bridge("red", "othernet")).unwrap();
        let names: Vec<&str> = change
            .desired
            .interfaces
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["default", "red", "blue"]);
        assert!(!change.desired.interface("red").unwrap().is_absent());
        assert_eq!(change.desired.networks.len(), 3);
        assert_eq!(
            change.desired.network("red").unwrap().attachment_ref(),
            Some("othernet")
        );
    }

    #[test]
    fn test_remove_only_touches_interfaces() {
        let vm = vm_with(red_blue());
        let change = plan_remove(&vm, "blue").unwrap();

        let ops = ops_json(&change);
        let ops = ops.as_array().unwrap();
        assert_eq!(ops.len(), 2);
        assert!(
            ops.iter()
                .all(|op| op["path"] == "/spec/template/interfaces")
        );
        assert_eq!(change.desired.networks, vm.spec.template.networks);
        assert!(change.desired.interface("blue").unwrap().is_absent());
        assert!(!change.desired.interface("red").unwrap().is_absent());
    }

    #[test]
    fn test_remove_rejections() {
        let mut template = red_blue();
        template.interfaces[2].state = InterfaceState::Absent;
        let vm = vm_with(template);

        let err = plan_remove(&vm, "blue").unwrap_err();
        assert!(err.to_string().contains("already absent"));
        let err = plan_remove(&vm, "green").unwrap_err();
        assert!(err.to_string().contains("unknown interface"));
        let err = plan_remove(&vm, "default").unwrap_err();
        assert!(err.to_string().contains("only secondary"));
    }

    #[test]
    fn test_apply_accepts_fresh_patch() {
        let vm = vm_with(DesiredConfiguration::with_pod_network());
        let change = plan_add(&vm, &AddInterface::bridge("iface1", "skynet")).unwrap();

        let mut doc = serde_json::to_value(&vm).unwrap();
        apply(&mut doc, &change.patch, "default/testvm").unwrap();
        let patched: VirtualMachine = serde_json::from_value(doc).unwrap();
        assert_eq!(patched.spec.template, change.desired);
    }

    #[test]
    fn test_apply_stale_patch_conflicts_atomically() {
        let vm = vm_with(red_blue());
        let stale = plan_add(&vm, &AddInterface::bridge("iface1", "skynet")).unwrap();

        // Another writer changes only the interface list after our read.
        let mut doc = serde_json::to_value(&vm).unwrap();
        let other = plan_remove(&vm, "red").unwrap();
        apply(&mut doc, &other.patch, "default/testvm").unwrap();
        let before = doc.clone();

        let err = apply(&mut doc, &stale.patch, "default/testvm").unwrap_err();
        assert!(err.is_conflict());
        // The networks replace had already passed its test; it must be undone.
        assert_eq!(doc, before);
    }

    #[test]
    fn test_instance_sync_noop_when_equal() {
        let spec = red_blue();
        let instance = VmInstance {
            metadata: ObjectMeta::default(),
            spec: spec.clone(),
            status: Default::default(),
        };
        assert!(plan_instance_sync(&instance, &spec).unwrap().is_none());

        let mut desired = spec.clone();
        desired.interfaces[2].state = InterfaceState::Absent;
        let patch = plan_instance_sync(&instance, &desired).unwrap().unwrap();
        assert_eq!(patch.0.len(), 4);
    }

    #[test]
    fn test_patch_wire_form() {
        let vm = vm_with(red_blue());
        let json = plan_remove(&vm, "red").unwrap().to_json().unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains("\"op\":\"test\""));
        assert!(json.contains("\"state\":\"absent\""));
    }
}
