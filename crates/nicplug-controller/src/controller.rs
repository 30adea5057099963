//! Hotplug controller: the operations exposed to callers.
//!
//! Every template change is a conditional patch built from a fresh read and
//! retried on conflict. Delivery to a running instance is delegated to the
//! configured strategy; with no running instance only the template changes.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use nicplug_core::audit::{AuditAction, AuditEntry};
use nicplug_core::config::{HotplugConfig, StrategyKind};
use nicplug_core::iface::InterfaceState;
use nicplug_core::instance::{InstancePhase, VirtualMachine, VmInstance, VmRef};
use nicplug_core::lifecycle::{InterfacePhase, derive_phase, validate_transition};
use nicplug_core::request::HotplugRequest;
use nicplug_core::retry::retry_retryable;
use nicplug_core::status::{InfoSources, lookup_status};
use nicplug_core::template::DesiredConfiguration;
use nicplug_core::time::utc_now;
use nicplug_core::{HotplugError, Result};

use crate::backend::{ClusterApi, DeviceBackend};
use crate::observer::{ConvergenceObserver, check_convergence};
use crate::patch::{self, AddInterface, PlannedChange};
use crate::strategy::{DeliveryOutcome, DeliveryStrategy, MigrationStrategy, build_strategy};

/// How a template change reached the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Delivery {
    /// The running instance already matched the template.
    NoChange,
    /// No running instance. The change takes effect at the next start.
    TemplateOnly,
    Delivered(DeliveryOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct HotplugReport {
    pub vm: VmRef,
    pub interface: String,
    /// Template after the change.
    pub template: DesiredConfiguration,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceReport {
    pub name: String,
    pub state: InterfaceState,
    pub phase: InterfacePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// Point-in-time view of a VM's secondary interfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceStatus {
    pub vm: VmRef,
    pub instance_uid: Option<String>,
    pub instance_phase: Option<InstancePhase>,
    pub interfaces: Vec<InterfaceReport>,
    pub converged: bool,
}

pub struct HotplugController {
    api: Arc<dyn ClusterApi>,
    strategy: Box<dyn DeliveryStrategy>,
    observer: ConvergenceObserver,
    config: HotplugConfig,
    audit: Mutex<Vec<AuditEntry>>,
}

impl HotplugController {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        devices: Arc<dyn DeviceBackend>,
        config: HotplugConfig,
    ) -> Self {
        let strategy = build_strategy(config.strategy, api.clone(), devices, &config);
        Self {
            observer: ConvergenceObserver::new(api.clone(), &config),
            api,
            strategy,
            config,
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Add a secondary interface to the VM's template and, when an instance
    /// is running or starting, deliver it and wait for confirmation from
    /// every source.
    #[instrument(skip_all, fields(vm = %vm, iface = %req.name))]
    pub async fn add_interface(&self, vm: &VmRef, req: AddInterface) -> Result<HotplugReport> {
        let current = self.api.get_vm(vm).await?;
        let from = self.interface_phase(vm, current.template(), &req.name).await?;
        validate_transition(&req.name, from, InterfacePhase::Requested).map_err(|_| {
            HotplugError::invalid(
                vm.to_string(),
                &req.name,
                format!("interface is {}, wait for the removal to finish", from),
            )
        })?;

        self.record(
            vm,
            Some(&req.name),
            AuditAction::InterfaceAddRequested,
            Some(format!("attachment={} binding={}", req.attachment_ref, req.binding)),
        );
        let patched = self
            .change_template(vm, &req.name, |object| patch::plan_add(object, &req))
            .await?;
        info!(rv = patched.metadata.resource_version, "Interface added to template");

        let delivery = self.deliver(vm, &req.name, patched.template()).await?;
        Ok(HotplugReport {
            vm: vm.clone(),
            interface: req.name,
            template: patched.spec.template,
            delivery,
        })
    }

    /// Mark a secondary interface absent. The entry stays in the template as
    /// a tombstone; the network list is not touched.
    #[instrument(skip_all, fields(vm = %vm, iface = %name))]
    pub async fn remove_interface(&self, vm: &VmRef, name: &str) -> Result<HotplugReport> {
        let current = self.api.get_vm(vm).await?;
        let from = self.interface_phase(vm, current.template(), name).await?;
        let to = if from != InterfacePhase::Absent && self.has_status(vm, name).await? {
            InterfacePhase::PendingAbsent
        } else {
            InterfacePhase::Absent
        };
        validate_transition(name, from, to)?;

        self.record(vm, Some(name), AuditAction::InterfaceRemoveRequested, None);
        let patched = self
            .change_template(vm, name, |object| patch::plan_remove(object, name))
            .await?;
        info!(rv = patched.metadata.resource_version, "Interface marked absent");

        let delivery = self.deliver(vm, name, patched.template()).await?;
        Ok(HotplugReport {
            vm: vm.clone(),
            interface: name.to_string(),
            template: patched.spec.template,
            delivery,
        })
    }

    /// Per-interface phase and overall convergence, without waiting.
    pub async fn convergence_status(&self, vm: &VmRef) -> Result<ConvergenceStatus> {
        let object = self.api.get_vm(vm).await?;
        let template = object.template();
        let instance = self.api.get_instance(vm).await?;
        let running = instance.as_ref().filter(|i| i.is_running());
        let required = InfoSources::all();

        let interfaces = template
            .interfaces
            .iter()
            .filter(|i| template.network(&i.name).is_some_and(|n| n.is_secondary()))
            .map(|iface| {
                let status = running.and_then(|inst| lookup_status(&inst.status.interfaces, &iface.name));
                InterfaceReport {
                    name: iface.name.clone(),
                    state: iface.state,
                    phase: derive_phase(Some(iface), status, &required),
                    device: status
                        .map(|s| s.interface_name.clone())
                        .filter(|d| !d.is_empty()),
                    mac: status.map(|s| s.mac.clone()).filter(|m| !m.is_empty()),
                }
            })
            .collect();

        let converged = match (&instance, running) {
            (_, Some(inst)) => check_convergence(inst, template).is_ok(),
            (Some(_), None) => false,
            (None, None) => true,
        };

        Ok(ConvergenceStatus {
            vm: vm.clone(),
            instance_uid: instance.as_ref().map(|i| i.uid().to_string()),
            instance_phase: instance.as_ref().map(|i| i.status.phase),
            interfaces,
            converged,
        })
    }

    /// Restart the VM and wait until the new instance runs with every
    /// present interface confirmed.
    #[instrument(skip_all, fields(vm = %vm))]
    pub async fn restart(&self, vm: &VmRef) -> Result<VmInstance> {
        let previous = self
            .api
            .get_instance(vm)
            .await?
            .map(|i| i.uid().to_string())
            .unwrap_or_default();

        self.record(vm, None, AuditAction::RestartRequested, None);
        self.api.restart_vm(vm).await?;
        let replacement = self
            .observer
            .wait_replacement_running(vm, &previous, self.config.running_timeout())
            .await?;
        self.record(
            vm,
            None,
            AuditAction::InstanceReplaced,
            Some(format!("{} -> {}", previous, replacement.uid())),
        );

        let template = self.api.get_vm(vm).await?.spec.template;
        let converged = self.observe(vm, None, &template).await?;
        Ok(converged)
    }

    /// Live-migrate the VM with no pending change and confirm its
    /// interfaces survived.
    #[instrument(skip_all, fields(vm = %vm))]
    pub async fn migrate(&self, vm: &VmRef) -> Result<DeliveryOutcome> {
        let migration = MigrationStrategy::new(self.api.clone(), &self.config);
        let migrated = match migration.migrate(vm).await {
            Ok(m) => m,
            Err(e) => {
                self.record_failure(vm, None, &e);
                return Err(e);
            }
        };
        self.record(
            vm,
            None,
            AuditAction::MigrationSucceeded,
            Some(migrated.migration_id.clone()),
        );

        let template = self.api.get_vm(vm).await?.spec.template;
        let converged = self.observe(vm, None, &template).await?;
        Ok(DeliveryOutcome {
            strategy: StrategyKind::Migration,
            previous_uid: migrated.previous_uid,
            instance_uid: converged.uid().to_string(),
            interfaces: converged.secondary_statuses(),
            migration_id: Some(migrated.migration_id),
        })
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn change_template<F>(&self, vm: &VmRef, iface: &str, plan: F) -> Result<VirtualMachine>
    where
        F: Fn(&VirtualMachine) -> Result<PlannedChange>,
    {
        let api = &self.api;
        let plan = &plan;
        let patched = retry_retryable(
            self.config.conflict_retries,
            self.config.conflict_backoff(),
            "template patch",
            move || async move {
                let current = api.get_vm(vm).await?;
                let change = plan(&current)?;
                debug!(patch = %change.to_json()?, "Patching template");
                api.patch_vm(vm, &change.patch).await.inspect_err(|e| {
                    if e.is_conflict() {
                        self.record(vm, Some(iface), AuditAction::PatchConflict, Some(e.to_string()));
                    }
                })
            },
        )
        .await?;
        self.record(
            vm,
            Some(iface),
            AuditAction::TemplatePatched,
            Some(format!("resourceVersion={}", patched.metadata.resource_version)),
        );
        Ok(patched)
    }

    async fn deliver(
        &self,
        vm: &VmRef,
        iface: &str,
        template: &DesiredConfiguration,
    ) -> Result<Delivery> {
        let instance = match self.api.get_instance(vm).await? {
            Some(i) if i.is_running() => i,
            // Built from the template before this patch: it boots without the
            // change, so deliver once it runs.
            Some(i) if i.status.phase.is_starting() => {
                info!(uid = %i.uid(), phase = %i.status.phase, "Instance starting, delivering once Running");
                match self
                    .observer
                    .wait_running(vm, self.config.running_timeout())
                    .await
                {
                    Ok(running) => running,
                    Err(e) => {
                        self.record_failure(vm, Some(iface), &e);
                        return Err(e);
                    }
                }
            }
            Some(i) => {
                info!(phase = %i.status.phase, "Instance finished, change applies at next start");
                return Ok(Delivery::TemplateOnly);
            }
            None => {
                info!("No instance, change applies at next start");
                return Ok(Delivery::TemplateOnly);
            }
        };

        let request = HotplugRequest::between(vm.clone(), &instance.spec, template);
        if request.is_empty() {
            return Ok(Delivery::NoChange);
        }
        self.record(
            vm,
            Some(iface),
            AuditAction::DeliveryStarted,
            Some(format!("{} via {}", request, self.strategy.kind())),
        );

        match self.strategy.deliver(&request).await {
            Ok(outcome) => {
                if let Some(id) = &outcome.migration_id {
                    self.record(vm, Some(iface), AuditAction::MigrationSucceeded, Some(id.clone()));
                }
                self.record(
                    vm,
                    Some(iface),
                    AuditAction::InterfacesConverged,
                    Some(format!("instance={}", outcome.instance_uid)),
                );
                Ok(Delivery::Delivered(outcome))
            }
            Err(e) => {
                self.record_failure(vm, Some(iface), &e);
                Err(e)
            }
        }
    }

    async fn observe(
        &self,
        vm: &VmRef,
        iface: Option<&str>,
        template: &DesiredConfiguration,
    ) -> Result<VmInstance> {
        match self.observer.wait_converged(vm, template).await {
            Ok(inst) => {
                self.record(
                    vm,
                    iface,
                    AuditAction::InterfacesConverged,
                    Some(format!("instance={}", inst.uid())),
                );
                Ok(inst)
            }
            Err(e) => {
                self.record_failure(vm, iface, &e);
                Err(e)
            }
        }
    }

    async fn interface_phase(
        &self,
        vm: &VmRef,
        template: &DesiredConfiguration,
        name: &str,
    ) -> Result<InterfacePhase> {
        let instance = self.api.get_instance(vm).await?;
        let status = instance
            .as_ref()
            .filter(|i| i.is_running())
            .and_then(|i| lookup_status(&i.status.interfaces, name));
        Ok(derive_phase(
            template.interface(name),
            status,
            &InfoSources::all(),
        ))
    }

    async fn has_status(&self, vm: &VmRef, name: &str) -> Result<bool> {
        Ok(self
            .api
            .get_instance(vm)
            .await?
            .filter(|i| i.is_running())
            .is_some_and(|i| lookup_status(&i.status.interfaces, name).is_some()))
    }

    fn record_failure(&self, vm: &VmRef, iface: Option<&str>, err: &HotplugError) {
        let action = match err {
            HotplugError::ConvergenceTimeout { .. } => AuditAction::ConvergenceTimedOut,
            HotplugError::MigrationFailed { .. } => AuditAction::MigrationFailed,
            _ => return,
        };
        warn!(vm = %vm, error = %err, "Delivery failed");
        self.record(vm, iface, action, Some(err.to_string()));
    }

    fn record(&self, vm: &VmRef, iface: Option<&str>, action: AuditAction, detail: Option<String>) {
        let entry = AuditEntry {
            timestamp: utc_now(),
            namespace: vm.namespace.clone(),
            vm: vm.name.clone(),
            interface: iface.map(str::to_string),
            action,
            detail,
        };
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}
