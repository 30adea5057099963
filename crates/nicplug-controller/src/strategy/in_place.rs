use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use nicplug_core::config::{HotplugConfig, StrategyKind};
use nicplug_core::instance::{VmInstance, VmRef};
use nicplug_core::request::HotplugRequest;
use nicplug_core::retry::retry_retryable;
use nicplug_core::template::DesiredConfiguration;
use nicplug_core::{HotplugError, Result};

use super::{DeliveryOutcome, DeliveryStrategy};
use crate::backend::{ClusterApi, DeviceBackend};
use crate::observer::ConvergenceObserver;
use crate::patch;

/// Attach and detach devices on the live instance. The instance keeps its uid.
pub struct InPlaceStrategy {
    api: Arc<dyn ClusterApi>,
    devices: Arc<dyn DeviceBackend>,
    observer: ConvergenceObserver,
    conflict_retries: u32,
    conflict_backoff: Duration,
}

impl InPlaceStrategy {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        devices: Arc<dyn DeviceBackend>,
        config: &HotplugConfig,
    ) -> Self {
        Self {
            observer: ConvergenceObserver::new(api.clone(), config),
            api,
            devices,
            conflict_retries: config.conflict_retries,
            conflict_backoff: config.conflict_backoff(),
        }
    }

    /// Bring the instance spec in line with `desired` via a conditional
    /// patch, re-reading on conflict. Returns the synced instance.
    async fn sync_instance_spec(
        &self,
        vm: &VmRef,
        desired: &DesiredConfiguration,
    ) -> Result<VmInstance> {
        let api = &self.api;
        retry_retryable(
            self.conflict_retries,
            self.conflict_backoff,
            "instance spec sync",
            move || async move {
                let instance = running_instance(api.as_ref(), vm).await?;
                match patch::plan_instance_sync(&instance, desired)? {
                    Some(p) => api.patch_instance(vm, &p).await,
                    None => Ok(instance),
                }
            },
        )
        .await
    }
}

async fn running_instance(api: &dyn ClusterApi, vm: &VmRef) -> Result<VmInstance> {
    let instance = api
        .get_instance(vm)
        .await?
        .ok_or_else(|| HotplugError::not_found("instance", vm.to_string()))?;
    if !instance.is_running() {
        return Err(HotplugError::invalid(
            vm.to_string(),
            "-",
            format!("instance is {}, not running", instance.status.phase),
        ));
    }
    Ok(instance)
}

#[async_trait]
impl DeliveryStrategy for InPlaceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::InPlace
    }

    #[instrument(skip_all, fields(vm = %request.vm))]
    async fn deliver(&self, request: &HotplugRequest) -> Result<DeliveryOutcome> {
        let vm = &request.vm;
        let instance = self.sync_instance_spec(vm, &request.desired).await?;
        let uid = instance.uid().to_string();

        for name in &request.unplug {
            info!(iface = %name, uid = %uid, "Detaching interface");
            self.devices.detach(&uid, name).await?;
        }
        for name in &request.plug {
            let (network, iface) = request
                .desired
                .network(name)
                .zip(request.desired.interface(name))
                .ok_or_else(|| {
                    HotplugError::invalid(vm.to_string(), name, "not in desired template")
                })?;
            info!(iface = %name, uid = %uid, "Attaching interface");
            self.devices.attach(&uid, network, iface).await?;
        }

        let converged = self.observer.wait_converged(vm, &request.desired).await?;
        if converged.uid() != uid {
            return Err(HotplugError::backend_permanent(
                "in-place delivery",
                format!(
                    "instance of {} was replaced during delivery ({} -> {})",
                    vm,
                    uid,
                    converged.uid()
                ),
            ));
        }

        Ok(DeliveryOutcome {
            strategy: StrategyKind::InPlace,
            previous_uid: uid.clone(),
            instance_uid: uid,
            interfaces: converged.secondary_statuses(),
            migration_id: None,
        })
    }
}
