//! Delivery strategies: how a template change reaches a running instance.

mod in_place;
mod migration;

pub use in_place::InPlaceStrategy;
pub use migration::MigrationStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use nicplug_core::Result;
use nicplug_core::config::{HotplugConfig, StrategyKind};
use nicplug_core::request::HotplugRequest;
use nicplug_core::status::ObservedInterfaceStatus;

use crate::backend::{ClusterApi, DeviceBackend};

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub strategy: StrategyKind,
    /// Instance uid before delivery.
    pub previous_uid: String,
    /// Instance uid after delivery. Equal to `previous_uid` for in-place.
    pub instance_uid: String,
    /// Converged secondary interface status.
    pub interfaces: Vec<ObservedInterfaceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<String>,
}

impl DeliveryOutcome {
    pub fn replaced_instance(&self) -> bool {
        self.previous_uid != self.instance_uid
    }
}

#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Carry `request` to the VM's running instance and wait until its
    /// interface status has converged on `request.desired`.
    async fn deliver(&self, request: &HotplugRequest) -> Result<DeliveryOutcome>;
}

pub fn build_strategy(
    kind: StrategyKind,
    api: Arc<dyn ClusterApi>,
    devices: Arc<dyn DeviceBackend>,
    config: &HotplugConfig,
) -> Box<dyn DeliveryStrategy> {
    match kind {
        StrategyKind::InPlace => Box::new(InPlaceStrategy::new(api, devices, config)),
        StrategyKind::Migration => Box::new(MigrationStrategy::new(api, config)),
    }
}
