use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use nicplug_core::config::{HotplugConfig, StrategyKind};
use nicplug_core::instance::{VmInstance, VmRef};
use nicplug_core::request::HotplugRequest;
use nicplug_core::time::ceil_secs;
use nicplug_core::{HotplugError, Result};

use super::{DeliveryOutcome, DeliveryStrategy};
use crate::backend::{ClusterApi, MigrationPhase};
use crate::observer::{ConvergenceObserver, deadline_after};

/// A completed migration.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub migration_id: String,
    pub previous_uid: String,
    pub instance: VmInstance,
}

/// Deliver by live-migrating to an instance built from the desired template.
pub struct MigrationStrategy {
    api: Arc<dyn ClusterApi>,
    observer: ConvergenceObserver,
    migration_timeout: Duration,
}

impl MigrationStrategy {
    pub fn new(api: Arc<dyn ClusterApi>, config: &HotplugConfig) -> Self {
        Self {
            observer: ConvergenceObserver::new(api.clone(), config),
            api,
            migration_timeout: config.migration_timeout(),
        }
    }

    /// Migrate the running instance and wait for the replacement to run.
    ///
    /// On a failed migration the source instance is re-read and compared
    /// with its pre-migration snapshot; the result is carried in
    /// `MigrationFailed::source_preserved`.
    #[instrument(skip(self), fields(vm = %vm))]
    pub async fn migrate(&self, vm: &VmRef) -> Result<MigrationResult> {
        let before = self
            .api
            .get_instance(vm)
            .await?
            .filter(VmInstance::is_running)
            .ok_or_else(|| {
                HotplugError::invalid(vm.to_string(), "-", "no running instance to migrate")
            })?;

        let migration_id = self.api.start_migration(vm).await?;
        info!(migration = %migration_id, uid = %before.uid(), "Migration started");

        match self.wait_terminal(vm, &migration_id).await? {
            MigrationPhase::Succeeded => {}
            MigrationPhase::Failed { reason } => {
                let after = self.api.get_instance(vm).await?;
                let source_preserved = after.as_ref().is_some_and(|a| {
                    a.uid() == before.uid() && a.spec == before.spec && a.status == before.status
                });
                if source_preserved {
                    warn!(migration = %migration_id, %reason, "Migration failed, source instance untouched");
                } else {
                    error!(
                        migration = %migration_id,
                        %reason,
                        "Migration failed and the source instance changed"
                    );
                }
                return Err(HotplugError::MigrationFailed {
                    vm: vm.to_string(),
                    migration_id,
                    reason,
                    source_preserved,
                });
            }
            // wait_terminal only returns terminal phases
            other => {
                return Err(HotplugError::backend_permanent(
                    "migration",
                    format!("unexpected phase {:?}", other),
                ));
            }
        }

        let instance = self
            .observer
            .wait_replacement_running(vm, before.uid(), self.migration_timeout)
            .await?;
        Ok(MigrationResult {
            migration_id,
            previous_uid: before.uid().to_string(),
            instance,
        })
    }

    async fn wait_terminal(&self, vm: &VmRef, migration_id: &str) -> Result<MigrationPhase> {
        let deadline = deadline_after(self.migration_timeout);
        let mut last = MigrationPhase::Pending;
        loop {
            match self.api.migration_phase(vm, migration_id).await {
                Ok(phase) if phase.is_terminal() => return Ok(phase),
                Ok(phase) => last = phase,
                Err(e) if e.is_retryable() => {
                    warn!(migration = %migration_id, error = %e, "Migration phase query failed");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(HotplugError::timeout(
                    vm.to_string(),
                    format!("migration {} to finish", migration_id),
                    "succeeded or failed",
                    format!("{:?}", last),
                    ceil_secs(self.migration_timeout),
                ));
            }
            tokio::time::sleep(self.observer.poll_interval()).await;
        }
    }
}

#[async_trait]
impl DeliveryStrategy for MigrationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Migration
    }

    #[instrument(skip_all, fields(vm = %request.vm))]
    async fn deliver(&self, request: &HotplugRequest) -> Result<DeliveryOutcome> {
        let migrated = self.migrate(&request.vm).await?;
        let converged = self
            .observer
            .wait_converged(&request.vm, &request.desired)
            .await?;
        if converged.uid() != migrated.instance.uid() {
            return Err(HotplugError::backend_permanent(
                "migration delivery",
                format!(
                    "instance of {} changed again after migration ({} -> {})",
                    request.vm,
                    migrated.instance.uid(),
                    converged.uid()
                ),
            ));
        }
        Ok(DeliveryOutcome {
            strategy: StrategyKind::Migration,
            previous_uid: migrated.previous_uid,
            instance_uid: converged.uid().to_string(),
            interfaces: converged.secondary_statuses(),
            migration_id: Some(migrated.migration_id),
        })
    }
}
