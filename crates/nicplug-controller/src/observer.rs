//! Status convergence observer.
//!
//! Samples the instance until its secondary interface status matches what
//! the desired template implies, or a bounded wait runs out. Volatile fields (the MAC)
//! are ignored for set identity and checked separately against the template.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use nicplug_core::config::{HotplugConfig, MAX_TIMEOUT_SECS};
use nicplug_core::instance::{VmInstance, VmRef};
use nicplug_core::naming;
use nicplug_core::status::{InfoSources, ObservedInterfaceStatus};
use nicplug_core::template::DesiredConfiguration;
use nicplug_core::time::ceil_secs;
use nicplug_core::{HotplugError, Result};

use crate::backend::ClusterApi;

/// Queue count every hotplugged interface reports.
pub const EXPECTED_QUEUE_COUNT: u32 = 1;

/// The status entries (MAC cleared) a converged instance reports for `spec`.
pub fn expected_statuses(spec: &DesiredConfiguration) -> Vec<ObservedInterfaceStatus> {
    naming::secondary_device_names(spec)
        .into_iter()
        .map(|(name, dev)| ObservedInterfaceStatus {
            name,
            interface_name: dev,
            mac: String::new(),
            info_source: InfoSources::all(),
            queue_count: EXPECTED_QUEUE_COUNT,
        })
        .collect()
}

/// Short "name/dev[sources]" rendering for logs and timeout errors.
pub fn summarize(statuses: &[ObservedInterfaceStatus]) -> String {
    let parts: Vec<String> = statuses
        .iter()
        .map(|s| format!("{}/{}[{}]", s.name, s.interface_name, s.info_source))
        .collect();
    format!("[{}]", parts.join("; "))
}

fn sorted_without_mac(statuses: &[ObservedInterfaceStatus]) -> Vec<ObservedInterfaceStatus> {
    let mut v: Vec<ObservedInterfaceStatus> = statuses.iter().map(|s| s.without_mac()).collect();
    v.sort_by(|a, b| a.name.cmp(&b.name));
    v
}

/// Decide whether an instance has converged on `template`.
///
/// Returns a reason when it has not. Convergence requires that:
/// - the instance spec carries the same live secondary interfaces as the template,
/// - its secondary status entries equal the expected ones as a multiset,
///   ignoring MAC, so a partially confirmed entry never matches,
/// - every matched entry reports a MAC, equal to the template's when recorded.
pub fn check_convergence(
    instance: &VmInstance,
    template: &DesiredConfiguration,
) -> std::result::Result<(), String> {
    let live: Vec<&str> = instance
        .spec
        .secondary_interfaces()
        .iter()
        .map(|(_, i)| i.name.as_str())
        .collect();
    let wanted: Vec<&str> = template
        .secondary_interfaces()
        .iter()
        .map(|(_, i)| i.name.as_str())
        .collect();
    if live != wanted {
        return Err(format!(
            "instance spec lags template: live [{}], wanted [{}]",
            live.join(", "),
            wanted.join(", ")
        ));
    }

    let expected = expected_statuses(&instance.spec);
    let observed = instance.secondary_statuses();
    if sorted_without_mac(&expected) != sorted_without_mac(&observed) {
        return Err(format!(
            "interface status {} does not match {}",
            summarize(&observed),
            summarize(&expected)
        ));
    }

    for status in &observed {
        if status.mac.is_empty() {
            return Err(format!("{} reports no MAC address", status.name));
        }
        let recorded = template
            .interface(&status.name)
            .and_then(|i| i.mac_address.as_deref());
        if recorded.is_some_and(|mac| !mac.eq_ignore_ascii_case(&status.mac)) {
            return Err(format!(
                "{} reports MAC {} but template records {}",
                status.name,
                status.mac,
                recorded.unwrap_or_default()
            ));
        }
    }
    Ok(())
}

/// Polls instance status with bounded waits.
#[derive(Clone)]
pub struct ConvergenceObserver {
    api: Arc<dyn ClusterApi>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ConvergenceObserver {
    pub fn new(api: Arc<dyn ClusterApi>, config: &HotplugConfig) -> Self {
        Self {
            api,
            timeout: config.convergence_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the running instance has converged on `template`.
    ///
    /// Transient backend errors are logged and the next sample is taken;
    /// any other error ends the wait. On timeout the desired state is left
    /// alone: the change may still land later.
    pub async fn wait_converged(
        &self,
        vm: &VmRef,
        template: &DesiredConfiguration,
    ) -> Result<VmInstance> {
        let start = Instant::now();
        let deadline = deadline_after(self.timeout);
        let mut last_reason = String::from("no sample taken");
        let mut last_observed = String::from("[]");

        loop {
            match self.api.get_instance(vm).await {
                Ok(Some(inst)) if inst.is_running() => match check_convergence(&inst, template) {
                    Ok(()) => {
                        info!(
                            vm = %vm,
                            uid = %inst.uid(),
                            interfaces = %summarize(&inst.secondary_statuses()),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Interfaces converged"
                        );
                        return Ok(inst);
                    }
                    Err(reason) => {
                        debug!(vm = %vm, %reason, "Not converged yet");
                        last_observed = summarize(&inst.secondary_statuses());
                        last_reason = reason;
                    }
                },
                Ok(Some(inst)) => {
                    last_reason = format!("instance phase is {}", inst.status.phase);
                }
                Ok(None) => {
                    last_reason = "no instance".to_string();
                }
                Err(e) if e.is_retryable() => {
                    warn!(vm = %vm, error = %e, "Status sample failed, will retry");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                warn!(vm = %vm, reason = %last_reason, "Convergence wait timed out");
                return Err(HotplugError::timeout(
                    vm.to_string(),
                    format!("interface status to converge ({})", last_reason),
                    summarize(&expected_statuses(template)),
                    last_observed,
                    ceil_secs(self.timeout),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for an instance whose uid differs from `previous_uid` to reach
    /// Running. Used after restarts and migrations.
    pub async fn wait_replacement_running(
        &self,
        vm: &VmRef,
        previous_uid: &str,
        timeout: Duration,
    ) -> Result<VmInstance> {
        let inst = self.poll_running(vm, Some(previous_uid), timeout).await?;
        info!(vm = %vm, old_uid = %previous_uid, new_uid = %inst.uid(), "Replacement instance is Running");
        Ok(inst)
    }

    /// Wait for whatever instance the VM has to reach Running.
    pub async fn wait_running(&self, vm: &VmRef, timeout: Duration) -> Result<VmInstance> {
        let inst = self.poll_running(vm, None, timeout).await?;
        info!(vm = %vm, uid = %inst.uid(), "Instance is Running");
        Ok(inst)
    }

    async fn poll_running(
        &self,
        vm: &VmRef,
        previous_uid: Option<&str>,
        timeout: Duration,
    ) -> Result<VmInstance> {
        let deadline = deadline_after(timeout);
        let mut last = String::from("no instance");

        loop {
            match self.api.get_instance(vm).await {
                Ok(Some(inst))
                    if inst.is_running() && previous_uid.is_none_or(|p| p != inst.uid()) =>
                {
                    return Ok(inst);
                }
                Ok(Some(inst)) => {
                    last = format!("uid {} in phase {}", inst.uid(), inst.status.phase);
                }
                Ok(None) => last = "no instance".to_string(),
                Err(e) if e.is_retryable() => {
                    warn!(vm = %vm, error = %e, "Instance sample failed, will retry");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                let expected = match previous_uid {
                    Some(p) => format!("uid != {} in phase running", p),
                    None => "phase running".to_string(),
                };
                return Err(HotplugError::timeout(
                    vm.to_string(),
                    "instance to reach Running",
                    expected,
                    last,
                    ceil_secs(timeout),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Deadline for a wait, clamped so an oversized timeout cannot overflow `Instant`.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS))
}
