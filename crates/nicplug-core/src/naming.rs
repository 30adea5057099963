use sha2::{Digest, Sha256};

use crate::error::{HotplugError, Result};
use crate::template::DesiredConfiguration;

/// Number of primary interfaces ahead of the secondaries. Always one, first.
pub const PRIMARY_INTERFACES: usize = 1;

/// Guest device name for a device ordinal: 0 -> "eth0".
pub fn device_name(ordinal: usize) -> String {
    format!("eth{}", ordinal)
}

/// Device names for the template's live secondary interfaces, in spec order.
///
/// The first non-absent secondary is `eth1`, the next `eth2`, and so on,
/// regardless of the order in which they were plugged.
pub fn secondary_device_names(spec: &DesiredConfiguration) -> Vec<(String, String)> {
    spec.secondary_interfaces()
        .iter()
        .enumerate()
        .map(|(i, (net, _))| (net.name.clone(), device_name(i + PRIMARY_INTERFACES)))
        .collect()
}

/// Validate an interface name: lowercase alphanumeric + hyphens, 1-63 chars.
pub fn validate_interface_name(vm: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(HotplugError::invalid(
            vm,
            name,
            format!("name must be 1-63 characters, got {}", name.len()),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(HotplugError::invalid(
            vm,
            name,
            "name must be lowercase alphanumeric + hyphens",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(HotplugError::invalid(
            vm,
            name,
            "name must not start or end with a hyphen",
        ));
    }
    Ok(())
}

/// Deterministic MAC for an interface of a VM.
/// Format: 02:xx:xx:xx:xx:xx (locally administered, unicast).
pub fn mac_address(vm_uid: &str, iface: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vm_uid.as_bytes());
    hasher.update(b"/");
    hasher.update(iface.as_bytes());
    let digest = hasher.finalize();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2], digest[3], digest[4]
    )
}

/// Generate a random object uid.
pub fn generate_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse a "namespace/name" path. A bare name lands in "default".
pub fn parse_vm_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        None if !path.is_empty() => Ok(("default", path)),
        _ => Err(HotplugError::invalid(
            path,
            "-",
            "expected <namespace>/<name> or <name>",
        )),
    }
}
