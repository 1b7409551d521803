//! Enumerating whole disks.
//!
//! * Linux: `/sys/block` entries named `sd*` or `nvme*`, as `/dev` paths.
//! * Windows: `\\.\PhysicalDrive0` upwards until the first missing number.
//! * macOS: whole disks listed by `diskutil list`.

use crate::device::DeviceKind;
use crate::platform;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// A disk found on this host, not yet opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub path: PathBuf,
    pub kind: DeviceKind,
}

/// Lists the disks this host exposes, in platform order.
///
/// Listing needs no privileges on Linux and macOS; opening the devices
/// afterwards does.
pub fn discover() -> std::io::Result<Vec<DiscoveredDevice>> {
    let devices: Vec<DiscoveredDevice> = platform::discover()?
        .into_iter()
        .map(|(path, kind)| DiscoveredDevice { path, kind })
        .collect();
    debug!(count = devices.len(), "discovered devices");
    Ok(devices)
}
