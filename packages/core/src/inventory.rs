//! Device and unit inventory.

use std::path::Path;

use crate::device::DeviceRecord;
use crate::disk::{add_preconfigured_netdevs, apply_mount_table, scan_block_devices, scan_mount_table};
use crate::error::Error;
use crate::executor::ExecutionContext;
use crate::mtp::{SYSFS_USB_DEVICES, scan_mtp_devices};
use crate::settings::Settings;
use crate::systemd::{MountUnit, scan_units};

/// Snapshot of mount units and the local device table.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub units: Vec<MountUnit>,
    pub devices: Vec<DeviceRecord>,
}

impl Inventory {
    /// Builds a fresh inventory from the running system.
    pub fn refresh(ctx: &ExecutionContext, settings: &Settings) -> Self {
        Self::build(ctx, settings, Path::new(SYSFS_USB_DEVICES))
    }

    /// Builds the inventory reading MTP devices below `sysfs_usb`.
    ///
    /// A failing source contributes nothing; the rest of the table is still
    /// built.
    pub fn build(ctx: &ExecutionContext, settings: &Settings, sysfs_usb: &Path) -> Self {
        let units = scan_units(&settings.unit_search_paths, ctx.log);

        // command failures are logged by the context already
        let mut devices = match scan_block_devices(ctx, settings) {
            Ok(devices) => devices,
            Err(e @ Error::LsblkParse { .. }) => {
                ctx.log.error(&e.report());
                Vec::new()
            }
            Err(_) => Vec::new(),
        };

        match scan_mtp_devices(sysfs_usb) {
            Ok(mtp) => devices.extend(mtp),
            Err(e) => tracing::debug!(error = %e, "no MTP devices"),
        }

        match scan_mount_table(ctx, settings) {
            Ok(mounts) => apply_mount_table(&mut devices, mounts),
            Err(e @ Error::FindmntParse { .. }) => ctx.log.error(&e.report()),
            Err(_) => {}
        }
        add_preconfigured_netdevs(&mut devices, &units);

        tracing::debug!(units = units.len(), devices = devices.len(), "inventory built");
        Self { units, devices }
    }

    pub fn find_device(&self, path: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.path == path)
    }
}
