//! Long-lived state shared by the front-ends.
//!
//! A [`Session`] owns the settings, the invoking identity and the current
//! device tables. Every operation is guarded by its own [`BusyFlag`] so a
//! re-entrant call (for example a refresh triggered while a refresh is
//! already running) is a no-op instead of a second concurrent run.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use crate::device::{DeviceRecord, find_device};
use crate::error::Result;
use crate::executor::ExecutionContext;
use crate::identity::Identity;
use crate::inventory::Inventory;
use crate::mount::{MountPlan, MountRequest, Mounter, suggest_request};
use crate::mtp::SYSFS_USB_DEVICES;
use crate::net::{NetInterface, Resolver, list_active_interfaces, local_hostname};
use crate::netscan::{ScanTools, network_scan};
use crate::reconcile::{netdev_type_eq, update_netdevs_values};
use crate::settings::Settings;
use crate::systemd::MountUnit;

/// Marks an operation as running.
#[derive(Debug, Default)]
pub struct BusyFlag(Cell<bool>);

impl BusyFlag {
    /// Sets the flag, or returns `None` if it is already set.
    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        if self.0.replace(true) {
            return None;
        }
        Some(BusyGuard(&self.0))
    }

    pub fn is_busy(&self) -> bool {
        self.0.get()
    }
}

/// Clears its [`BusyFlag`] when dropped.
#[derive(Debug)]
pub struct BusyGuard<'a>(&'a Cell<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct Session<'a> {
    settings: Settings,
    identity: Identity,
    ctx: ExecutionContext<'a>,
    resolver: &'a dyn Resolver,
    sysfs_usb: PathBuf,
    inventory: RefCell<Inventory>,
    netdevs: RefCell<Vec<DeviceRecord>>,
    interfaces: RefCell<Vec<NetInterface>>,
    refreshing: BusyFlag,
    mounting: BusyFlag,
    scanning: BusyFlag,
}

impl<'a> Session<'a> {
    /// Creates an empty session; call [`refresh`](Self::refresh) to fill it.
    pub fn new(
        settings: Settings,
        identity: Identity,
        ctx: ExecutionContext<'a>,
        resolver: &'a dyn Resolver,
    ) -> Self {
        Self {
            settings,
            identity,
            ctx,
            resolver,
            sysfs_usb: PathBuf::from(SYSFS_USB_DEVICES),
            inventory: RefCell::new(Inventory::default()),
            netdevs: RefCell::new(Vec::new()),
            interfaces: RefCell::new(Vec::new()),
            refreshing: BusyFlag::default(),
            mounting: BusyFlag::default(),
            scanning: BusyFlag::default(),
        }
    }

    /// Reads MTP devices below another sysfs directory.
    pub fn with_sysfs_usb(mut self, path: impl AsRef<Path>) -> Self {
        self.sysfs_usb = path.as_ref().to_path_buf();
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn units(&self) -> Vec<MountUnit> {
        self.inventory.borrow().units.clone()
    }

    /// Rebuilds the unit inventory and device table.
    ///
    /// Returns false when a refresh is already running.
    pub fn refresh(&self) -> bool {
        let Some(_busy) = self.refreshing.try_acquire() else {
            tracing::debug!("refresh already running");
            return false;
        };
        let inventory = Inventory::build(&self.ctx, &self.settings, &self.sysfs_usb);
        *self.inventory.borrow_mut() = inventory;
        true
    }

    fn device(&self, path: &str) -> Option<DeviceRecord> {
        let inventory = self.inventory.borrow();
        let netdevs = self.netdevs.borrow();
        find_device(&[&inventory.devices, &netdevs], path).cloned()
    }

    /// Decides how `request` would be mounted without running anything.
    pub fn plan(&self, request: &MountRequest) -> Result<MountPlan> {
        let device = self.device(&request.path);
        let inventory = self.inventory.borrow();
        Mounter::new(&self.ctx, &self.settings, &self.identity, &inventory.units)
            .plan(request, device.as_ref())
    }

    /// Mounts and refreshes. Returns `Ok(None)` while another mount or
    /// unmount is running.
    pub fn mount(&self, request: &MountRequest) -> Result<Option<MountPlan>> {
        let Some(_busy) = self.mounting.try_acquire() else {
            return Ok(None);
        };
        let device = self.device(&request.path);
        let plan = {
            let inventory = self.inventory.borrow();
            Mounter::new(&self.ctx, &self.settings, &self.identity, &inventory.units)
                .mount(request, device.as_ref())?
        };
        self.refresh();
        Ok(Some(plan))
    }

    /// Unmounts and refreshes. Returns `Ok(None)` while another mount or
    /// unmount is running.
    pub fn unmount(&self, request: &MountRequest) -> Result<Option<()>> {
        let Some(_busy) = self.mounting.try_acquire() else {
            return Ok(None);
        };
        let device = self.device(&request.path);
        {
            let inventory = self.inventory.borrow();
            Mounter::new(&self.ctx, &self.settings, &self.identity, &inventory.units)
                .unmount(request, device.as_ref())?;
        }
        self.refresh();
        Ok(Some(()))
    }

    /// Suggested mount request for a known device.
    pub fn suggest(&self, path: &str) -> Option<MountRequest> {
        let device = self.device(path)?;
        let inventory = self.inventory.borrow();
        Some(suggest_request(&self.settings, &inventory.units, &device))
    }

    /// Scans the network for shares. Returns the number of shares found, or
    /// `None` when a scan is already running.
    pub fn network_scan(&self) -> Option<usize> {
        let interfaces = list_active_interfaces()
            .inspect_err(|e| self.ctx.log.warning(&e.report()))
            .unwrap_or_default();
        self.scan_with(ScanTools::detect(&self.settings), interfaces)
    }

    fn scan_with(&self, tools: ScanTools, interfaces: Vec<NetInterface>) -> Option<usize> {
        let _busy = self.scanning.try_acquire()?;
        let found = network_scan(&self.ctx, &self.settings, tools, &interfaces, self.resolver);
        let count = found.len();
        *self.interfaces.borrow_mut() = interfaces;
        *self.netdevs.borrow_mut() = found;
        Some(count)
    }

    /// The presentation table: local devices, then scanned shares that are
    /// not already listed, each share once.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut local = self.inventory.borrow().devices.clone();
        let mut scanned = self.netdevs.borrow().clone();
        let hostname = local_hostname(&self.settings);
        update_netdevs_values(
            &mut local,
            &mut scanned,
            &self.interfaces.borrow(),
            &hostname,
            self.resolver,
        );

        for found in scanned {
            if !local.iter().any(|dev| dev.netdev && same_share(dev, &found)) {
                local.push(found);
            }
        }
        local
    }
}

/// Same server, share name (ignoring case) and protocol family.
fn same_share(a: &DeviceRecord, b: &DeviceRecord) -> bool {
    a.pkname == b.pkname
        && a.name.to_uppercase() == b.name.to_uppercase()
        && netdev_type_eq(strip_fuse(&a.fstype), strip_fuse(&b.fstype))
}

fn strip_fuse(fstype: &str) -> &str {
    fstype.strip_prefix("fuse.").unwrap_or(fstype)
}
