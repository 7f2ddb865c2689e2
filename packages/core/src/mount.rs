//! Mount and unmount decisions.
//!
//! For every request the [`Mounter`] works out how much to trust the target,
//! whether the process may keep its privileges, and which tool performs the
//! mount: an MTP helper, a user mount, a systemd unit, `systemd-mount` or
//! plain `mount`. The decision is a [`MountPlan`] that can be inspected
//! before anything runs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::identity::Identity;
use crate::mtp::mtp_command;
use crate::placeholder::Placeholders;
use crate::privilege::PrivilegeGuard;
use crate::provision::create_mountpoint;
use crate::settings::Settings;
use crate::systemd::{MountUnit, find_by_target, find_for_device, find_for_request};
use crate::trust::{TrustLevel, classify};

/// A mount or unmount request as entered by the user.
///
/// `target` and `options` may contain `%x` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountRequest {
    pub path: String,
    pub fs_type: String,
    pub target: String,
    pub options: String,
}

/// Returns true if the comma separated `list` contains `opt` as a whole
/// item, optionally followed by `=value`.
///
/// ```
/// use usermount_core::mount::contains_opt;
///
/// assert!(contains_opt("rw,uid=1000", "uid"));
/// assert!(!contains_opt("rw,nosuid", "suid"));
/// ```
pub fn contains_opt(list: &str, opt: &str) -> bool {
    if opt.is_empty() {
        return false;
    }
    list.match_indices(opt).any(|(pos, _)| {
        let starts_item = pos == 0 || list.as_bytes()[pos - 1] == b',';
        let rest = &list[pos + opt.len()..];
        starts_item && (rest.is_empty() || rest.starts_with(',') || rest.starts_with('='))
    })
}

/// Options that keep a mount from honoring setuid bits and device nodes.
fn has_safe_options(options: &str) -> bool {
    contains_opt(options, "nosuid")
        && contains_opt(options, "nodev")
        && !contains_opt(options, "suid")
        && !contains_opt(options, "dev")
        && !contains_opt(options, "defaults")
}

/// Everything decided about a mount before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPlan {
    /// The request with placeholders expanded.
    pub request: MountRequest,
    pub trust: TrustLevel,
    /// A unit for this device and target exists.
    pub has_unit: bool,
    /// That unit has exactly the requested type and options.
    pub unit_exact: bool,
    /// The unit allows the invoking user to mount it.
    pub user_mount: bool,
    /// Options include `nosuid,nodev` and nothing that overrides them.
    pub safe_options: bool,
    pub mtp: bool,
    /// Privileges are dropped before the command runs.
    pub drop_priv: bool,
    /// The command starts a systemd unit.
    pub starts_unit: bool,
    pub argv: Vec<String>,
}

/// Mount and unmount operations for one identity and unit inventory.
pub struct Mounter<'a> {
    pub ctx: &'a ExecutionContext<'a>,
    pub settings: &'a Settings,
    pub identity: &'a Identity,
    pub units: &'a [MountUnit],
}

impl<'a> Mounter<'a> {
    pub fn new(
        ctx: &'a ExecutionContext<'a>,
        settings: &'a Settings,
        identity: &'a Identity,
        units: &'a [MountUnit],
    ) -> Self {
        Self {
            ctx,
            settings,
            identity,
            units,
        }
    }

    fn expand(&self, request: &MountRequest, device: Option<&DeviceRecord>) -> MountRequest {
        let values = Placeholders::new(&request.path, &request.fs_type, device, self.identity);
        MountRequest {
            path: request.path.clone(),
            fs_type: request.fs_type.clone(),
            target: values.expand(&request.target),
            options: values.expand(&request.options),
        }
    }

    /// Decides how to mount `request`. Nothing is executed.
    ///
    /// Fails for an empty device path or target and for rejected targets.
    pub fn plan(&self, request: &MountRequest, device: Option<&DeviceRecord>) -> Result<MountPlan> {
        if request.path.is_empty() {
            return Err(Error::MissingField { field: "path" });
        }
        if request.target.is_empty() {
            return Err(Error::MissingField { field: "target" });
        }
        let request = self.expand(request, device);

        let trust = classify(&request.target, &self.settings.system_dirs, self.ctx.log);
        if trust == TrustLevel::Rejected {
            return Err(if request.target.starts_with('/') {
                Error::RejectedMountPoint {
                    path: request.target,
                    reason: "its location could not be checked".to_string(),
                }
            } else {
                Error::RelativeMountPoint {
                    path: request.target,
                }
            });
        }

        let unit = find_for_request(self.units, &request.path, &request.target, device);
        let unit_exact = unit.is_some_and(|u| u.is_exact(&request.fs_type, &request.options));
        let user_mount = unit_exact
            && if self.ctx.is_unprivileged() {
                contains_opt(&request.options, "user") || contains_opt(&request.options, "users")
            } else {
                contains_opt(&request.options, "user")
            };
        let safe_options = has_safe_options(&request.options);
        let mtp = device.is_some_and(DeviceRecord::is_mtp);

        let drop_priv = mtp
            || user_mount
            || device.is_none()
            || (!safe_options && !unit_exact)
            || trust == TrustLevel::NeedsAuthentication
            || (trust == TrustLevel::SystemProtected && !unit_exact);

        let starts_unit = !mtp && !user_mount && self.settings.use_systemctl && unit_exact;
        let argv = match (mtp, device) {
            (true, Some(dev)) => mtp_command(
                self.settings,
                dev,
                &request.fs_type,
                &request.target,
                &request.options,
            )?,
            _ if user_mount => vec![
                self.settings.bin("mount"),
                "-v".to_string(),
                "--target".to_string(),
                request.target.clone(),
            ],
            _ => {
                let mut argv = self.escalation_prefix();
                if let Some(unit) = unit.filter(|_| starts_unit) {
                    argv.extend([
                        self.settings.bin("systemctl"),
                        "start".to_string(),
                        unit.start_name(),
                    ]);
                } else if self.settings.use_systemd_mount
                    && find_by_target(self.units, &request.target).is_none()
                {
                    argv.extend([
                        self.settings.bin("systemd-mount"),
                        "--discover".to_string(),
                        "-Glt".to_string(),
                        request.fs_type.clone(),
                        "-o".to_string(),
                        request.options.clone(),
                        request.path.clone(),
                        request.target.clone(),
                    ]);
                } else {
                    argv.extend([
                        self.settings.bin("mount"),
                        "-vt".to_string(),
                        request.fs_type.clone(),
                        "-o".to_string(),
                        request.options.clone(),
                        request.path.clone(),
                        request.target.clone(),
                    ]);
                }
                argv
            }
        };

        tracing::debug!(
            target = %request.target,
            ?trust,
            unit_exact,
            user_mount,
            safe_options,
            mtp,
            drop_priv,
            "mount plan"
        );
        Ok(MountPlan {
            request,
            trust,
            has_unit: unit.is_some(),
            unit_exact,
            user_mount,
            safe_options,
            mtp,
            drop_priv,
            starts_unit,
            argv,
        })
    }

    fn escalation_prefix(&self) -> Vec<String> {
        if self.ctx.is_unprivileged() {
            self.ctx.escalation().to_vec()
        } else {
            Vec::new()
        }
    }

    /// Mounts a device.
    ///
    /// Below an untrusted target the mount point is created with lowered
    /// privileges; the command itself runs lowered whenever the plan says
    /// so. Privileges are restored when this returns.
    pub fn mount(&self, request: &MountRequest, device: Option<&DeviceRecord>) -> Result<MountPlan> {
        let plan = self.plan(request, device)?;
        let mut guard = PrivilegeGuard::new(self.ctx.credentials, self.ctx.log);

        if plan.drop_priv && plan.trust != TrustLevel::Trusted {
            guard.drop_if_feasible(self.identity)?;
        }
        create_mountpoint(self.ctx, self.settings, self.identity, &plan.request.target)?;
        if plan.drop_priv {
            guard.drop_if_feasible(self.identity)?;
        }

        self.ctx.run_logged(&plan.argv)?;
        if plan.starts_unit {
            // an automount unit only mounts on first access
            let _ = self
                .ctx
                .dirs
                .kind(&Path::new(&plan.request.target).join("."));
        }
        guard.restore()?;
        self.ctx.log.success(&format!(
            "Device {} has been successfully mounted.",
            plan.request.path
        ));
        Ok(plan)
    }

    /// Unmounts the filesystem at the request's target.
    ///
    /// A unit that lets users mount it, or a FUSE filesystem without a unit,
    /// is unmounted without escalation.
    pub fn unmount(&self, request: &MountRequest, device: Option<&DeviceRecord>) -> Result<()> {
        let values = Placeholders::new(&request.path, &request.fs_type, device, self.identity);
        let target = values.expand(&request.target);
        if target.is_empty() {
            return Err(Error::MissingField { field: "target" });
        }

        let unit = find_for_request(self.units, &request.path, &target, device);
        let user_mount = match unit {
            Some(u) => contains_opt(&u.options, "user") || contains_opt(&u.options, "users"),
            None => request.fs_type.starts_with("fuse."),
        };

        let mut argv = if user_mount {
            Vec::new()
        } else {
            self.escalation_prefix()
        };
        if self.settings.use_systemd_umount && unit.is_some() && !user_mount {
            argv.extend([self.settings.bin("systemd-mount"), "-Glu".to_string(), target]);
        } else {
            argv.extend([self.settings.bin("umount"), "-v".to_string(), target]);
        }

        self.ctx.run_logged(&argv)?;
        self.ctx.log.success(&format!(
            "Device {} has been successfully unmounted.",
            request.path
        ));
        Ok(())
    }
}

/// Pre-fills a mount request for a device.
///
/// A mounted device keeps its current target and options. Otherwise the
/// filesystem type is mapped through the aliases, options come from the
/// best saved preset or the defaults, and a unit that mounts this device
/// overrides all of them.
pub fn suggest_request(settings: &Settings, units: &[MountUnit], device: &DeviceRecord) -> MountRequest {
    if device.is_mounted() {
        return MountRequest {
            path: device.path.clone(),
            fs_type: device.fstype.clone(),
            target: device.mountpoint.clone(),
            options: device.options.clone(),
        };
    }

    let mut fs_type = device.fstype.clone();
    if device.is_mtp()
        && let Some(tool) = settings.select_mtp_tool()
    {
        fs_type = format!("fuse.{tool}");
    }
    if let Some(alias) = settings.aliases.get(&fs_type) {
        fs_type.clone_from(alias);
    }

    let mut target = settings.mountpoint.clone();
    let mut options = String::new();
    if let Some(preset) = settings.find_suitable(&fs_type, &device.label, &device.uuid) {
        if !preset.mountpoint.is_empty() {
            target.clone_from(&preset.mountpoint);
        }
        options.clone_from(&preset.options);
    } else if !fs_type.is_empty() {
        options.clone_from(&settings.default_options);
    }

    if let Some(unit) = find_for_device(units, device) {
        target.clone_from(&unit.where_);
        options.clone_from(&unit.options);
        fs_type = if unit.fstype.is_empty() {
            device.fstype.clone()
        } else {
            unit.fstype.clone()
        };
    }

    MountRequest {
        path: device.path.clone(),
        fs_type,
        target,
        options,
    }
}
