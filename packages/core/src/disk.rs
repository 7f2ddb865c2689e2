//! Block device and mount table scanning.
//!
//! Block devices come from `lsblk --json`, the live mount table from
//! `findmnt --json`. Mounted sources that are not block devices are turned
//! into network share or MTP rows.

use serde::Deserialize;

use crate::device::{DeviceRecord, MtpIds, Removability};
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::settings::Settings;
use crate::systemd::{MountUnit, Selector};

/// lsblk columns requested for the device table.
pub const LSBLK_COLUMNS: &str =
    "NAME,PATH,PKNAME,FSTYPE,SIZE,TYPE,HOTPLUG,RM,LABEL,PARTLABEL,PARTUUID,MODEL,SERIAL,UUID";

/// findmnt columns requested for the mount table.
pub const FINDMNT_COLUMNS: &str = "SOURCE,SIZE,FSTYPE,TARGET,OPTIONS";

/// Filesystem types that are always network filesystems.
const NETDEV_TYPES: &[&str] = &["cifs", "smb3", "nfs", "nfs4", "ncp", "ncpfs", "sshfs", "rclone"];

/// lsblk and findmnt print flags as booleans or "0"/"1" and sizes as numbers
/// or human readable strings, depending on version and options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Number(u64),
    Text(String),
}

impl Scalar {
    fn as_flag(&self) -> bool {
        match self {
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => *n != 0,
            Scalar::Text(s) => s == "1" || s == "true",
        }
    }

    fn into_text(self) -> String {
        match self {
            Scalar::Bool(b) => if b { "1" } else { "0" }.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LsblkDevice {
    name: Option<String>,
    path: Option<String>,
    pkname: Option<String>,
    fstype: Option<String>,
    size: Option<Scalar>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    hotplug: Option<Scalar>,
    rm: Option<Scalar>,
    label: Option<String>,
    partlabel: Option<String>,
    partuuid: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    uuid: Option<String>,
    children: Option<Vec<LsblkDevice>>,
}

/// One entry of the live mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub size: String,
    pub fstype: String,
    pub target: String,
    pub options: String,
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    #[serde(default)]
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FindmntEntry {
    source: Option<String>,
    size: Option<Scalar>,
    fstype: Option<String>,
    target: Option<String>,
    options: Option<String>,
}

/// Lists all block devices, disks and partitions alike.
pub fn scan_block_devices(ctx: &ExecutionContext, settings: &Settings) -> Result<Vec<DeviceRecord>> {
    let argv = vec![
        settings.bin("lsblk"),
        "--json".to_string(),
        "-o".to_string(),
        LSBLK_COLUMNS.to_string(),
    ];
    let stdout = ctx.run_checked(&argv)?;
    parse_lsblk(&stdout)
}

/// Parses `lsblk --json` output.
pub fn parse_lsblk(json: &str) -> Result<Vec<DeviceRecord>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;
    let mut devices = Vec::new();
    collect_devices(output.blockdevices, None, &mut devices);
    Ok(devices)
}

/// Recursively collect devices from lsblk output, parents before children.
fn collect_devices(lsblk_devices: Vec<LsblkDevice>, parent: Option<&str>, out: &mut Vec<DeviceRecord>) {
    for dev in lsblk_devices {
        let name = dev.name.unwrap_or_default();
        let removable = Removability::from_flags(
            dev.rm.as_ref().is_some_and(Scalar::as_flag),
            dev.hotplug.as_ref().is_some_and(Scalar::as_flag),
        );
        out.push(DeviceRecord {
            path: dev.path.unwrap_or_else(|| format!("/dev/{name}")),
            pkname: dev
                .pkname
                .or_else(|| parent.map(str::to_string))
                .unwrap_or_default(),
            fstype: dev.fstype.unwrap_or_default(),
            size: dev.size.map(Scalar::into_text).unwrap_or_default(),
            devtype: dev.device_type.unwrap_or_default(),
            removable,
            label: dev.label.unwrap_or_default(),
            partlabel: dev.partlabel.unwrap_or_default(),
            partuuid: dev.partuuid.unwrap_or_default(),
            model: dev.model.map(|m| m.trim().to_string()).unwrap_or_default(),
            serial: dev.serial.unwrap_or_default(),
            uuid: dev.uuid.unwrap_or_default(),
            name: name.clone(),
            ..DeviceRecord::default()
        });

        if let Some(children) = dev.children {
            collect_devices(children, Some(&name), out);
        }
    }
}

/// Reads the live mount table.
pub fn scan_mount_table(ctx: &ExecutionContext, settings: &Settings) -> Result<Vec<MountEntry>> {
    let argv = vec![
        settings.bin("findmnt"),
        "--json".to_string(),
        "--list".to_string(),
        "--uniq".to_string(),
        "-o".to_string(),
        FINDMNT_COLUMNS.to_string(),
    ];
    let stdout = ctx.run_checked(&argv)?;
    parse_findmnt(&stdout)
}

/// Parses `findmnt --json --list` output.
pub fn parse_findmnt(json: &str) -> Result<Vec<MountEntry>> {
    let output: FindmntOutput = serde_json::from_str(json).map_err(|e| Error::FindmntParse {
        message: e.to_string(),
    })?;
    Ok(output
        .filesystems
        .into_iter()
        .map(|fs| MountEntry {
            source: fs.source.unwrap_or_default(),
            size: fs.size.map(Scalar::into_text).unwrap_or_default(),
            fstype: fs.fstype.unwrap_or_default(),
            target: fs.target.unwrap_or_default(),
            options: fs.options.unwrap_or_default(),
        })
        .collect())
}

/// Merges the mount table into the device table.
///
/// Known devices get their mount point and options. Unknown sources become
/// network share rows when they look like one, or MTP rows for mounted
/// `fuse.*mtp*` filesystems; anything else is ignored.
pub fn apply_mount_table(devices: &mut Vec<DeviceRecord>, mounts: Vec<MountEntry>) {
    for m in mounts {
        if let Some(dev) = devices.iter_mut().find(|d| d.path == m.source) {
            dev.mountpoint = m.target;
            dev.options = m.options;
        } else if is_netdev(&m.source, &m.fstype, &m.options) {
            let (server, share) = split_netdev_path(&m.source);
            devices.push(DeviceRecord {
                name: share,
                pkname: server,
                path: m.source,
                size: m.size,
                fstype: m.fstype,
                options: m.options,
                mountpoint: m.target,
                netdev: true,
                ..DeviceRecord::default()
            });
        } else if m
            .fstype
            .strip_prefix("fuse.")
            .is_some_and(|sub| sub.contains("mtp"))
        {
            let (path, name) = match m.source.split_once(':') {
                Some((path, name)) if path.starts_with("/dev/bus/usb") => {
                    (path.to_string(), unescape_hex(name))
                }
                _ => (m.source.clone(), m.source.clone()),
            };
            if let Some(dev) = devices.iter_mut().find(|d| d.is_mtp() && d.path == path) {
                dev.fstype = m.fstype;
                dev.mountpoint = m.target;
                dev.options = m.options;
                continue;
            }
            devices.push(DeviceRecord {
                path,
                name,
                size: m.size,
                fstype: m.fstype,
                options: m.options,
                mountpoint: m.target,
                mtp: Some(MtpIds::default()),
                ..DeviceRecord::default()
            });
        }
    }
}

/// Adds network shares that have a path-selected unit but are not in the table yet.
pub fn add_preconfigured_netdevs(devices: &mut Vec<DeviceRecord>, units: &[MountUnit]) {
    for unit in units {
        if unit.selector != Selector::Path
            || devices.iter().any(|d| d.path == unit.what)
            || !is_netdev(&unit.what, &unit.fstype, &unit.options)
        {
            continue;
        }
        let (server, share) = split_netdev_path(&unit.what);
        devices.push(DeviceRecord {
            path: unit.what.clone(),
            name: share,
            pkname: server,
            fstype: unit.fstype.clone(),
            options: unit.options.clone(),
            netdev: true,
            ..DeviceRecord::default()
        });
    }
}

/// Heuristic for network filesystems: a known protocol type, a
/// `host:path` or UNC source, or the `_netdev` option.
pub fn is_netdev(path: &str, fstype: &str, options: &str) -> bool {
    let fstype = fstype.strip_prefix("fuse.").unwrap_or(fstype);
    if NETDEV_TYPES.contains(&fstype) {
        return true;
    }
    if !path.starts_with('/') && path.find(':').is_some_and(|pos| pos > 0) {
        return true;
    }
    if path.starts_with("//") || path.starts_with("\\\\") {
        return true;
    }
    options.contains("_netdev")
}

/// Splits a network source into server and share.
///
/// `//srv/share` gives `("srv", "/share")`; `srv:/export` gives
/// `("srv", ":/export")`. Brackets around IPv6 addresses are dropped and
/// backslashes in the share become slashes.
pub fn split_netdev_path(path: &str) -> (String, String) {
    let is_sep = |c: char| c == '/' || c == '\\';
    let Some(start) = path.find(|c: char| !is_sep(c)) else {
        return (path.to_string(), path.to_string());
    };
    let first = start + path[start..].chars().next().map_or(1, char::len_utf8);
    let sep = path[first..].find(is_sep).map(|p| p + first);
    let mut end = sep.unwrap_or(path.len());
    if start == 0
        && let Some(colon) = path[..sep.map_or(path.len(), |s| s + 1)].rfind(':')
    {
        end = colon;
    }
    let share = path[end..].replace('\\', "/");

    let mut server = &path[start..end];
    if server.len() >= 2 && server.starts_with('[') && server.ends_with(']') {
        server = &server[1..server.len() - 1];
    }
    (server.to_string(), share)
}

/// Decodes `\xHH` escapes; malformed escapes become a space.
pub fn unescape_hex(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            out.push(decoded.unwrap_or(b' '));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
