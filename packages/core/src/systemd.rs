//! Systemd mount unit inventory.
//!
//! Reads `.mount` unit files from the ordered unit search path and answers
//! the lookups the decision engine needs: which unit targets a directory,
//! which unit describes a given device, and which unit to start.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use snafu::ResultExt;

use crate::device::DeviceRecord;
use crate::error::{Result, UnitParseSnafu};
use crate::log::LogSink;

/// Which device attribute a unit's `What=` names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Selector {
    #[default]
    Path,
    Label,
    Uuid,
    PartLabel,
    PartUuid,
}

impl Selector {
    fn from_prefix(name: &str) -> Option<Self> {
        match name {
            "LABEL" => Some(Selector::Label),
            "UUID" => Some(Selector::Uuid),
            "PARTLABEL" => Some(Selector::PartLabel),
            "PARTUUID" => Some(Selector::PartUuid),
            _ => None,
        }
    }

    /// The attribute of `device` this selector compares against.
    pub fn attribute<'a>(&self, device: &'a DeviceRecord) -> &'a str {
        match self {
            Selector::Path => &device.path,
            Selector::Label => &device.label,
            Selector::Uuid => &device.uuid,
            Selector::PartLabel => &device.partlabel,
            Selector::PartUuid => &device.partuuid,
        }
    }
}

/// A parsed `.mount` unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountUnit {
    pub unit_path: PathBuf,
    pub selector: Selector,
    /// Selector value: a device path for [`Selector::Path`], else the label/UUID.
    pub what: String,
    #[serde(rename = "where")]
    pub where_: String,
    pub fstype: String,
    pub options: String,
}

impl MountUnit {
    /// Returns true if this unit mounts `device`. An empty attribute never matches.
    pub fn matches_device(&self, device: &DeviceRecord) -> bool {
        let value = self.selector.attribute(device);
        !value.is_empty() && value == self.what
    }

    /// Returns true if type and options are byte-identical to the request's.
    pub fn is_exact(&self, fstype: &str, options: &str) -> bool {
        self.fstype == fstype && self.options == options
    }

    /// File name of the unit to start; a sibling `.automount` wins if present.
    pub fn start_name(&self) -> String {
        let automount = self.unit_path.with_extension("automount");
        let chosen = if automount.exists() {
            &automount
        } else {
            &self.unit_path
        };
        chosen
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Resolves `/dev/disk/by-*/...` links to `/dev/<name>`.
fn resolve_dev_link(what: &str) -> String {
    if what.starts_with("/dev/disk/")
        && let Ok(target) = fs::read_link(what)
        && let Some(name) = target.file_name()
    {
        return format!("/dev/{}", name.to_string_lossy());
    }
    what.to_string()
}

/// Parses the `[Mount]` section of a unit file.
///
/// Returns `None` when `What=` or `Where=` is missing.
pub fn parse_unit(content: &str, unit_path: &Path) -> Option<MountUnit> {
    let mut unit = MountUnit {
        unit_path: unit_path.to_path_buf(),
        ..MountUnit::default()
    };
    let mut in_mount = false;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_mount = section.trim() == "Mount";
            continue;
        }
        if !in_mount {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "Options" => unit.options = value.to_string(),
            "Type" => unit.fstype = value.to_string(),
            "Where" => unit.where_ = value.to_string(),
            "What" => {
                let tagged = value
                    .split_once('=')
                    .and_then(|(tag, v)| Some((Selector::from_prefix(tag.trim())?, v)));
                match tagged {
                    Some((selector, v)) => {
                        unit.selector = selector;
                        unit.what = v.trim().trim_matches('"').to_string();
                    }
                    None => {
                        unit.selector = Selector::Path;
                        unit.what = resolve_dev_link(value);
                    }
                }
            }
            _ => {}
        }
    }

    (!unit.what.is_empty() && !unit.where_.is_empty()).then_some(unit)
}

/// Reads and parses one unit file.
pub fn read_unit(path: &Path) -> Result<Option<MountUnit>> {
    let content = fs::read_to_string(path).context(UnitParseSnafu { path })?;
    Ok(parse_unit(&content, path))
}

/// Collects mount units from the search path.
///
/// Earlier directories win for a unit name. Symlinked units are skipped.
/// Unreadable units are logged and skipped.
pub fn scan_units(search_paths: &[PathBuf], log: &dyn LogSink) -> Vec<MountUnit> {
    let mut seen = HashSet::new();
    let mut units = Vec::new();

    for dir in search_paths {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "mount"))
            .collect();
        paths.sort();

        for path in paths {
            let is_link = fs::symlink_metadata(&path).map_or(true, |m| m.file_type().is_symlink());
            if is_link {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_os_string()) else {
                continue;
            };
            if !seen.insert(name) {
                continue;
            }
            match read_unit(&path) {
                Ok(Some(unit)) => units.push(unit),
                Ok(None) => tracing::debug!(unit = %path.display(), "ignoring incomplete unit"),
                Err(e) => log.warning(&e.report()),
            }
        }
    }
    units
}

/// Finds the unit whose `Where=` is `mountpoint`.
pub fn find_by_target<'a>(units: &'a [MountUnit], mountpoint: &str) -> Option<&'a MountUnit> {
    units.iter().find(|u| u.where_ == mountpoint)
}

/// Finds the unit targeting `mountpoint` that also names this device.
///
/// A path selector compares against `path`; the other selectors need the
/// device record and never match without one.
pub fn find_for_request<'a>(
    units: &'a [MountUnit],
    path: &str,
    mountpoint: &str,
    device: Option<&DeviceRecord>,
) -> Option<&'a MountUnit> {
    let unit = find_by_target(units, mountpoint)?;
    let value = match (unit.selector, device) {
        (Selector::Path, _) => path,
        (selector, Some(dev)) => selector.attribute(dev),
        (_, None) => return None,
    };
    (value == unit.what).then_some(unit)
}

/// Finds the first unit whose selector matches the device.
pub fn find_for_device<'a>(units: &'a [MountUnit], device: &DeviceRecord) -> Option<&'a MountUnit> {
    units.iter().find(|u| u.matches_device(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RecordingSink;

    const DATA_UNIT: &str = "\
[Unit]
Description=Data disk

[Mount]
What=UUID=1234-ABCD
Where=/mnt/data
Type=exfat
Options=nodev,nosuid,uid=1000

[Install]
WantedBy=multi-user.target
";

    fn unit(selector: Selector, what: &str, where_: &str) -> MountUnit {
        MountUnit {
            unit_path: PathBuf::from("/etc/systemd/system/x.mount"),
            selector,
            what: what.to_string(),
            where_: where_.to_string(),
            fstype: "ext4".to_string(),
            options: "defaults".to_string(),
        }
    }

    #[test]
    fn test_parse_uuid_unit() {
        let unit = parse_unit(DATA_UNIT, Path::new("/etc/systemd/system/mnt-data.mount")).unwrap();
        assert_eq!(unit.selector, Selector::Uuid);
        assert_eq!(unit.what, "1234-ABCD");
        assert_eq!(unit.where_, "/mnt/data");
        assert_eq!(unit.fstype, "exfat");
        assert_eq!(unit.options, "nodev,nosuid,uid=1000");
    }

    #[test]
    fn test_parse_path_and_network_units() {
        let content = "[Mount]\nWhat=//nas/music\nWhere=/mnt/music\nType=cifs\n";
        let unit = parse_unit(content, Path::new("mnt-music.mount")).unwrap();
        assert_eq!(unit.selector, Selector::Path);
        assert_eq!(unit.what, "//nas/music");

        // keys outside [Mount] are ignored
        let content = "[Unit]\nWhat=/dev/sda1\nWhere=/mnt/x\n";
        assert!(parse_unit(content, Path::new("mnt-x.mount")).is_none());

        let content = "[Mount]\nWhere=/mnt/x\n";
        assert!(parse_unit(content, Path::new("mnt-x.mount")).is_none());
    }

    #[test]
    fn test_scan_first_occurrence_wins_and_skips_links() {
        let tmp = tempfile::tempdir().unwrap();
        let early = tmp.path().join("early");
        let late = tmp.path().join("late");
        fs::create_dir_all(&early).unwrap();
        fs::create_dir_all(&late).unwrap();

        fs::write(early.join("mnt-data.mount"), DATA_UNIT).unwrap();
        fs::write(
            late.join("mnt-data.mount"),
            "[Mount]\nWhat=/dev/sdz1\nWhere=/mnt/other\n",
        )
        .unwrap();
        fs::write(
            late.join("mnt-b.mount"),
            "[Mount]\nWhat=LABEL=B\nWhere=/mnt/b\n",
        )
        .unwrap();
        std::os::unix::fs::symlink(late.join("mnt-b.mount"), early.join("mnt-link.mount")).unwrap();
        fs::write(early.join("notes.txt"), "x").unwrap();

        let log = RecordingSink::new();
        let units = scan_units(&[early, late, tmp.path().join("missing")], &log);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].where_, "/mnt/data");
        assert_eq!(units[1].selector, Selector::Label);
        assert!(log.lines().is_empty());
    }

    #[test]
    fn test_find_for_device_requires_non_empty_attribute() {
        let units = vec![
            unit(Selector::Label, "", "/mnt/empty"),
            unit(Selector::Label, "GAMES", "/mnt/games"),
            unit(Selector::PartUuid, "p-1", "/mnt/p"),
        ];
        let dev = DeviceRecord {
            path: "/dev/sdb1".to_string(),
            partuuid: "p-1".to_string(),
            ..DeviceRecord::default()
        };
        assert_eq!(find_for_device(&units, &dev).unwrap().where_, "/mnt/p");

        let labelled = DeviceRecord {
            label: "GAMES".to_string(),
            ..DeviceRecord::default()
        };
        assert_eq!(find_for_device(&units, &labelled).unwrap().where_, "/mnt/games");
    }

    #[test]
    fn test_find_for_request() {
        let units = vec![
            unit(Selector::Path, "/dev/sdb1", "/mnt/a"),
            unit(Selector::Uuid, "U-1", "/mnt/b"),
        ];
        assert!(find_for_request(&units, "/dev/sdb1", "/mnt/a", None).is_some());
        assert!(find_for_request(&units, "/dev/sdc1", "/mnt/a", None).is_none());
        assert!(find_for_request(&units, "/dev/sdb1", "/mnt/b", None).is_none());

        let dev = DeviceRecord {
            uuid: "U-1".to_string(),
            ..DeviceRecord::default()
        };
        assert!(find_for_request(&units, "/dev/sdb1", "/mnt/b", Some(&dev)).is_some());
        assert!(find_by_target(&units, "/mnt/c").is_none());
    }

    #[test]
    fn test_start_name_prefers_automount() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mnt-data.mount");
        fs::write(&mount, DATA_UNIT).unwrap();
        let mut unit = unit(Selector::Path, "/dev/sda1", "/mnt/data");
        unit.unit_path = mount;
        assert_eq!(unit.start_name(), "mnt-data.mount");

        fs::write(tmp.path().join("mnt-data.automount"), "").unwrap();
        assert_eq!(unit.start_name(), "mnt-data.automount");
    }

    #[test]
    fn test_exact_match() {
        let unit = unit(Selector::Path, "/dev/sda1", "/mnt/a");
        assert!(unit.is_exact("ext4", "defaults"));
        assert!(!unit.is_exact("ext4", "defaults,ro"));
    }
}
