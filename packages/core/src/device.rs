//! Unified device record.
//!
//! A [`DeviceRecord`] describes one row of the device table, whatever its
//! origin: a block device from lsblk, an MTP player from sysfs, a mounted or
//! preconfigured network share, or a share found by a network scan.
//!
//! Inside the crate every attribute is a named field. At the presentation
//! boundary the record is a flat string map whose keys are the fixed
//! [`DeviceKey`] schema (`PATH`, `NAME`, `MOUNTPOINT`, ...).

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// How a block device is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Removability {
    #[default]
    Fixed,
    /// Removable media (card readers, optical drives).
    Removable,
    /// Not removable media but a hotplug bus, usually USB.
    Hotplug,
}

impl Removability {
    /// Derives the tag from lsblk `RM` and `HOTPLUG` flags.
    pub fn from_flags(removable: bool, hotplug: bool) -> Self {
        match (removable, hotplug) {
            (true, _) => Removability::Removable,
            (false, true) => Removability::Hotplug,
            (false, false) => Removability::Fixed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Removability::Fixed => "0",
            Removability::Removable => "1",
            Removability::Hotplug => "USB",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "1" | "true" => Removability::Removable,
            "USB" => Removability::Hotplug,
            _ => Removability::Fixed,
        }
    }
}

/// Identifiers the MTP mount helpers need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MtpIds {
    /// 1-based detection index; `None` for an MTP filesystem seen only in the mount table.
    pub index: Option<usize>,
    /// `BUS,DEV` for jmtpfs.
    pub jmtpfs: String,
    /// `vid:pid` for aft-mtp-mount.
    pub aft: String,
}

/// One row of the device table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub name: String,
    pub mountpoint: String,
    pub fstype: String,
    pub label: String,
    pub uuid: String,
    pub partlabel: String,
    pub partuuid: String,
    /// Parent device name; for network shares the server.
    pub pkname: String,
    pub size: String,
    pub serial: String,
    /// Device model; for network shares the share comment.
    pub model: String,
    pub options: String,
    /// lsblk device type (`disk`, `part`, ...).
    pub devtype: String,
    pub removable: Removability,
    pub mtp: Option<MtpIds>,
    pub netdev: bool,
    pub host: String,
    pub ip: String,
}

impl DeviceRecord {
    pub fn is_mtp(&self) -> bool {
        self.mtp.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoint.is_empty()
    }

    /// Reads an attribute by schema key.
    pub fn get(&self, key: DeviceKey) -> String {
        match key {
            DeviceKey::Path => self.path.clone(),
            DeviceKey::Name => self.name.clone(),
            DeviceKey::Mountpoint => self.mountpoint.clone(),
            DeviceKey::FsType => self.fstype.clone(),
            DeviceKey::Label => self.label.clone(),
            DeviceKey::Uuid => self.uuid.clone(),
            DeviceKey::PartLabel => self.partlabel.clone(),
            DeviceKey::PartUuid => self.partuuid.clone(),
            DeviceKey::PkName => self.pkname.clone(),
            DeviceKey::Size => self.size.clone(),
            DeviceKey::Serial => self.serial.clone(),
            DeviceKey::Model => self.model.clone(),
            DeviceKey::Options => self.options.clone(),
            DeviceKey::Type => self.devtype.clone(),
            DeviceKey::Removable => self.removable.as_str().to_string(),
            DeviceKey::Mtp => match &self.mtp {
                Some(MtpIds { index: Some(i), .. }) => i.to_string(),
                Some(_) => "*".to_string(),
                None => String::new(),
            },
            DeviceKey::NetDev => (if self.netdev { "1" } else { "" }).to_string(),
            DeviceKey::Host => self.host.clone(),
            DeviceKey::Ip => self.ip.clone(),
        }
    }

    /// Writes an attribute by schema key.
    pub fn set(&mut self, key: DeviceKey, value: impl Into<String>) {
        let value = value.into();
        match key {
            DeviceKey::Path => self.path = value,
            DeviceKey::Name => self.name = value,
            DeviceKey::Mountpoint => self.mountpoint = value,
            DeviceKey::FsType => self.fstype = value,
            DeviceKey::Label => self.label = value,
            DeviceKey::Uuid => self.uuid = value,
            DeviceKey::PartLabel => self.partlabel = value,
            DeviceKey::PartUuid => self.partuuid = value,
            DeviceKey::PkName => self.pkname = value,
            DeviceKey::Size => self.size = value,
            DeviceKey::Serial => self.serial = value,
            DeviceKey::Model => self.model = value,
            DeviceKey::Options => self.options = value,
            DeviceKey::Type => self.devtype = value,
            DeviceKey::Removable => self.removable = Removability::parse(&value),
            DeviceKey::Mtp => {
                let previous = self.mtp.take().unwrap_or_default();
                self.mtp = (!value.is_empty()).then(|| MtpIds {
                    index: value.parse().ok(),
                    ..previous
                });
            }
            DeviceKey::NetDev => self.netdev = !value.is_empty(),
            DeviceKey::Host => self.host = value,
            DeviceKey::Ip => self.ip = value,
        }
    }
}

impl Serialize for DeviceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for key in DeviceKey::ALL {
            let value = self.get(*key);
            if !value.is_empty() {
                map.serialize_entry(key.as_str(), &value)?;
            }
        }
        map.end()
    }
}

/// The recognized attribute names of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Path,
    Name,
    Mountpoint,
    FsType,
    Label,
    Uuid,
    PartLabel,
    PartUuid,
    PkName,
    Size,
    Serial,
    Model,
    Options,
    Type,
    Removable,
    Mtp,
    NetDev,
    Host,
    Ip,
}

impl DeviceKey {
    pub const ALL: &'static [DeviceKey] = &[
        DeviceKey::Path,
        DeviceKey::Name,
        DeviceKey::Mountpoint,
        DeviceKey::FsType,
        DeviceKey::Label,
        DeviceKey::Uuid,
        DeviceKey::PartLabel,
        DeviceKey::PartUuid,
        DeviceKey::PkName,
        DeviceKey::Size,
        DeviceKey::Serial,
        DeviceKey::Model,
        DeviceKey::Options,
        DeviceKey::Type,
        DeviceKey::Removable,
        DeviceKey::Mtp,
        DeviceKey::NetDev,
        DeviceKey::Host,
        DeviceKey::Ip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKey::Path => "PATH",
            DeviceKey::Name => "NAME",
            DeviceKey::Mountpoint => "MOUNTPOINT",
            DeviceKey::FsType => "FSTYPE",
            DeviceKey::Label => "LABEL",
            DeviceKey::Uuid => "UUID",
            DeviceKey::PartLabel => "PARTLABEL",
            DeviceKey::PartUuid => "PARTUUID",
            DeviceKey::PkName => "PKNAME",
            DeviceKey::Size => "SIZE",
            DeviceKey::Serial => "SERIAL",
            DeviceKey::Model => "MODEL",
            DeviceKey::Options => "OPTIONS",
            DeviceKey::Type => "TYPE",
            DeviceKey::Removable => "RM",
            DeviceKey::Mtp => "_MTP",
            DeviceKey::NetDev => "_NETDEV",
            DeviceKey::Host => "HOST",
            DeviceKey::Ip => "IP",
        }
    }

    /// Parses a column name; unknown names are rejected rather than creating new keys.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.as_str() == name)
    }
}

/// Finds a device by path, searching the tables in order.
pub fn find_device<'a>(tables: &[&'a [DeviceRecord]], path: &str) -> Option<&'a DeviceRecord> {
    tables
        .iter()
        .find_map(|table| table.iter().find(|d| d.path == path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removability_tags() {
        assert_eq!(Removability::from_flags(false, true).as_str(), "USB");
        assert_eq!(Removability::from_flags(true, true).as_str(), "1");
        assert_eq!(Removability::from_flags(false, false).as_str(), "0");
    }

    #[test]
    fn test_key_schema_round_trip() {
        for key in DeviceKey::ALL {
            assert_eq!(DeviceKey::parse(key.as_str()), Some(*key));
        }
        assert_eq!(DeviceKey::parse("LABLE"), None);
    }

    #[test]
    fn test_set_and_get_markers() {
        let mut dev = DeviceRecord::default();
        dev.set(DeviceKey::Mtp, "*");
        assert!(dev.is_mtp());
        assert_eq!(dev.get(DeviceKey::Mtp), "*");

        dev.set(DeviceKey::Mtp, "2");
        assert_eq!(dev.mtp.as_ref().and_then(|m| m.index), Some(2));

        dev.set(DeviceKey::NetDev, "1");
        assert!(dev.netdev);
        dev.set(DeviceKey::Removable, "USB");
        assert_eq!(dev.removable, Removability::Hotplug);
    }

    #[test]
    fn test_serializes_non_empty_keys() {
        let dev = DeviceRecord {
            path: "/dev/sdb1".to_string(),
            label: "STICK".to_string(),
            removable: Removability::Hotplug,
            ..DeviceRecord::default()
        };
        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["PATH"], "/dev/sdb1");
        assert_eq!(json["LABEL"], "STICK");
        assert_eq!(json["RM"], "USB");
        assert!(json.get("UUID").is_none());
    }

    #[test]
    fn test_find_device_searches_tables_in_order() {
        let a = vec![DeviceRecord {
            path: "/dev/sda1".to_string(),
            name: "first".to_string(),
            ..DeviceRecord::default()
        }];
        let b = vec![DeviceRecord {
            path: "//nas/music".to_string(),
            ..DeviceRecord::default()
        }];
        assert_eq!(find_device(&[&a, &b], "/dev/sda1").unwrap().name, "first");
        assert!(find_device(&[&a, &b], "//nas/music").is_some());
        assert!(find_device(&[&a], "//nas/music").is_none());
    }
}
