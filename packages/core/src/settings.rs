//! Program settings.
//!
//! `Settings` is a plain value object handed to every component that needs
//! it. It is deserialized from a JSON file; every field has a default so a
//! partial (or missing) file is fine.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, IoResultExt, Result};

/// Restricted mount point prefixes; mounting below them always needs scrutiny.
pub const SYSTEM_DIRS: &[&str] = &[
    "/boot", "/efi", "/etc", "/run", "/usr", "/var", "/dev", "/proc", "/sys", "/bin", "/sbin",
    "/lib", "/lib64", "/opt", "/root",
];

/// Default directory holding external tools.
pub const BIN_PREFIX: &str = "/usr/bin/";

/// Ordered systemd unit search path (`systemd-analyze unit-paths`).
///
/// `/usr/lib/systemd/system` is deliberately absent: distribution units are
/// never mount targets for removable media.
pub const UNIT_SEARCH_PATHS: &[&str] = &[
    "/etc/systemd/system.control",
    "/run/systemd/system.control",
    "/run/systemd/transient",
    "/run/systemd/generator.early",
    "/etc/systemd/system",
    "/etc/systemd/system.attached",
    "/run/systemd/system",
    "/run/systemd/system.attached",
    "/run/systemd/generator",
    "/usr/local/lib/systemd/system",
    "/run/systemd/generator.late",
];

/// Escalation commands that may prefix a privileged argv, with their fixed arguments.
const APPROVED_ESCALATION: &[&[&str]] = &[&["sudo", "-n"], &["pkexec"], &["lxsudo"]];

/// MTP mount helpers in order of preference.
pub const MTP_TOOLS: &[&str] = &["aft-mtp-mount", "simple-mtpfs", "jmtpfs"];

/// Saved mount options for devices matching a filesystem type, label and UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionPreset {
    pub fs_type: String,
    pub label: String,
    pub uuid: String,
    pub options: String,
    pub mountpoint: String,
}

/// All program settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Basename of the escalation command (`pkexec`, `sudo`, `lxsudo`), empty to disable.
    pub escalation: String,
    /// Default mount point template.
    pub mountpoint: String,
    /// Default mount options.
    pub default_options: String,
    /// Start an exact-matching systemd unit instead of calling `mount`.
    pub use_systemctl: bool,
    /// Use `systemd-mount` when no unit targets the mount point.
    pub use_systemd_mount: bool,
    /// Use `systemd-mount -u` for unit-backed unmounts.
    pub use_systemd_umount: bool,
    /// MTP helper name or `auto`.
    pub mtp_tool: String,
    /// Local hostname or `auto`.
    pub hostname: String,
    pub use_avahi: bool,
    pub use_wsd: bool,
    pub use_nmap: bool,
    /// Space separated nmap targets or `auto`.
    pub nmap_networks: String,
    /// Protected mount point prefixes.
    pub system_dirs: Vec<String>,
    /// Directory holding external tools, with trailing slash.
    pub bin_prefix: String,
    /// Ordered systemd unit directories; earlier entries win.
    pub unit_search_paths: Vec<PathBuf>,
    /// Preferred filesystem type names, e.g. `ntfs` to `ntfs3`.
    pub aliases: BTreeMap<String, String>,
    /// Saved option presets.
    pub options_db: Vec<OptionPreset>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            escalation: "pkexec".to_string(),
            mountpoint: "/mnt/%d".to_string(),
            default_options: "nodev,nosuid".to_string(),
            use_systemctl: false,
            use_systemd_mount: false,
            use_systemd_umount: true,
            mtp_tool: "auto".to_string(),
            hostname: "auto".to_string(),
            use_avahi: true,
            use_wsd: true,
            use_nmap: true,
            nmap_networks: "auto".to_string(),
            system_dirs: SYSTEM_DIRS.iter().map(|s| s.to_string()).collect(),
            bin_prefix: BIN_PREFIX.to_string(),
            unit_search_paths: UNIT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            aliases: BTreeMap::new(),
            options_db: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        Self::from_json(&content).context(ConfigParseSnafu { path })
    }

    /// Parses settings from a JSON string.
    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Serializes settings as pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Absolute path of an external tool.
    pub fn bin(&self, name: &str) -> String {
        format!("{}{}", self.bin_prefix, name)
    }

    /// Resolves the configured escalation command against the allow-list.
    ///
    /// Returns an empty vector when escalation is disabled or the configured
    /// name is not approved.
    pub fn escalation_argv(&self) -> Vec<String> {
        if self.escalation.is_empty() {
            return Vec::new();
        }
        approved_escalation(&self.escalation)
            .map(|argv| {
                let mut out = vec![self.bin(argv[0])];
                out.extend(argv[1..].iter().map(|s| s.to_string()));
                out
            })
            .unwrap_or_default()
    }

    /// Selects the MTP helper: the configured one, or the first installed when `auto`.
    pub fn select_mtp_tool(&self) -> Option<String> {
        let auto = self.mtp_tool.is_empty() || self.mtp_tool == "auto";
        MTP_TOOLS
            .iter()
            .find(|tool| {
                if auto {
                    Path::new(&self.bin(tool)).exists()
                } else {
                    **tool == self.mtp_tool
                }
            })
            .map(|tool| tool.to_string())
    }

    /// Finds a saved preset with exactly these keys.
    pub fn find_preset(&self, fs_type: &str, label: &str, uuid: &str) -> Option<&OptionPreset> {
        self.options_db
            .iter()
            .find(|p| p.fs_type == fs_type && p.label == label && p.uuid == uuid)
    }

    /// Finds the most specific saved preset for a device.
    ///
    /// Searches by filesystem, label and UUID together, then by UUID, then by
    /// label, then by filesystem type alone.
    pub fn find_suitable(&self, fs_type: &str, label: &str, uuid: &str) -> Option<&OptionPreset> {
        self.find_preset(fs_type, label, uuid)
            .or_else(|| self.find_preset(fs_type, "", uuid))
            .or_else(|| self.find_preset(fs_type, label, ""))
            .or_else(|| self.find_preset(fs_type, "", ""))
    }
}

/// Returns the approved argv prefix for an escalation command basename.
pub fn approved_escalation(name: &str) -> Option<&'static [&'static str]> {
    let base = name.rsplit('/').next().unwrap_or(name);
    APPROVED_ESCALATION.iter().copied().find(|argv| argv[0] == base)
}

/// Returns the name of the program an argv actually runs, skipping an
/// approved escalation prefix.
pub fn exename(argv: &[String]) -> &str {
    let Some(first) = argv.first() else {
        return "";
    };
    let skip = approved_escalation(first).map_or(0, |prefix| prefix.len());
    argv.get(skip)
        .or(argv.first())
        .map(|s| s.rsplit('/').next().unwrap_or(s))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_allow_list() {
        let settings = Settings {
            escalation: "sudo".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.escalation_argv(), vec!["/usr/bin/sudo", "-n"]);

        let settings = Settings {
            escalation: "/opt/evil/pkexec".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.escalation_argv(), vec!["/usr/bin/pkexec"]);

        let settings = Settings {
            escalation: "doas".to_string(),
            ..Settings::default()
        };
        assert!(settings.escalation_argv().is_empty());
    }

    #[test]
    fn test_exename_skips_escalation() {
        let argv: Vec<String> = ["/usr/bin/sudo", "-n", "/usr/bin/mount", "-v"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(exename(&argv), "mount");

        let argv = vec!["/usr/bin/umount".to_string()];
        assert_eq!(exename(&argv), "umount");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json(r#"{ "use_systemctl": true }"#).unwrap();
        assert!(settings.use_systemctl);
        assert_eq!(settings.default_options, "nodev,nosuid");
        assert_eq!(settings.unit_search_paths.len(), UNIT_SEARCH_PATHS.len());
    }

    #[test]
    fn test_find_suitable_order() {
        let preset = |fs: &str, label: &str, uuid: &str, opts: &str| OptionPreset {
            fs_type: fs.to_string(),
            label: label.to_string(),
            uuid: uuid.to_string(),
            options: opts.to_string(),
            mountpoint: String::new(),
        };
        let settings = Settings {
            options_db: vec![
                preset("vfat", "", "", "generic"),
                preset("vfat", "STICK", "", "by-label"),
                preset("vfat", "", "AB-CD", "by-uuid"),
            ],
            ..Settings::default()
        };

        let found = settings.find_suitable("vfat", "STICK", "AB-CD").unwrap();
        assert_eq!(found.options, "by-uuid");
        let found = settings.find_suitable("vfat", "STICK", "other").unwrap();
        assert_eq!(found.options, "by-label");
        let found = settings.find_suitable("vfat", "", "").unwrap();
        assert_eq!(found.options, "generic");
        assert!(settings.find_suitable("ext4", "", "").is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(&dir.path().join("none.json")).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigRead { .. }));
    }
}
