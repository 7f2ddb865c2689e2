//! MTP media player detection and helper command lines.
//!
//! Devices are found by walking the USB tree in sysfs. A device counts as an
//! MTP player when one of its interfaces is a still image class interface
//! (6/1/1) or names itself `MTP`.

use std::fs;
use std::path::Path;

use crate::device::{DeviceRecord, MtpIds};
use crate::error::{Error, Result};
use crate::settings::Settings;

/// Where the kernel lists USB devices and interfaces.
pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

fn read_attr(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn is_mtp_interface(dir: &Path) -> bool {
    let class = (
        read_attr(dir, "bInterfaceClass"),
        read_attr(dir, "bInterfaceSubClass"),
        read_attr(dir, "bInterfaceProtocol"),
    );
    class == ("06".into(), "01".into(), "01".into()) || read_attr(dir, "interface").contains("MTP")
}

/// Lists attached MTP players below a sysfs USB directory.
///
/// Devices are numbered from 1 in name order. Unreadable entries are
/// skipped.
pub fn scan_mtp_devices(sysfs_root: &Path) -> Result<Vec<DeviceRecord>> {
    let mut names: Vec<String> = fs::read_dir(sysfs_root)
        .map_err(|e| Error::Discovery {
            channel: "mtp",
            message: format!("{}: {e}", sysfs_root.display()),
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.contains(':'))
        .collect();
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        let dir = sysfs_root.join(&name);
        let Ok(bus) = read_attr(&dir, "busnum").parse::<u32>() else {
            continue;
        };
        let Ok(dev) = read_attr(&dir, "devnum").parse::<u32>() else {
            continue;
        };

        let interface_prefix = format!("{name}:");
        let has_mtp = fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&interface_prefix)
            })
            .any(|entry| is_mtp_interface(&entry.path()));
        if !has_mtp {
            continue;
        }

        let index = devices.len() + 1;
        let product = read_attr(&dir, "product");
        devices.push(DeviceRecord {
            path: format!("/dev/bus/usb/{bus:03}/{dev:03}"),
            name: if product.is_empty() {
                format!("MTP#{index}")
            } else {
                product
            },
            model: read_attr(&dir, "manufacturer"),
            serial: read_attr(&dir, "serial"),
            mtp: Some(MtpIds {
                index: Some(index),
                jmtpfs: format!("{bus},{dev}"),
                aft: format!(
                    "{}:{}",
                    read_attr(&dir, "idVendor"),
                    read_attr(&dir, "idProduct")
                ),
            }),
            ..DeviceRecord::default()
        });
    }
    Ok(devices)
}

/// Escapes a value for a FUSE `-o` option: everything but ASCII
/// alphanumerics and `-_.` becomes `\\xHH`.
pub fn escape_fopt(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\\\x{byte:02x}"));
        }
    }
    out
}

/// Builds the mount command for an MTP helper.
///
/// The helper is named by the filesystem type, with or without a `fuse.`
/// prefix.
pub fn mtp_command(
    settings: &Settings,
    device: &DeviceRecord,
    fs_type: &str,
    target: &str,
    options: &str,
) -> Result<Vec<String>> {
    let tool = fs_type.strip_prefix("fuse.").unwrap_or(fs_type);
    let ids = device.mtp.clone().unwrap_or_default();

    let mut argv = vec![settings.bin(tool)];
    match tool {
        "aft-mtp-mount" => argv.extend(["-D".to_string(), ids.aft]),
        "simple-mtpfs" => argv.push(device.path.clone()),
        "jmtpfs" => argv.push(format!("-device={}", ids.jmtpfs)),
        _ => {
            return Err(Error::UnsupportedMtpTool {
                tool: tool.to_string(),
            });
        }
    }

    let mut fuse_options = options.to_string();
    if !fuse_options.is_empty() {
        fuse_options.push(',');
    }
    fuse_options.push_str(&format!(
        "fsname={}:{},subtype={tool}",
        device.path,
        escape_fopt(&device.name)
    ));
    argv.extend([target.to_string(), "-o".to_string(), fuse_options]);
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_attrs(dir: &Path, attrs: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        for (name, value) in attrs {
            fs::write(dir.join(name), format!("{value}\n")).unwrap();
        }
    }

    fn phone() -> DeviceRecord {
        DeviceRecord {
            path: "/dev/bus/usb/001/005".to_string(),
            name: "Pixel 8".to_string(),
            mtp: Some(MtpIds {
                index: Some(1),
                jmtpfs: "1,5".to_string(),
                aft: "18d1:4ee1".to_string(),
            }),
            ..DeviceRecord::default()
        }
    }

    #[test]
    fn test_scan_sysfs_tree() {
        let root = tempfile::tempdir().unwrap();
        let phone = root.path().join("1-2");
        write_attrs(
            &phone,
            &[
                ("busnum", "1"),
                ("devnum", "5"),
                ("idVendor", "18d1"),
                ("idProduct", "4ee1"),
                ("product", "Pixel 8"),
                ("manufacturer", "Google"),
                ("serial", "ABC123"),
            ],
        );
        write_attrs(
            &phone.join("1-2:1.0"),
            &[
                ("bInterfaceClass", "06"),
                ("bInterfaceSubClass", "01"),
                ("bInterfaceProtocol", "01"),
            ],
        );

        let player = root.path().join("2-1");
        write_attrs(&player, &[("busnum", "2"), ("devnum", "3")]);
        write_attrs(&player.join("2-1:1.0"), &[("bInterfaceClass", "ff"), ("interface", "MTP")]);

        let keyboard = root.path().join("3-1");
        write_attrs(&keyboard, &[("busnum", "3"), ("devnum", "2")]);
        write_attrs(&keyboard.join("3-1:1.0"), &[("bInterfaceClass", "03")]);

        let devices = scan_mtp_devices(root.path()).unwrap();
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].path, "/dev/bus/usb/001/005");
        assert_eq!(devices[0].name, "Pixel 8");
        assert_eq!(devices[0].model, "Google");
        assert_eq!(devices[0].serial, "ABC123");
        let ids = devices[0].mtp.as_ref().unwrap();
        assert_eq!(ids.jmtpfs, "1,5");
        assert_eq!(ids.aft, "18d1:4ee1");
        assert_eq!(ids.index, Some(1));

        assert_eq!(devices[1].name, "MTP#2");
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let missing = PathBuf::from("/nonexistent/sys/bus/usb");
        assert!(scan_mtp_devices(&missing).is_err());
    }

    #[test]
    fn test_escape_fopt() {
        assert_eq!(escape_fopt("Pixel_8-a.b"), "Pixel_8-a.b");
        assert_eq!(escape_fopt("My Phone,x"), "My\\\\x20Phone\\\\x2cx");
    }

    #[test]
    fn test_mtp_commands() {
        let settings = Settings::default();
        let argv = mtp_command(&settings, &phone(), "fuse.jmtpfs", "/mnt/p", "nodev").unwrap();
        assert_eq!(
            argv,
            vec![
                "/usr/bin/jmtpfs",
                "-device=1,5",
                "/mnt/p",
                "-o",
                "nodev,fsname=/dev/bus/usb/001/005:Pixel\\\\x208,subtype=jmtpfs",
            ]
        );

        let argv = mtp_command(&settings, &phone(), "aft-mtp-mount", "/mnt/p", "").unwrap();
        assert_eq!(&argv[..3], &["/usr/bin/aft-mtp-mount", "-D", "18d1:4ee1"]);
        assert!(argv[5].starts_with("fsname="));

        let argv = mtp_command(&settings, &phone(), "simple-mtpfs", "/mnt/p", "").unwrap();
        assert_eq!(argv[1], "/dev/bus/usb/001/005");

        let err = mtp_command(&settings, &phone(), "go-mtpfs", "/mnt/p", "").unwrap_err();
        assert!(matches!(err, Error::UnsupportedMtpTool { .. }));
    }
}
