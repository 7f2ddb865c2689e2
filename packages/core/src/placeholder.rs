//! `%x` placeholder expansion for mount targets and options.
//!
//! | token | value |
//! |---|---|
//! | `%d` | sanitized last component of the device path |
//! | `%D` | sanitized full device path |
//! | `%u` | invoking user name |
//! | `%g` | invoking group name |
//! | `%t` | filesystem type |
//! | `%l` | sanitized label |
//! | `%L` | raw label |
//! | `%U` | raw UUID |
//!
//! Label and UUID tokens fall back to `%d` when the value is empty.

use crate::device::DeviceRecord;
use crate::identity::Identity;

fn is_separator(c: char) -> bool {
    matches!(c, '_' | '-' | '.')
}

/// Turns arbitrary text into a safe file name.
///
/// Alphanumerics are kept. Runs of anything else become a single separator:
/// `.`, `-` and `_` are kept as themselves, every other character as `_`.
/// Separators are never leading or trailing.
///
/// ```
/// use usermount_core::placeholder::sanitize_name;
///
/// assert_eq!(sanitize_name(r"\\192.168.1.1\__SHARE-a_b__"), "192.168.1.1_SHARE-a_b");
/// ```
pub fn sanitize_name(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if out.chars().next_back().is_some_and(|last| !is_separator(last)) {
            out.push(if is_separator(c) { c } else { '_' });
        }
    }
    if out.chars().next_back().is_some_and(is_separator) {
        out.pop();
    }
    out
}

/// Last path component, also for `server:/export` and UNC paths.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Values substituted for each token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    name: String,
    path: String,
    user: String,
    group: String,
    fs_type: String,
    label: String,
    sanitized_label: String,
    uuid: String,
}

impl Placeholders {
    pub fn new(
        path: &str,
        fs_type: &str,
        device: Option<&DeviceRecord>,
        identity: &Identity,
    ) -> Self {
        let sanitized_path = sanitize_name(path);
        let mut name = sanitize_name(file_name(path));
        if name.is_empty() {
            name.clone_from(&sanitized_path);
        }

        let or_name = |value: &str| {
            if value.is_empty() {
                name.clone()
            } else {
                value.to_string()
            }
        };
        let label = device.map_or("", |d| d.label.as_str());
        let uuid = device.map_or("", |d| d.uuid.as_str());

        Self {
            sanitized_label: or_name(&sanitize_name(label)),
            label: or_name(label),
            uuid: or_name(uuid),
            path: sanitized_path,
            user: identity.user.clone(),
            group: identity.group.clone(),
            fs_type: fs_type.to_string(),
            name,
        }
    }

    fn value(&self, token: char) -> Option<&str> {
        Some(match token {
            'd' => &self.name,
            'D' => &self.path,
            'u' => &self.user,
            'g' => &self.group,
            't' => &self.fs_type,
            'l' => &self.sanitized_label,
            'L' => &self.label,
            'U' => &self.uuid,
            _ => return None,
        })
    }

    /// Replaces every recognized token in one pass; substituted text is not rescanned.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%'
                && let Some(value) = chars.peek().and_then(|t| self.value(*t))
            {
                out.push_str(value);
                chars.next();
            } else {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::user_identity;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(
            sanitize_name("\\\\192.168.1.1\\__SHARE-a_b__"),
            "192.168.1.1_SHARE-a_b"
        );
        assert_eq!(sanitize_name("My Games!"), "My_Games");
        assert_eq!(sanitize_name("Фото 2024"), "Фото_2024");
        assert_eq!(sanitize_name("..."), "");
        assert_eq!(sanitize_name("a - b"), "a_b");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for text in ["//nas/Music Library/", "-x-", "sdb1", " ..a..b.. ", "_%_"] {
            let once = sanitize_name(text);
            assert_eq!(sanitize_name(&once), once);
        }
    }

    #[test]
    fn test_expand_block_device() {
        let dev = DeviceRecord {
            path: "/dev/sdb1".to_string(),
            label: "My Stick".to_string(),
            uuid: "AB12-CD34".to_string(),
            ..DeviceRecord::default()
        };
        let values = Placeholders::new("/dev/sdb1", "vfat", Some(&dev), &user_identity());

        assert_eq!(values.expand("/media/%u/%l"), "/media/alice/My_Stick");
        assert_eq!(values.expand("%d|%D|%t|%g"), "sdb1|dev_sdb1|vfat|alice");
        assert_eq!(values.expand("%L:%U"), "My Stick:AB12-CD34");
        assert_eq!(values.expand("uid=%x,100%"), "uid=%x,100%");
    }

    #[test]
    fn test_expand_fallbacks_without_device() {
        let values = Placeholders::new("nas:/", "nfs4", None, &user_identity());
        // last component is empty, so the full path is used
        assert_eq!(values.expand("/mnt/%d"), "/mnt/nas");
        assert_eq!(values.expand("%l %L %U"), "nas nas nas");
    }

    #[test]
    fn test_expand_is_single_pass_and_idempotent() {
        let dev = DeviceRecord {
            label: "%u".to_string(),
            ..DeviceRecord::default()
        };
        let values = Placeholders::new("/dev/sdc", "ext4", Some(&dev), &user_identity());
        let once = values.expand("/mnt/%L");
        assert_eq!(once, "/mnt/%u");

        let plain = values.expand("/mnt/%d");
        assert_eq!(values.expand(&plain), plain);
    }
}
