//! Invoking user identity.
//!
//! When launched through `sudo` or `pkexec`, the process runs as root but the
//! mount points and user-mounts must belong to the human who asked for them.
//! The escalation wrappers leave hints in the environment; this module turns
//! them into an [`Identity`].

use std::path::PathBuf;

use nix::unistd::{Gid, Group, Uid, User};
use serde::Serialize;

use crate::error::{Error, Result};

/// Environment variables naming the invoking uid, in priority order.
const UID_HINTS: &[&str] = &["SUDO_UID", "PKEXEC_UID"];

/// Environment variable naming the invoking gid.
const GID_HINT: &str = "SUDO_GID";

/// The invoking user and group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: u32,
    /// Group used for created mount points.
    pub gid: u32,
    /// Primary group of the user from the account database.
    pub user_gid: u32,
    pub user: String,
    pub group: String,
    pub user_group: String,
    pub home: PathBuf,
}

impl Identity {
    /// Resolves the identity of the current process.
    pub fn current() -> Result<Self> {
        Self::resolve(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            |name| std::env::var(name).ok(),
        )
    }

    /// Resolves the identity from real ids and an environment lookup.
    ///
    /// Fails if the user or either group is not in the account database.
    pub fn resolve(
        real_uid: u32,
        real_gid: u32,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let hint = invoking_ids(real_uid, real_gid, env);

        let account = User::from_uid(Uid::from_raw(hint.uid))
            .map_err(|e| Error::AccountLookup {
                uid: hint.uid,
                message: e.to_string(),
            })?
            .ok_or_else(|| Error::AccountLookup {
                uid: hint.uid,
                message: "no such user".to_string(),
            })?;
        let user_gid = account.gid.as_raw();
        let gid = if hint.from_env && !hint.gid_from_env {
            user_gid
        } else {
            hint.gid
        };

        let group = group_name(gid)?;
        let user_group = if gid == user_gid {
            group.clone()
        } else {
            group_name(user_gid)?
        };

        Ok(Self {
            uid: hint.uid,
            gid,
            user_gid,
            user: account.name,
            group,
            user_group,
            home: account.dir,
        })
    }

    /// Returns true when the invoking user is root.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

fn group_name(gid: u32) -> Result<String> {
    Group::from_gid(Gid::from_raw(gid))
        .map_err(|e| Error::GroupLookup {
            gid,
            message: e.to_string(),
        })?
        .map(|g| g.name)
        .ok_or_else(|| Error::GroupLookup {
            gid,
            message: "no such group".to_string(),
        })
}

/// Ids of the invoking user before account lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InvokingIds {
    uid: u32,
    gid: u32,
    from_env: bool,
    gid_from_env: bool,
}

/// Applies the escalation hints: only honored when running as root, and only
/// for a non-root uid.
fn invoking_ids(real_uid: u32, real_gid: u32, env: impl Fn(&str) -> Option<String>) -> InvokingIds {
    let mut ids = InvokingIds {
        uid: real_uid,
        gid: real_gid,
        from_env: false,
        gid_from_env: false,
    };
    if real_uid != 0 {
        return ids;
    }

    let Some(raw) = UID_HINTS.iter().find_map(|name| env(name)) else {
        return ids;
    };
    match parse_id(&raw) {
        Some(uid) => {
            ids.uid = uid;
            ids.from_env = true;
        }
        None => return ids,
    }

    if let Some(gid) = env(GID_HINT).as_deref().and_then(parse_id) {
        ids.gid = gid;
        ids.gid_from_env = true;
    }
    ids
}

/// Parses a non-zero, non-sentinel id.
fn parse_id(raw: &str) -> Option<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|id| *id != 0 && *id != u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_hints_ignored_for_unprivileged() {
        let ids = invoking_ids(1000, 1000, env_of(&[("SUDO_UID", "1001")]));
        assert_eq!(ids.uid, 1000);
        assert!(!ids.from_env);
    }

    #[test]
    fn test_sudo_hint_priority() {
        let ids = invoking_ids(
            0,
            0,
            env_of(&[("SUDO_UID", "1001"), ("PKEXEC_UID", "1002"), ("SUDO_GID", "100")]),
        );
        assert_eq!(ids.uid, 1001);
        assert_eq!(ids.gid, 100);
        assert!(ids.gid_from_env);
    }

    #[test]
    fn test_pkexec_hint_without_gid() {
        let ids = invoking_ids(0, 0, env_of(&[("PKEXEC_UID", "1002")]));
        assert_eq!(ids.uid, 1002);
        assert!(ids.from_env);
        assert!(!ids.gid_from_env);
    }

    #[test]
    fn test_invalid_hints_rejected() {
        let ids = invoking_ids(0, 0, env_of(&[("SUDO_UID", "0")]));
        assert_eq!(ids.uid, 0);
        assert!(!ids.from_env);

        let ids = invoking_ids(0, 0, env_of(&[("SUDO_UID", "abc")]));
        assert_eq!(ids.uid, 0);

        let ids = invoking_ids(0, 0, env_of(&[("SUDO_UID", "1000"), ("SUDO_GID", "0")]));
        assert_eq!(ids.uid, 1000);
        assert!(!ids.gid_from_env);
    }

    #[test]
    fn test_resolve_root_account() {
        let identity = Identity::resolve(0, 0, |_| None).unwrap();
        assert!(identity.is_root());
        assert_eq!(identity.user, "root");
    }

    #[test]
    fn test_resolve_unknown_account_fails() {
        let err = Identity::resolve(u32::MAX - 7, 0, |_| None).unwrap_err();
        assert!(matches!(err, Error::AccountLookup { .. }));
    }
}
