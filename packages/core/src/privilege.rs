//! Temporary privilege dropping.
//!
//! A [`PrivilegeGuard`] lowers the effective identity of the process to the
//! invoking user and restores it when the guard goes out of scope, on every
//! exit path. The real and effective ids are both lowered, so commands run
//! meanwhile cannot regain root; the saved ids stay root, which is what
//! allows the restoration.
//!
//! The process has a single effective identity, so only one guard with a
//! dropped state may exist at a time.

use std::ffi::CString;

use nix::unistd::{self, Gid, Uid};

use crate::error::{PrivilegeTransitionSnafu, Result};
use crate::identity::Identity;
use crate::log::LogSink;
use snafu::ResultExt;

/// Access to the process credentials.
///
/// Implemented over `nix` for the real process; tests substitute an
/// in-memory implementation.
pub trait Credentials {
    fn real_uid(&self) -> u32;
    fn effective_uid(&self) -> u32;
    fn effective_gid(&self) -> u32;
    /// Current supplementary group list.
    fn groups(&self) -> nix::Result<Vec<u32>>;
    /// Sets the supplementary groups to those of `user` plus `gid`.
    fn init_groups(&self, user: &str, gid: u32) -> nix::Result<()>;
    fn set_groups(&self, groups: &[u32]) -> nix::Result<()>;
    /// Sets the real and effective gid, keeping the saved gid.
    fn set_gid(&self, gid: u32) -> nix::Result<()>;
    /// Sets the real and effective uid, keeping the saved uid.
    fn set_uid(&self, uid: u32) -> nix::Result<()>;
}

/// Credentials of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCredentials;

impl Credentials for ProcessCredentials {
    fn real_uid(&self) -> u32 {
        unistd::getuid().as_raw()
    }

    fn effective_uid(&self) -> u32 {
        unistd::geteuid().as_raw()
    }

    fn effective_gid(&self) -> u32 {
        unistd::getegid().as_raw()
    }

    fn groups(&self) -> nix::Result<Vec<u32>> {
        Ok(unistd::getgroups()?.into_iter().map(Gid::as_raw).collect())
    }

    fn init_groups(&self, user: &str, gid: u32) -> nix::Result<()> {
        let user = CString::new(user).map_err(|_| nix::Error::EINVAL)?;
        unistd::initgroups(&user, Gid::from_raw(gid))
    }

    fn set_groups(&self, groups: &[u32]) -> nix::Result<()> {
        let groups: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        unistd::setgroups(&groups)
    }

    fn set_gid(&self, gid: u32) -> nix::Result<()> {
        let gid = Gid::from_raw(gid);
        let saved = unistd::getresgid()?.saved;
        unistd::setresgid(gid, gid, saved)
    }

    fn set_uid(&self, uid: u32) -> nix::Result<()> {
        let uid = Uid::from_raw(uid);
        let saved = unistd::getresuid()?.saved;
        unistd::setresuid(uid, uid, saved)
    }
}

/// Identity captured when privileges were dropped. A field is `Some` only
/// while the corresponding change is in effect.
#[derive(Debug, Default)]
struct SavedPrivileges {
    uid: Option<u32>,
    gid: Option<u32>,
    groups: Option<Vec<u32>>,
}

impl SavedPrivileges {
    fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.groups.is_none()
    }
}

/// Scoped privilege drop; restores the saved identity on drop.
pub struct PrivilegeGuard<'a> {
    credentials: &'a dyn Credentials,
    log: &'a dyn LogSink,
    saved: SavedPrivileges,
}

impl<'a> PrivilegeGuard<'a> {
    pub fn new(credentials: &'a dyn Credentials, log: &'a dyn LogSink) -> Self {
        Self {
            credentials,
            log,
            saved: SavedPrivileges::default(),
        }
    }

    /// Returns true while the effective identity is lowered.
    pub fn is_dropped(&self) -> bool {
        self.saved.uid.is_some()
    }

    /// Lowers the effective identity to `identity`.
    ///
    /// Groups are switched before the gid and the gid before the uid. A step
    /// that fails aborts the transition; whatever already changed is undone
    /// by [`restore`](Self::restore) or when the guard is dropped.
    pub fn drop_to(&mut self, identity: &Identity) -> Result<()> {
        if self.is_dropped() {
            return Ok(());
        }
        if !self.saved.is_empty() {
            self.restore()?;
        }

        let uid0 = self.credentials.effective_uid();
        let gid0 = self.credentials.effective_gid();

        let groups0 = self
            .credentials
            .groups()
            .context(PrivilegeTransitionSnafu {
                step: "read user groups",
            })
            .inspect_err(|e| self.log.error(&e.report()))?;

        self.credentials
            .init_groups(&identity.user, identity.user_gid)
            .context(PrivilegeTransitionSnafu {
                step: "initialize user groups",
            })
            .inspect_err(|e| self.log.error(&e.report()))?;
        self.saved.groups = Some(groups0);

        self.credentials
            .set_gid(identity.gid)
            .context(PrivilegeTransitionSnafu {
                step: "set group ids",
            })
            .inspect_err(|e| self.log.error(&e.report()))?;
        self.saved.gid = Some(gid0);

        self.credentials
            .set_uid(identity.uid)
            .context(PrivilegeTransitionSnafu {
                step: "set user ids",
            })
            .inspect_err(|e| self.log.error(&e.report()))?;
        self.saved.uid = Some(uid0);

        tracing::debug!(uid = identity.uid, gid = identity.gid, "dropped privileges");
        Ok(())
    }

    /// Drops privileges only when it makes sense: the process runs as root
    /// and the target user is not root. Otherwise succeeds without change.
    pub fn drop_if_feasible(&mut self, identity: &Identity) -> Result<()> {
        if self.credentials.real_uid() != 0 || identity.uid == 0 {
            return Ok(());
        }
        self.drop_to(identity)
    }

    /// Restores the saved identity: uid first, then gid, then groups.
    ///
    /// Every saved field is attempted even if an earlier one fails; the
    /// first failure is returned.
    pub fn restore(&mut self) -> Result<()> {
        let mut first_err = None;

        if let Some(uid) = self.saved.uid {
            match self.credentials.set_uid(uid) {
                Ok(()) => self.saved.uid = None,
                Err(source) => first_err = first_err.or(Some(("set user ids", source))),
            }
        }
        if let Some(gid) = self.saved.gid {
            match self.credentials.set_gid(gid) {
                Ok(()) => self.saved.gid = None,
                Err(source) => first_err = first_err.or(Some(("set group ids", source))),
            }
        }
        if let Some(groups) = &self.saved.groups {
            match self.credentials.set_groups(groups) {
                Ok(()) => self.saved.groups = None,
                Err(source) => first_err = first_err.or(Some(("set user groups", source))),
            }
        }

        match first_err {
            None => Ok(()),
            Some((step, source)) => {
                let err = crate::Error::PrivilegeTransition { step, source };
                self.log.error(&err.report());
                Err(err)
            }
        }
    }
}

impl Drop for PrivilegeGuard<'_> {
    fn drop(&mut self) {
        if !self.saved.is_empty() {
            let _ = self.restore();
        }
    }
}
