//! In-memory stand-ins for the OS seams, used by unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::executor::{CommandOutput, CommandRunner};
use crate::identity::Identity;
use crate::net::Resolver;
use crate::privilege::Credentials;
use crate::provision::{DirOps, PathKind};
use crate::settings::exename;

pub fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A regular user, uid/gid 1000.
pub fn user_identity() -> Identity {
    Identity {
        uid: 1000,
        gid: 1000,
        user_gid: 1000,
        user: "alice".to_string(),
        group: "alice".to_string(),
        user_group: "alice".to_string(),
        home: PathBuf::from("/home/alice"),
    }
}

pub struct FakeCredentials {
    ruid: Cell<u32>,
    suid: u32,
    euid: Cell<u32>,
    egid: Cell<u32>,
    groups: RefCell<Vec<u32>>,
    calls: RefCell<Vec<&'static str>>,
    fail_once: Cell<Option<&'static str>>,
}

impl FakeCredentials {
    pub fn root() -> Self {
        Self::with_ids(0, 0, vec![0, 10])
    }

    pub fn unprivileged(uid: u32) -> Self {
        Self::with_ids(uid, uid, vec![uid])
    }

    fn with_ids(uid: u32, gid: u32, groups: Vec<u32>) -> Self {
        Self {
            ruid: Cell::new(uid),
            suid: uid,
            euid: Cell::new(uid),
            egid: Cell::new(gid),
            groups: RefCell::new(groups),
            calls: RefCell::new(Vec::new()),
            fail_once: Cell::new(None),
        }
    }

    /// Makes the next `step` ("groups", "gid" or "uid") fail with EPERM.
    pub fn fail_on(&self, step: &'static str) {
        self.fail_once.set(Some(step));
    }

    pub fn set_effective(&self, uid: u32, gid: u32) {
        self.euid.set(uid);
        self.egid.set(gid);
    }

    pub fn saved_uid(&self) -> u32 {
        self.suid
    }

    /// Setter calls in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn record(&self, step: &'static str) -> nix::Result<()> {
        self.calls.borrow_mut().push(step);
        if self.fail_once.get() == Some(step) {
            self.fail_once.set(None);
            return Err(nix::Error::EPERM);
        }
        Ok(())
    }
}

impl Credentials for FakeCredentials {
    fn real_uid(&self) -> u32 {
        self.ruid.get()
    }

    fn effective_uid(&self) -> u32 {
        self.euid.get()
    }

    fn effective_gid(&self) -> u32 {
        self.egid.get()
    }

    fn groups(&self) -> nix::Result<Vec<u32>> {
        Ok(self.groups.borrow().clone())
    }

    fn init_groups(&self, _user: &str, gid: u32) -> nix::Result<()> {
        self.record("groups")?;
        *self.groups.borrow_mut() = vec![gid];
        Ok(())
    }

    fn set_groups(&self, groups: &[u32]) -> nix::Result<()> {
        self.record("groups")?;
        *self.groups.borrow_mut() = groups.to_vec();
        Ok(())
    }

    fn set_gid(&self, gid: u32) -> nix::Result<()> {
        self.record("gid")?;
        self.egid.set(gid);
        Ok(())
    }

    fn set_uid(&self, uid: u32) -> nix::Result<()> {
        self.record("uid")?;
        self.ruid.set(uid);
        self.euid.set(uid);
        Ok(())
    }
}

/// Records command lines and answers with canned output per program name.
#[derive(Default)]
pub struct FakeRunner {
    responses: RefCell<HashMap<String, CommandOutput>>,
    spawn_failures: RefCell<HashSet<String>>,
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, program: &str, status: i32, stdout: &str, stderr: &str) {
        self.responses.borrow_mut().insert(
            program.to_string(),
            CommandOutput {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn fail_spawn(&self, program: &str) {
        self.spawn_failures.borrow_mut().insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// Calls whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|argv| exename(argv) == program)
            .cloned()
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.borrow_mut().push(argv.to_vec());
        let program = exename(argv);
        if self.spawn_failures.borrow().contains(program) {
            return Err(std::io::Error::from(ErrorKind::NotFound));
        }
        Ok(self
            .responses
            .borrow()
            .get(program)
            .cloned()
            .unwrap_or(CommandOutput {
                status: Some(0),
                ..CommandOutput::default()
            }))
    }
}

/// A directory tree in memory. `/`, `/home`, `/home/alice`, `/mnt`, `/media`,
/// `/etc` and `/usr` exist initially.
pub struct FakeDirs {
    entries: RefCell<BTreeMap<PathBuf, PathKind>>,
    denied: RefCell<Vec<PathBuf>>,
    chowned: RefCell<Vec<(PathBuf, u32, u32)>>,
}

impl FakeDirs {
    pub fn new() -> Self {
        Self::with_dirs(&[])
    }

    pub fn with_dirs(extra: &[&str]) -> Self {
        let base = ["/", "/home", "/home/alice", "/mnt", "/media", "/etc", "/usr"];
        let entries = base
            .iter()
            .chain(extra)
            .map(|p| (PathBuf::from(p), PathKind::Directory))
            .collect();
        Self {
            entries: RefCell::new(entries),
            denied: RefCell::new(Vec::new()),
            chowned: RefCell::new(Vec::new()),
        }
    }

    pub fn add_file(&self, path: &str) {
        self.entries
            .borrow_mut()
            .insert(PathBuf::from(path), PathKind::Other);
    }

    /// Creation strictly below `prefix` fails with `PermissionDenied`.
    pub fn deny_under(&self, prefix: &str) {
        self.denied.borrow_mut().push(PathBuf::from(prefix));
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.entries.borrow().get(Path::new(path)) == Some(&PathKind::Directory)
    }

    pub fn chowned(&self) -> Vec<(PathBuf, u32, u32)> {
        self.chowned.borrow().clone()
    }
}

impl DirOps for FakeDirs {
    fn kind(&self, path: &Path) -> std::io::Result<PathKind> {
        self.entries
            .borrow()
            .get(path)
            .copied()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotFound))
    }

    fn create_dir(&self, path: &Path, _mode: u32) -> std::io::Result<()> {
        let denied = self
            .denied
            .borrow()
            .iter()
            .any(|prefix| path.starts_with(prefix) && path != prefix);
        if denied {
            return Err(std::io::Error::from(ErrorKind::PermissionDenied));
        }
        self.entries
            .borrow_mut()
            .insert(path.to_path_buf(), PathKind::Directory);
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        self.chowned
            .borrow_mut()
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }
}

/// Resolves from a fixed address to name table.
#[derive(Default)]
pub struct TableResolver {
    names: Vec<(IpAddr, String)>,
}

impl TableResolver {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            names: entries
                .iter()
                .map(|(ip, name)| (ip.parse().unwrap(), name.to_string()))
                .collect(),
        }
    }
}

impl Resolver for TableResolver {
    fn reverse(&self, ip: IpAddr) -> Option<String> {
        self.names
            .iter()
            .find(|(addr, _)| *addr == ip)
            .map(|(_, name)| name.clone())
    }

    fn forward(&self, host: &str) -> Option<IpAddr> {
        self.names
            .iter()
            .find(|(_, name)| name == host)
            .map(|(addr, _)| *addr)
    }
}
