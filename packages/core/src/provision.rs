//! Mount point provisioning.

use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use snafu::{IntoError, ResultExt};

use crate::error::{
    IoResultExt, MountPointAccessSnafu, MountPointEscalationSnafu, MountPointOwnershipSnafu,
    NotADirectorySnafu, Result,
};
use crate::executor::ExecutionContext;
use crate::identity::Identity;
use crate::settings::Settings;
use crate::trust::path_prefixes;

/// What a path points at, following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Directory,
    Other,
}

/// Filesystem operations used for provisioning.
pub trait DirOps {
    /// Stats `path`; a missing path is an `ErrorKind::NotFound` error.
    fn kind(&self, path: &Path) -> std::io::Result<PathKind>;
    fn create_dir(&self, path: &Path, mode: u32) -> std::io::Result<()>;
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()>;
}

/// Acts on the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealDirs;

impl DirOps for RealDirs {
    fn kind(&self, path: &Path) -> std::io::Result<PathKind> {
        let meta = std::fs::metadata(path)?;
        Ok(if meta.is_dir() {
            PathKind::Directory
        } else {
            PathKind::Other
        })
    }

    fn create_dir(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        std::fs::DirBuilder::new().mode(mode).create(path)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
    }
}

/// Ensures every component of `target` exists as a directory.
///
/// Missing components are created with mode 0755 and handed to the invoking
/// user when the effective identity differs. When direct creation fails in
/// an unprivileged process, the component is created through the escalation
/// command with `install -d` from the configured binary directory instead.
pub fn create_mountpoint(
    ctx: &ExecutionContext,
    settings: &Settings,
    identity: &Identity,
    target: &str,
) -> Result<()> {
    for dir in path_prefixes(target) {
        let path = PathBuf::from(dir);
        match ctx.dirs.kind(&path) {
            Ok(PathKind::Directory) => continue,
            Ok(PathKind::Other) => {
                let err = NotADirectorySnafu { path }.build();
                ctx.log.error(&err.report());
                return Err(err);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                let err = MountPointAccessSnafu { path }.into_error(e);
                ctx.log.error(&err.report());
                return Err(err);
            }
        }

        match create_owned_dir(ctx, identity, &path) {
            Ok(()) => ctx.log.info(&format!("Creating directory '{dir}'")),
            Err(err) if ctx.is_unprivileged() && !ctx.escalation().is_empty() => {
                tracing::debug!(error = %err.report(), "direct creation failed, escalating");
                install_escalated(ctx, settings, identity, &path)?;
            }
            Err(err) => {
                ctx.log.error(&err.report());
                return Err(err);
            }
        }
    }
    Ok(())
}

fn create_owned_dir(ctx: &ExecutionContext, identity: &Identity, path: &Path) -> Result<()> {
    ctx.dirs.create_dir(path, 0o755).mount_point_context(path)?;

    let foreign = ctx.credentials.effective_uid() != identity.uid
        || ctx.credentials.effective_gid() != identity.gid;
    if foreign {
        ctx.dirs
            .chown(path, identity.uid, identity.gid)
            .context(MountPointOwnershipSnafu { path })?;
    }
    Ok(())
}

fn install_escalated(
    ctx: &ExecutionContext,
    settings: &Settings,
    identity: &Identity,
    path: &Path,
) -> Result<()> {
    let mut argv = ctx.escalation().to_vec();
    argv.extend([
        settings.bin("install"),
        "-g".to_string(),
        identity.group.clone(),
        "-dvm".to_string(),
        "755".to_string(),
        "-o".to_string(),
        identity.user.clone(),
        path.to_string_lossy().into_owned(),
    ]);
    ctx.run_logged(&argv)
        .context(MountPointEscalationSnafu { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::log::RecordingSink;
    use crate::testing::{FakeCredentials, FakeDirs, FakeRunner, argv, user_identity};

    fn create(ctx: &ExecutionContext, identity: &Identity, target: &str) -> Result<()> {
        create_mountpoint(ctx, &Settings::default(), identity, target)
    }

    #[test]
    fn test_creates_missing_components() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::with_dirs(&["/media"]);
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log);

        create(&ctx, &user_identity(), "/media/alice/stick").unwrap();
        assert!(dirs.is_dir("/media/alice"));
        assert!(dirs.is_dir("/media/alice/stick"));
        assert!(dirs.chowned().is_empty());
        assert!(log.contains("Creating directory '/media/alice/stick'"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_root_hands_directory_to_user() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::root();
        let dirs = FakeDirs::new();
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log);

        create(&ctx, &user_identity(), "/mnt/data").unwrap();
        assert_eq!(
            dirs.chowned(),
            vec![(PathBuf::from("/mnt/data"), 1000, 1000)]
        );
    }

    #[test]
    fn test_existing_file_fails() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::new();
        dirs.add_file("/mnt/data");
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log);

        let err = create(&ctx, &user_identity(), "/mnt/data/inner").unwrap_err();
        assert!(matches!(err, Error::NotADirectory { .. }));
        assert!(log.contains("is not a directory"));
    }

    #[test]
    fn test_denied_creation_escalates() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::new();
        dirs.deny_under("/etc");
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log)
            .with_escalation(argv(&["/usr/bin/pkexec"]));

        create(&ctx, &user_identity(), "/etc/foo").unwrap();
        assert_eq!(
            runner.calls(),
            vec![argv(&[
                "/usr/bin/pkexec",
                "/usr/bin/install",
                "-g",
                "alice",
                "-dvm",
                "755",
                "-o",
                "alice",
                "/etc/foo",
            ])]
        );
    }

    #[test]
    fn test_escalated_install_uses_configured_prefix() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::new();
        dirs.deny_under("/etc");
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log)
            .with_escalation(argv(&["/usr/bin/pkexec"]));
        let settings = Settings {
            bin_prefix: "/opt/bin/".to_string(),
            ..Settings::default()
        };

        create_mountpoint(&ctx, &settings, &user_identity(), "/etc/foo").unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][1], "/opt/bin/install");
    }

    #[test]
    fn test_denied_creation_without_escalation_fails() {
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::new();
        dirs.deny_under("/etc");
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log);

        let err = create(&ctx, &user_identity(), "/etc/foo").unwrap_err();
        assert!(matches!(err, Error::MountPointCreation { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_failed_escalation_is_reported() {
        let runner = FakeRunner::new();
        runner.respond("install", 1, "", "install: cannot create\n");
        let creds = FakeCredentials::unprivileged(1000);
        let dirs = FakeDirs::new();
        dirs.deny_under("/etc");
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &dirs, &log)
            .with_escalation(argv(&["/usr/bin/sudo", "-n"]));

        let err = create(&ctx, &user_identity(), "/etc/foo").unwrap_err();
        assert!(matches!(err, Error::MountPointEscalation { .. }));
    }

    #[test]
    fn test_real_dirs_in_tempdir() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let creds = FakeCredentials::unprivileged(1000);
        let log = RecordingSink::new();
        let ctx = ExecutionContext::new(&runner, &creds, &RealDirs, &log);
        let target = tmp.path().join("a/b");

        let mut identity = user_identity();
        identity.uid = nix::unistd::geteuid().as_raw();
        identity.gid = nix::unistd::getegid().as_raw();
        creds.set_effective(identity.uid, identity.gid);

        create(&ctx, &identity, &target.to_string_lossy()).unwrap();
        assert!(target.is_dir());
        // idempotent
        create(&ctx, &identity, &target.to_string_lossy()).unwrap();
    }
}
