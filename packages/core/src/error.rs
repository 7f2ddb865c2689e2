//! Unified error types for the usermount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Mount point is not an absolute path.
    #[snafu(display("mount point should be an absolute path: '{path}'"))]
    RelativeMountPoint { path: String },

    /// Trust classification rejected the mount point.
    #[snafu(display("mount point '{path}' was rejected: {reason}"))]
    RejectedMountPoint { path: String, reason: String },

    /// A required request field is empty.
    #[snafu(display("missing required field: {field}"))]
    MissingField { field: &'static str },

    /// Requested MTP helper is not one we know how to drive.
    #[snafu(display("unsupported MTP filesystem '{tool}'"))]
    UnsupportedMtpTool { tool: String },

    /// User account does not exist or could not be read.
    #[snafu(display("failed to look up user account for uid {uid}: {message}"))]
    AccountLookup { uid: u32, message: String },

    /// Group does not exist or could not be read.
    #[snafu(display("failed to look up group {gid}: {message}"))]
    GroupLookup { gid: u32, message: String },

    /// A step of dropping or restoring privileges failed.
    #[snafu(display("failed to {step}"))]
    PrivilegeTransition {
        step: &'static str,
        source: nix::Error,
    },

    /// A mount point component exists but is not a directory.
    #[snafu(display("'{}' is not a directory", path.display()))]
    NotADirectory { path: PathBuf },

    /// A mount point component could not be inspected.
    #[snafu(display("could not access '{}'", path.display()))]
    MountPointAccess {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point creation failed.
    #[snafu(display("could not create directory '{}'", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point ownership could not be assigned.
    #[snafu(display("could not change ownership of '{}'", path.display()))]
    MountPointOwnership {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The escalated `install -d` fallback failed.
    #[snafu(display("escalated creation of '{}' failed", path.display()))]
    MountPointEscalation {
        path: PathBuf,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Failed to execute a system command.
    #[snafu(display("execution of '{command}' failed"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("'{command}' exited with status {code}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Failed to parse findmnt JSON output.
    #[snafu(display("failed to parse findmnt output: {message}"))]
    FindmntParse { message: String },

    /// A systemd mount unit could not be read.
    #[snafu(display("failed to read unit '{}'", path.display()))]
    UnitParse {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A network discovery channel failed.
    #[snafu(display("{channel}: {message}"))]
    Discovery {
        channel: &'static str,
        message: String,
    },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read config file at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid.
    #[snafu(display("failed to parse config file at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Returns the user-facing message including the chain of causes.
    pub fn report(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_includes_source() {
        let err: Result<()> = Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .mount_point_context("/mnt/data");
        let report = err.unwrap_err().report();
        assert!(report.starts_with("could not create directory '/mnt/data': "));
        assert!(report.len() > "could not create directory '/mnt/data': ".len());
    }

    #[test]
    fn test_errors_cross_threads() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<Error>();

        let source: Box<dyn std::error::Error + Send + Sync> = "scope failed".into();
        let err = Error::Generic {
            message: "network scan".to_string(),
            source: Some(source),
        };
        let report = std::thread::scope(|s| s.spawn(move || err.report()).join().unwrap());
        assert!(report.contains("scope failed"));
    }
}
