//! Command execution abstraction with privilege escalation support.
//!
//! Every external program goes through a [`CommandRunner`]. The
//! [`ExecutionContext`] bundles the runner with the other OS capabilities
//! (credentials, directory operations, log sink) and the validated
//! escalation prefix, and is handed to every component that has side effects.

use std::process::Command;

use crate::error::{Error, IoResultExt, Result};
use crate::log::LogSink;
use crate::privilege::{Credentials, ProcessCredentials};
use crate::provision::{DirOps, RealDirs};
use crate::settings::exename;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external programs.
pub trait CommandRunner {
    /// Runs `argv` to completion. `argv[0]` is the program.
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs programs with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        };
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

static SYSTEM_RUNNER: SystemRunner = SystemRunner;
static PROCESS_CREDENTIALS: ProcessCredentials = ProcessCredentials;
static REAL_DIRS: RealDirs = RealDirs;

/// Execution context for side effects.
///
/// # Example
///
/// ```no_run
/// use usermount_core::executor::ExecutionContext;
/// use usermount_core::log::TracingSink;
///
/// let log = TracingSink;
/// let ctx = ExecutionContext::system(&log)
///     .with_escalation(vec!["/usr/bin/pkexec".to_string()]);
/// let listing = ctx.run_checked(&["/usr/bin/lsblk".to_string()]);
/// ```
#[derive(Clone)]
pub struct ExecutionContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub credentials: &'a dyn Credentials,
    pub dirs: &'a dyn DirOps,
    pub log: &'a dyn LogSink,
    escalation: Vec<String>,
    unprivileged: bool,
}

impl<'a> ExecutionContext<'a> {
    /// Creates a context with no privilege escalation.
    pub fn new(
        runner: &'a dyn CommandRunner,
        credentials: &'a dyn Credentials,
        dirs: &'a dyn DirOps,
        log: &'a dyn LogSink,
    ) -> Self {
        Self {
            runner,
            credentials,
            dirs,
            log,
            escalation: Vec::new(),
            unprivileged: credentials.real_uid() != 0,
        }
    }

    /// Creates a context acting on the real system.
    pub fn system(log: &'a dyn LogSink) -> Self {
        Self::new(&SYSTEM_RUNNER, &PROCESS_CREDENTIALS, &REAL_DIRS, log)
    }

    /// Sets the escalation argv prefix, already validated against the allow-list.
    pub fn with_escalation(mut self, escalation: Vec<String>) -> Self {
        self.escalation = escalation;
        self
    }

    /// Returns the escalation argv prefix; empty when disabled.
    pub fn escalation(&self) -> &[String] {
        &self.escalation
    }

    /// Returns true when the process was not started as root.
    ///
    /// Taken when the context is created, so a root process stays privileged
    /// in this sense while a [`PrivilegeGuard`](crate::privilege::PrivilegeGuard)
    /// has lowered its ids.
    pub fn is_unprivileged(&self) -> bool {
        self.unprivileged
    }

    /// Runs a command and returns its output regardless of exit status.
    pub fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        tracing::debug!(command = %argv.join(" "), "executing");
        self.runner.run(argv).command_context(exename(argv))
    }

    /// Runs a command that must succeed.
    ///
    /// Every stderr line is logged as a warning. A non-zero exit is logged
    /// and returned as [`Error::CommandExit`]; stdout is returned on success.
    pub fn run_checked(&self, argv: &[String]) -> Result<String> {
        let output = self.run(argv).inspect_err(|e| self.log.error(&e.report()))?;

        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            self.log.warning(line);
        }

        if !output.success() {
            let err = Error::CommandExit {
                command: exename(argv).to_string(),
                code: output.status.unwrap_or(-1),
                stderr: output.stderr,
            };
            self.log.error(&err.to_string());
            return Err(err);
        }

        Ok(output.stdout)
    }

    /// Runs a command and logs its stdout lines too, for user-visible actions.
    pub fn run_logged(&self, argv: &[String]) -> Result<()> {
        self.log.info(&format!("Executing: {}", argv.join(" ")));
        let stdout = self.run_checked(argv)?;
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.log.info(line);
        }
        Ok(())
    }
}
