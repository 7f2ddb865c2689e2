//! Mount point trust classification.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::log::LogSink;

/// How much scrutiny mounting on a directory requires, from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TrustLevel {
    /// Ordinary location; no extra checks.
    Trusted,
    /// Under a protected system prefix.
    SystemProtected,
    /// Must be authorized by the user again. Decided by request-level logic.
    NeedsAuthentication,
    /// Never mount here.
    Rejected,
}

/// Yields every prefix of an absolute path: `/a`, `/a/b`, `/a/b/c`.
pub fn path_prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .skip(1)
        .filter(|(_, c)| *c == '/')
        .map(|(i, _)| &path[..i])
        .chain(std::iter::once(path.trim_end_matches('/')))
        .filter(|p| !p.is_empty() && !p.ends_with('/'))
}

/// Canonicalizes the existing leading part of `path`.
///
/// Stops at the first missing component. Returns `Err` with a message for
/// any other filesystem error.
fn canonical_existing_prefix(path: &str) -> Result<Option<PathBuf>, String> {
    let mut resolved = None;
    for prefix in path_prefixes(path) {
        match Path::new(prefix).canonicalize() {
            Ok(real) => resolved = Some(real),
            Err(e) if e.kind() == ErrorKind::NotFound => break,
            Err(e) => return Err(format!("Can not check directory '{prefix}': {e}")),
        }
    }
    Ok(resolved)
}

/// Returns true if `path` equals `prefix` or lies below it.
fn under_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Classifies a mount target.
///
/// Non-absolute targets and targets whose existing part cannot be inspected
/// are rejected. The canonical existing prefix is compared against the
/// protected prefixes; `/` alone never matches anything but itself.
pub fn classify<S: AsRef<str>>(target: &str, system_dirs: &[S], log: &dyn LogSink) -> TrustLevel {
    if !target.starts_with('/') {
        log.error("Mount point should be absolute path!");
        return TrustLevel::Rejected;
    }

    let resolved = match canonical_existing_prefix(target) {
        Ok(resolved) => resolved,
        Err(message) => {
            log.error(&message);
            return TrustLevel::Rejected;
        }
    };
    let resolved = resolved.unwrap_or_else(|| PathBuf::from("/"));
    let resolved = resolved.to_string_lossy();

    let protected = system_dirs
        .iter()
        .any(|prefix| under_prefix(&resolved, prefix.as_ref()));
    if protected {
        TrustLevel::SystemProtected
    } else {
        TrustLevel::Trusted
    }
}
