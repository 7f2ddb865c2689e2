//! User-facing log lines.
//!
//! Components never print; they report through a [`LogSink`] handed to them
//! by the owner of the session. The default sink forwards to `tracing`.

use std::cell::RefCell;

use serde::Serialize;

/// Severity of a log line, rendered by the UI as a color tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Normal progress output.
    Info,
    /// Operation finished successfully.
    Success,
    /// Output of an external tool's stderr.
    Warning,
    /// Failure.
    Error,
}

impl Severity {
    /// Color tag understood by the log window.
    pub fn color(self) -> &'static str {
        match self {
            Severity::Info => "",
            Severity::Success => "green",
            Severity::Warning => "orange",
            Severity::Error => "red",
        }
    }
}

/// Destination for human-readable log lines.
pub trait LogSink {
    fn log(&self, severity: Severity, line: &str);

    fn info(&self, line: &str) {
        self.log(Severity::Info, line);
    }

    fn success(&self, line: &str) {
        self.log(Severity::Success, line);
    }

    fn warning(&self, line: &str) {
        self.log(Severity::Warning, line);
    }

    fn error(&self, line: &str) {
        self.log(Severity::Error, line);
    }
}

/// Sink that forwards every line to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, severity: Severity, line: &str) {
        let color = severity.color();
        match severity {
            Severity::Info | Severity::Success => tracing::info!(color, "{line}"),
            Severity::Warning => tracing::warn!(color, "{line}"),
            Severity::Error => tracing::error!(color, "{line}"),
        }
    }
}

/// A single recorded log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub severity: Severity,
    pub text: String,
}

/// Sink that keeps lines in memory, e.g. as the buffer of a log window.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: RefCell<Vec<LogLine>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything logged so far.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.borrow().clone()
    }

    /// Returns true if any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|l| l.text.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, severity: Severity, line: &str) {
        self.lines.borrow_mut().push(LogLine {
            severity,
            text: line.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.info("first");
        sink.error("second");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].severity, Severity::Info);
        assert_eq!(lines[1].text, "second");
        assert_eq!(lines[1].severity.color(), "red");
        assert!(sink.contains("sec"));
    }
}
