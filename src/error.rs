//! Typed failures raised by pipeline stages.
//!
//! Every stage failure carries an [`ErrorKind`] so the orchestrator and the
//! retry helper can decide between aborting and trying again, plus the raw
//! diagnostic text captured from whatever external tool was involved.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed manifest, invalid build settings, path collisions. Never retried.
    Configuration,
    /// Network trouble while talking to a package index or release host.
    TransientInfrastructure,
    /// An external tool exited non-zero or could not be started.
    ToolInvocation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientInfrastructure => "transient_infrastructure",
            ErrorKind::ToolInvocation => "tool_invocation",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientInfrastructure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub attempts: u32,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            diagnostic: None,
            attempts: 1,
        }
    }

    /// Configuration problem attributed to the named recipe field.
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{} ({field})", message.into());
        Self {
            field: Some(field),
            ..Self::new(ErrorKind::Configuration, message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientInfrastructure, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolInvocation, message)
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        if !diagnostic.is_empty() {
            self.diagnostic = Some(diagnostic);
        }
        self
    }

    /// Adds a line after any diagnostic already captured.
    pub fn append_diagnostic(mut self, line: impl AsRef<str>) -> Self {
        let line = line.as_ref();
        self.diagnostic = Some(match self.diagnostic.take() {
            Some(existing) => format!("{existing}\n{line}"),
            None => line.to_string(),
        });
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Message plus captured tool output, as stored on the failed stage result.
    pub fn render(&self) -> String {
        match &self.diagnostic {
            Some(diagnostic) => format!("{self}\n{diagnostic}"),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_name_the_field() {
        let err = StageError::configuration("build.name", "name cannot be empty");
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(err.field.as_deref(), Some("build.name"));
        assert!(err.to_string().contains("build.name"));
        assert!(!err.kind.is_retryable());
    }

    #[test]
    fn render_appends_diagnostic_verbatim() {
        let err = StageError::tool("builder exited with status 1")
            .with_diagnostic("stderr:\nModuleNotFoundError: No module named 'flet'");
        let rendered = err.render();
        assert!(rendered.starts_with("tool_invocation error: builder exited"));
        assert!(rendered.ends_with("No module named 'flet'"));
    }

    #[test]
    fn appended_diagnostic_keeps_tool_output() {
        let err = StageError::tool("venv failed")
            .with_diagnostic("ensurepip is not available")
            .append_diagnostic("Failed to remove .cache/env: permission denied");
        assert_eq!(
            err.diagnostic.as_deref(),
            Some("ensurepip is not available\nFailed to remove .cache/env: permission denied")
        );
        assert_eq!(
            StageError::tool("x").append_diagnostic("only").diagnostic.as_deref(),
            Some("only")
        );
    }
}
