//! Blocking invocation of external tools (interpreter, installer, builder).
//!
//! Stages never touch `std::process::Command` directly; they describe an
//! [`Invocation`] and hand it to a [`ToolRunner`]. Tests swap in scripted
//! runners so the orchestration can be exercised without Python installed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::StageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Both streams, verbatim, labelled for postmortem reading.
    pub fn diagnostic(&self) -> String {
        let mut text = String::new();
        if !self.stdout.is_empty() {
            text.push_str("stdout:\n");
            text.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                text.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            text.push_str("stderr:\n");
            text.push_str(&self.stderr);
        }
        text
    }

    pub fn describe_status(&self) -> String {
        match self.status {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput>;

    /// Resolve a program name against `PATH`. Paths that already point at a
    /// file are returned as-is.
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        which::which(program).ok()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        debug!(command = %invocation, "Spawning tool");
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        let output = command.output()?;
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs `invocation` and turns a spawn failure or non-zero exit into a
/// tool-invocation error carrying the captured output.
pub fn run_checked(
    runner: &dyn ToolRunner,
    invocation: &Invocation,
) -> Result<ToolOutput, StageError> {
    let output = runner.run(invocation).map_err(|err| {
        StageError::tool(format!("Failed to start '{invocation}': {err}"))
    })?;
    if output.is_success() {
        Ok(output)
    } else {
        Err(StageError::tool(format!(
            "'{invocation}' failed with {}",
            output.describe_status()
        ))
        .with_diagnostic(output.diagnostic()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let invocation = Invocation::new("python")
            .args(["-m", "pip", "install"])
            .arg("My Package");
        assert_eq!(invocation.to_string(), "python -m pip install \"My Package\"");
    }

    #[test]
    fn diagnostic_keeps_both_streams() {
        let output = ToolOutput {
            status: Some(1),
            stdout: "building".into(),
            stderr: "boom".into(),
        };
        assert_eq!(output.diagnostic(), "stdout:\nbuilding\nstderr:\nboom");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_exit_status() {
        let runner = SystemRunner;
        let ok = runner
            .run(&Invocation::new("sh").args(["-c", "echo hello"]))
            .unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.stdout.trim(), "hello");

        let err = run_checked(
            &runner,
            &Invocation::new("sh").args(["-c", "echo nope >&2; exit 3"]),
        )
        .unwrap_err();
        assert!(err.message.contains("exit status 3"));
        assert!(err.diagnostic.unwrap().contains("nope"));
    }
}
