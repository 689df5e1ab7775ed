use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::error::StageError;
use crate::pipeline::{ContextDelta, PipelineContext, Stage, StageParameters};
use crate::process::{Invocation, ToolRunner, run_checked};
use crate::recipe::{DependencySpec, ToolchainSpec};
use crate::security::compute_sha256;

use super::{StageServices, reject_unknown};

/// Length of the manifest digest prefix used in cache directory names.
const CACHE_KEY_LEN: usize = 16;

pub(crate) struct ProvisionStage {
    toolchain: ToolchainSpec,
    dependencies: DependencySpec,
    runner: Arc<dyn ToolRunner>,
}

impl ProvisionStage {
    pub(crate) fn from_params(params: StageParameters, services: &StageServices) -> Result<Self> {
        reject_unknown(params, "provision")?;
        Ok(Self {
            toolchain: services.toolchain.clone(),
            dependencies: services.dependencies.clone(),
            runner: services.runner.clone(),
        })
    }

    fn interpreter_version(&self, interpreter: &Path) -> Result<String, StageError> {
        let output = run_checked(
            self.runner.as_ref(),
            &Invocation::new(interpreter).arg("--version"),
        )?;
        // Python 2 and early 3.x print the version on stderr.
        parse_python_version(&output.stdout)
            .or_else(|| parse_python_version(&output.stderr))
            .ok_or_else(|| {
                StageError::tool(format!(
                    "Could not read a version from '{} --version'",
                    interpreter.display()
                ))
                .with_diagnostic(output.diagnostic())
            })
    }
}

impl Stage for ProvisionStage {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        let interpreter = self
            .runner
            .locate(&self.toolchain.interpreter)
            .ok_or_else(|| {
                StageError::tool(format!(
                    "Interpreter '{}' is not available on this runner",
                    self.toolchain.interpreter
                ))
            })?;
        let version = self.interpreter_version(&interpreter)?;
        if let Some(required) = self.toolchain.version.as_deref()
            && !version_matches(required, &version)
        {
            return Err(StageError::tool(format!(
                "Toolchain requires Python {required}, but {} is {version}",
                interpreter.display()
            )));
        }

        let manifest = ctx.resolve(&self.dependencies.manifest);
        let digest = compute_sha256(&manifest).map_err(|err| {
            StageError::configuration("dependencies.manifest", format!("{err:#}"))
        })?;
        let cache_key = digest[..CACHE_KEY_LEN].to_string();

        let mut delta = ContextDelta::new()
            .with("env.interpreter", interpreter.display())
            .with("env.python_version", &version)
            .with("env.cache_key", &cache_key);

        let python = if self.toolchain.virtualenv {
            let cache_root = ctx.resolve(&self.toolchain.cache_dir);
            let env_dir = cache_root.join(format!("py{version}-{cache_key}"));
            let cache_hit = is_complete_env(&env_dir);
            if cache_hit {
                info!(env = %env_dir.display(), "Reusing cached environment");
            } else {
                if env_dir.exists() {
                    warn!(env = %env_dir.display(), "Discarding incomplete environment");
                    discard_env(&env_dir)?;
                }
                fs::create_dir_all(&cache_root).map_err(|err| {
                    StageError::configuration(
                        "toolchain.cache_dir",
                        format!("Cannot create {}: {err}", cache_root.display()),
                    )
                })?;
                if let Err(err) = run_checked(
                    self.runner.as_ref(),
                    &Invocation::new(&interpreter)
                        .args(["-m", "venv"])
                        .arg(env_dir.display().to_string()),
                ) {
                    if env_dir.exists() {
                        warn!(env = %env_dir.display(), "Removing environment left by failed venv");
                        if let Err(cleanup) = fs::remove_dir_all(&env_dir) {
                            return Err(err.append_diagnostic(format!(
                                "Failed to remove {}: {cleanup}",
                                env_dir.display()
                            )));
                        }
                    }
                    return Err(err);
                }
                info!(env = %env_dir.display(), "Created environment");
            }
            delta = delta
                .with("env.root", env_dir.display())
                .with("env.cache_hit", cache_hit);
            venv_python(&env_dir)
        } else {
            delta = delta.with("env.cache_hit", false);
            interpreter
        };

        Ok(delta.with("env.python", python.display()))
    }
}

/// Extracts `3.11.4` from `Python 3.11.4`.
pub fn parse_python_version(text: &str) -> Option<String> {
    text.split_whitespace()
        .skip_while(|word| !word.eq_ignore_ascii_case("python"))
        .nth(1)
        .filter(|version| version.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Component-wise prefix match: `3.11` accepts `3.11.4` but not `3.1.2` or `3.110`.
pub fn version_matches(required: &str, actual: &str) -> bool {
    let required: Vec<_> = required.trim().split('.').collect();
    let actual: Vec<_> = actual.trim().split('.').collect();
    required.len() <= actual.len() && required.iter().zip(&actual).all(|(r, a)| r == a)
}

/// A usable environment has both its marker file and its interpreter.
/// `venv` writes `pyvenv.cfg` before bootstrapping pip, so the marker alone
/// survives a failed creation.
fn is_complete_env(env_dir: &Path) -> bool {
    env_dir.join("pyvenv.cfg").is_file() && venv_python(env_dir).is_file()
}

fn discard_env(env_dir: &Path) -> Result<(), StageError> {
    fs::remove_dir_all(env_dir).map_err(|err| {
        StageError::configuration(
            "toolchain.cache_dir",
            format!("Cannot remove incomplete environment {}: {err}", env_dir.display()),
        )
    })
}

fn venv_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_read_from_banner() {
        assert_eq!(parse_python_version("Python 3.11.4\n").as_deref(), Some("3.11.4"));
        assert_eq!(parse_python_version("python 3.12.0rc1").as_deref(), Some("3.12.0rc1"));
        assert_eq!(parse_python_version("command not found"), None);
        assert_eq!(parse_python_version("Python"), None);
    }

    #[test]
    fn version_prefix_matches_whole_components() {
        assert!(version_matches("3.11", "3.11.4"));
        assert!(version_matches("3", "3.12.1"));
        assert!(version_matches("3.11.4", "3.11.4"));
        assert!(!version_matches("3.1", "3.11.4"));
        assert!(!version_matches("3.11", "3.110.0"));
        assert!(!version_matches("3.11.4.1", "3.11.4"));
    }
}
