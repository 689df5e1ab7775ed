use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::error::StageError;
use crate::manifest::DependencyManifest;
use crate::pipeline::{ContextDelta, PipelineContext, Stage, StageParameters};
use crate::process::{Invocation, ToolOutput, ToolRunner};
use crate::recipe::DependencySpec;
use crate::retry::{RetryPolicy, Sleeper, retry_transient};

use super::{StageServices, reject_unknown, take_bool};

/// Output fragments (lowercased) that mark an installer failure as network trouble.
const NETWORK_SIGNATURES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "connectionerror",
    "newconnectionerror",
    "temporary failure in name resolution",
    "name or service not known",
    "network is unreachable",
    "read timed out",
    "connect timeout",
    "max retries exceeded",
    "remote end closed connection",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
];

pub(crate) struct InstallStage {
    dependencies: DependencySpec,
    upgrade_installer: bool,
    retry: RetryPolicy,
    runner: Arc<dyn ToolRunner>,
    sleeper: Arc<dyn Sleeper>,
}

impl InstallStage {
    pub(crate) fn from_params(mut params: StageParameters, services: &StageServices) -> Result<Self> {
        let upgrade_installer = take_bool(&mut params, "upgrade_installer")?
            .unwrap_or(services.dependencies.upgrade_installer);
        reject_unknown(params, "install")?;
        Ok(Self {
            dependencies: services.dependencies.clone(),
            upgrade_installer,
            retry: services.retry.clone(),
            runner: services.runner.clone(),
            sleeper: services.sleeper.clone(),
        })
    }

    /// Run `python -m pip <args>` under the retry policy; returns attempts used.
    fn pip(&self, python: &str, args: Vec<String>) -> Result<u32, StageError> {
        let invocation = Invocation::new(python).args(["-m", "pip"]).args(args);
        let label = invocation.to_string();
        let retried = retry_transient(&self.retry, self.sleeper.as_ref(), &label, |attempt| {
            info!(command = %invocation, attempt, "Running installer");
            let output = self.runner.run(&invocation).map_err(|err| {
                StageError::tool(format!("Failed to start '{invocation}': {err}"))
            })?;
            if output.is_success() {
                Ok(())
            } else {
                Err(classify_install_failure(&invocation, &output))
            }
        })?;
        Ok(retried.attempts)
    }
}

impl Stage for InstallStage {
    fn name(&self) -> &'static str {
        "install"
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        let python = ctx.require("env.python", self.name())?;
        let manifest_path = ctx.resolve(&self.dependencies.manifest);
        let manifest = DependencyManifest::load(&manifest_path, "dependencies.manifest")?;

        let mut attempts = 0;
        if self.upgrade_installer {
            attempts += self.pip(python, strings(["install", "--upgrade", "pip"]))?;
        }
        attempts += self.pip(
            python,
            vec![
                "install".to_string(),
                "-r".to_string(),
                manifest_path.display().to_string(),
            ],
        )?;
        if !self.dependencies.extra.is_empty() {
            let mut args = strings(["install"]);
            args.extend(self.dependencies.extra.iter().cloned());
            attempts += self.pip(python, args)?;
        }

        info!(
            packages = manifest.requirements.len(),
            attempts, "Dependencies installed"
        );
        Ok(ContextDelta::new()
            .with("install.packages", manifest.requirements.len())
            .with("install.attempts", attempts)
            .with("install.manifest_sha256", manifest.digest()))
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Network-looking failures are transient; everything else is the tool's fault.
pub fn classify_install_failure(invocation: &Invocation, output: &ToolOutput) -> StageError {
    let message = format!("'{invocation}' failed with {}", output.describe_status());
    let haystack = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
    let err = if NETWORK_SIGNATURES.iter().any(|sig| haystack.contains(sig)) {
        StageError::transient(message)
    } else {
        StageError::tool(message)
    };
    err.with_diagnostic(output.diagnostic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn network_failures_are_transient() {
        let invocation = Invocation::new("python").args(["-m", "pip", "install", "flet"]);
        let output = ToolOutput::failure(
            1,
            "WARNING: Retrying (Retry(total=0)) after connection broken by 'NewConnectionError'",
        );
        let err = classify_install_failure(&invocation, &output);
        assert_eq!(err.kind, ErrorKind::TransientInfrastructure);
        assert!(err.diagnostic.unwrap().contains("NewConnectionError"));
    }

    #[test]
    fn resolver_failures_are_fatal() {
        let invocation = Invocation::new("python").args(["-m", "pip", "install", "flet==99"]);
        let output = ToolOutput::failure(
            1,
            "ERROR: No matching distribution found for flet==99",
        );
        assert_eq!(
            classify_install_failure(&invocation, &output).kind,
            ErrorKind::ToolInvocation
        );
    }
}
