use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::buildspec::BuildSpec;
use crate::pipeline::{StageParameters, StageRegistry};
use crate::process::{SystemRunner, ToolRunner};
use crate::recipe::{DependencySpec, Recipe, ReleaseSpec, ToolchainSpec};
use crate::release::{GitHubReleaseClient, ReleaseClient};
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper};

pub mod assets;
pub mod checkout;
pub mod install;
pub mod package;
pub mod provision;
pub mod publish;

pub use assets::{EnsureOutcome, ensure};
pub use package::Packager;
pub use publish::{PublishOutcome, Publisher, ReleaseTarget};

/// Built-in stages in their default order, with a one-line summary each.
pub const BUILTIN_STAGES: [(&str, &str); 6] = [
    ("checkout", "Confirm the workspace holds the tagged revision"),
    ("provision", "Locate the interpreter and create or reuse a cached environment"),
    ("install", "Install the dependency manifest and builder, retrying network failures"),
    ("stage-assets", "Create asset directories the build expects"),
    ("package", "Run the builder and verify the single-file artifact"),
    ("publish", "Upload the artifact to the release for the tag"),
];

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Everything the built-in stages need from the recipe and the outside world.
#[derive(Clone)]
pub struct StageServices {
    pub toolchain: ToolchainSpec,
    pub dependencies: DependencySpec,
    pub assets: Vec<PathBuf>,
    pub build: BuildSpec,
    pub release: ReleaseSpec,
    pub retry: RetryPolicy,
    pub runner: Arc<dyn ToolRunner>,
    pub releases: Arc<dyn ReleaseClient>,
    pub sleeper: Arc<dyn Sleeper>,
    pub env_lookup: EnvLookup,
}

impl StageServices {
    /// Services backed by real processes, the GitHub API and the process environment.
    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        let releases = GitHubReleaseClient::new(&recipe.release.api_url, &recipe.release.repository)?;
        Ok(Self::with_clients(
            recipe,
            Arc::new(SystemRunner),
            Arc::new(releases),
        ))
    }

    pub fn with_clients(
        recipe: &Recipe,
        runner: Arc<dyn ToolRunner>,
        releases: Arc<dyn ReleaseClient>,
    ) -> Self {
        Self {
            toolchain: recipe.toolchain.clone(),
            dependencies: recipe.dependencies.clone(),
            assets: recipe.assets.clone(),
            build: recipe.build.clone(),
            release: recipe.release.clone(),
            retry: recipe.retry.clone(),
            runner,
            releases,
            sleeper: Arc::new(ThreadSleeper),
            env_lookup: Arc::new(|key: &str| std::env::var(key).ok()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_env_lookup(mut self, lookup: EnvLookup) -> Self {
        self.env_lookup = lookup;
        self
    }
}

pub fn register_defaults(registry: &mut StageRegistry, services: &StageServices) {
    let s = services.clone();
    registry.register("checkout", move |params| {
        Ok(Box::new(checkout::CheckoutStage::from_params(params, &s)?))
    });
    let s = services.clone();
    registry.register("provision", move |params| {
        Ok(Box::new(provision::ProvisionStage::from_params(params, &s)?))
    });
    let s = services.clone();
    registry.register("install", move |params| {
        Ok(Box::new(install::InstallStage::from_params(params, &s)?))
    });
    let s = services.clone();
    registry.register("stage-assets", move |params| {
        Ok(Box::new(assets::StageAssetsStage::from_params(params, &s)?))
    });
    let s = services.clone();
    registry.register("package", move |params| {
        Ok(Box::new(package::PackageStage::from_params(params, &s)?))
    });
    let s = services.clone();
    registry.register("publish", move |params| {
        Ok(Box::new(publish::PublishStage::from_params(params, &s)?))
    });
}

fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None => Ok(None),
        Some(value) => match value_as_bool(&value) {
            Some(b) => Ok(Some(b)),
            None => bail!("parameter '{key}' must be a boolean, got {value}"),
        },
    }
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Vec<String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => bail!("parameter '{key}' must contain strings, got {other}"),
            })
            .collect(),
        Some(other) => bail!("parameter '{key}' must be a list of strings, got {other}"),
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parameters left over after a stage took the ones it understands are typos.
fn reject_unknown(params: StageParameters, stage: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().cloned().collect();
    keys.sort();
    bail!(
        "{stage} stage does not accept parameter(s): {}",
        keys.join(", ")
    )
}
