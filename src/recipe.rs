use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::buildspec::BuildSpec;
use crate::pipeline::StageSpec;
use crate::release::DEFAULT_GITHUB_API;
use crate::retry::RetryPolicy;
use crate::trigger::{DEFAULT_TAG_PATTERN, TagPattern};

/// Stage order used when a recipe does not list its own pipeline.
pub const DEFAULT_STAGES: [&str; 6] = [
    "checkout",
    "provision",
    "install",
    "stage-assets",
    "package",
    "publish",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    #[serde(default)]
    pub trigger: TriggerSettings,
    #[serde(default)]
    pub toolchain: ToolchainSpec,
    #[serde(default)]
    pub dependencies: DependencySpec,
    /// Directories that must exist before packaging.
    #[serde(default)]
    pub assets: Vec<PathBuf>,
    pub build: BuildSpec,
    pub release: ReleaseSpec,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<StageSpec>,
}

fn default_pipeline() -> Vec<StageSpec> {
    DEFAULT_STAGES.iter().map(|name| StageSpec::named(name)).collect()
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn tag_pattern(&self) -> Result<TagPattern> {
        TagPattern::new(&self.trigger.tag_pattern)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerSettings {
    #[serde(default = "default_tag_pattern")]
    pub tag_pattern: String,
}

fn default_tag_pattern() -> String {
    DEFAULT_TAG_PATTERN.to_string()
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            tag_pattern: default_tag_pattern(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolchainSpec {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Required version prefix, e.g. `3.11`.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub virtualenv: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".tagpipe/cache")
}

fn default_true() -> bool {
    true
}

impl Default for ToolchainSpec {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            version: None,
            virtualenv: true,
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencySpec {
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_true")]
    pub upgrade_installer: bool,
    /// Packages installed after the manifest, typically the builder.
    #[serde(default = "default_extra_packages")]
    pub extra: Vec<String>,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_extra_packages() -> Vec<String> {
    vec!["pyinstaller".to_string()]
}

impl Default for DependencySpec {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            upgrade_installer: true,
            extra: default_extra_packages(),
        }
    }
}

/// What to do when the release already carries an asset with the artifact's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingAssetPolicy {
    #[default]
    Reject,
    Replace,
    Skip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReleaseSpec {
    /// `owner/name` of the hosting repository.
    pub repository: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub on_existing: ExistingAssetPolicy,
}

fn default_api_url() -> String {
    DEFAULT_GITHUB_API.to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl ReleaseSpec {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            api_url: default_api_url(),
            token_env: default_token_env(),
            on_existing: ExistingAssetPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_recipe_fills_defaults() {
        let recipe: Recipe = serde_yaml::from_str(
            "version: 1\nbuild:\n  name: SRTTranslator\n  entry_point: main.py\nrelease:\n  repository: octo/srt\n",
        )
        .unwrap();
        let stages: Vec<_> = recipe.pipeline.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, DEFAULT_STAGES.to_vec());
        assert_eq!(recipe.toolchain.interpreter, "python3");
        assert_eq!(recipe.dependencies.manifest, PathBuf::from("requirements.txt"));
        assert_eq!(recipe.dependencies.extra, vec!["pyinstaller"]);
        assert_eq!(recipe.release.token_env, "GITHUB_TOKEN");
        assert_eq!(recipe.release.on_existing, ExistingAssetPolicy::Reject);
        assert_eq!(recipe.retry, RetryPolicy::default());
        assert!(recipe.tag_pattern().unwrap().matches("v2.3.1"));
        assert!(recipe.build.console);
    }

    #[test]
    fn misspelled_hidden_import_fails_to_load() {
        let err = serde_yaml::from_str::<Recipe>(
            "version: 1\nbuild:\n  name: a\n  entry_point: main.py\n  hidden_imports: ['flet.', pysrt]\nrelease:\n  repository: o/r\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("hidden import"));
    }
}
