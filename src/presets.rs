use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::buildspec::{AssetMapping, BuildSpec};
use crate::recipe::{
    DEFAULT_STAGES, DependencySpec, Recipe, ReleaseSpec, ToolchainSpec, TriggerSettings,
};
use crate::pipeline::StageSpec;
use crate::retry::RetryPolicy;

pub const PRESETS: [&str; 2] = ["onefile-console", "onefile-windowed"];

/// Build the recipe for a named preset.
pub fn preset_recipe(name: &str, app_name: &str, repository: &str) -> Result<Recipe> {
    let console = match name {
        "onefile-console" => true,
        "onefile-windowed" => false,
        other => bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let mut build = BuildSpec::new(app_name, "main.py");
    build.console = console;
    build.assets.push(AssetMapping {
        source: PathBuf::from("assets"),
        target: PathBuf::from("assets"),
    });

    Ok(Recipe {
        version: 1,
        trigger: TriggerSettings::default(),
        toolchain: ToolchainSpec {
            version: Some("3.11".into()),
            ..ToolchainSpec::default()
        },
        dependencies: DependencySpec::default(),
        assets: vec![PathBuf::from("assets")],
        build,
        release: ReleaseSpec::new(repository),
        retry: RetryPolicy::default(),
        pipeline: DEFAULT_STAGES.iter().map(|stage| StageSpec::named(stage)).collect(),
    })
}

/// Render a preset recipe as YAML into `destination`.
pub fn generate_preset(
    name: &str,
    app_name: &str,
    repository: &str,
    destination: &Path,
) -> Result<PathBuf> {
    let recipe = preset_recipe(name, app_name, repository)?;
    let rendered = serde_yaml::to_string(&recipe)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn windowed_preset_hides_console() {
        let recipe = preset_recipe("onefile-windowed", "SRTTranslator", "octo/srt").unwrap();
        assert!(!recipe.build.console);
        assert_eq!(recipe.pipeline.len(), DEFAULT_STAGES.len());
        assert!(preset_recipe("onedir", "x", "o/r").is_err());
    }

    #[test]
    fn generated_preset_loads_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("recipes/release.yaml");
        generate_preset("onefile-console", "SRTTranslator", "octo/srt", &path).unwrap();

        let recipe = Recipe::load(&path).unwrap();
        assert!(recipe.build.console);
        assert_eq!(recipe.build.name, "SRTTranslator");
        assert_eq!(recipe.release.repository, "octo/srt");
        assert_eq!(recipe.toolchain.version.as_deref(), Some("3.11"));
    }
}
