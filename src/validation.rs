use std::path::{Component, Path};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::manifest::DependencyManifest;
use crate::pipeline::{StageRegistry, StageSpec};
use crate::recipe::Recipe;
use crate::retry::MAX_ATTEMPTS_LIMIT;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Stages that must appear, if present, before the keyed stage.
const ORDERING: &[(&str, &str)] = &[
    ("install", "provision"),
    ("package", "install"),
    ("package", "stage-assets"),
    ("publish", "package"),
];

/// Check a recipe without touching the network or running any tool.
///
/// `workspace` is used to read the dependency manifest for the hidden-import
/// cross-check; a missing manifest only produces a warning here because the
/// checkout may not have happened yet.
pub fn validate_recipe(
    recipe: &Recipe,
    registry: &StageRegistry,
    workspace: &Path,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if let Err(err) = recipe.tag_pattern() {
        report.errors.push(format!("trigger.tag_pattern: {err:#}"));
    }

    report.merge(validate_build(recipe));
    report.merge(validate_release(recipe));
    report.merge(validate_hidden_imports(recipe, workspace));

    if recipe.retry.max_attempts == 0 {
        report
            .errors
            .push("retry.max_attempts must be at least 1".into());
    } else if recipe.retry.max_attempts > MAX_ATTEMPTS_LIMIT {
        report.errors.push(format!(
            "retry.max_attempts is {}, the limit is {MAX_ATTEMPTS_LIMIT}",
            recipe.retry.max_attempts
        ));
    }

    if recipe.pipeline.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    for (idx, stage) in recipe.pipeline.iter().enumerate() {
        if recipe.pipeline[..idx]
            .iter()
            .any(|prev| prev.stage == stage.stage)
        {
            report
                .errors
                .push(format!("Stage '{}' is listed more than once", stage.stage));
        }
        report.merge(validate_stage_order(idx, stage, &recipe.pipeline));
        report.merge(
            validate_stage(stage, registry)
                .with_context(|| format!("Stage {} ('{}')", idx + 1, stage.stage))
                .unwrap_or_else(|err| ValidationReport {
                    errors: vec![err.to_string()],
                    warnings: vec![],
                }),
        );
    }

    report
}

fn validate_build(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let build = &recipe.build;

    if build.name.trim().is_empty() {
        report.errors.push("build.name cannot be empty".into());
    } else if build.name.contains(['/', '\\']) || build.name == "." || build.name == ".." {
        report.errors.push(format!(
            "build.name '{}' must be a plain file name",
            build.name
        ));
    }

    if build.entry_point.as_os_str().is_empty() {
        report.errors.push("build.entry_point cannot be empty".into());
    }
    if build.output_dir.as_os_str().is_empty() {
        report.errors.push("build.output_dir cannot be empty".into());
    }

    for (idx, mapping) in build.assets.iter().enumerate() {
        let label = format!("build.assets[{idx}]");
        let source = mapping.source.to_string_lossy();
        if source.trim().is_empty() {
            report.errors.push(format!("{label}: source cannot be empty"));
        } else if let Err(err) = glob::Pattern::new(&source) {
            report.errors.push(format!(
                "{label}: source '{source}' is not a valid glob: {err}"
            ));
        }
        if mapping.target.as_os_str().is_empty() {
            report.errors.push(format!("{label}: target cannot be empty"));
        } else if !is_contained(&mapping.target) {
            report.errors.push(format!(
                "{label}: target '{}' must be a relative path inside the bundle",
                mapping.target.display()
            ));
        }
        let covered = recipe
            .assets
            .iter()
            .any(|dir| mapping.source.starts_with(dir));
        if !covered && !recipe.assets.is_empty() {
            report.warnings.push(format!(
                "{label}: source '{source}' is outside every staged asset directory"
            ));
        }
    }

    for dir in &recipe.assets {
        if dir.as_os_str().is_empty() {
            report.errors.push("assets entries cannot be empty".into());
        }
    }

    report
}

fn validate_release(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let release = &recipe.release;

    let parts: Vec<_> = release.repository.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|part| part.trim().is_empty()) {
        report.errors.push(format!(
            "release.repository '{}' must be in owner/name form",
            release.repository
        ));
    }
    if !release.api_url.starts_with("https://") && !release.api_url.starts_with("http://") {
        report.errors.push(format!(
            "release.api_url '{}' is not an http(s) URL",
            release.api_url
        ));
    }
    if release.token_env.trim().is_empty() {
        report.errors.push("release.token_env cannot be empty".into());
    }

    report
}

fn validate_hidden_imports(recipe: &Recipe, workspace: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();
    if recipe.build.hidden_imports.is_empty() {
        return report;
    }

    let manifest_path = if recipe.dependencies.manifest.is_absolute() {
        recipe.dependencies.manifest.clone()
    } else {
        workspace.join(&recipe.dependencies.manifest)
    };
    let provided = if manifest_path.is_file() {
        match DependencyManifest::load(&manifest_path, "dependencies.manifest") {
            Ok(manifest) => manifest.import_roots(),
            Err(err) => {
                report.errors.push(err.to_string());
                return report;
            }
        }
    } else {
        report.warnings.push(format!(
            "Dependency manifest {} not found; hidden imports checked against build.import_roots only",
            manifest_path.display()
        ));
        Vec::new()
    };

    for import in recipe.build.unknown_hidden_imports(&provided) {
        report.errors.push(format!(
            "build.hidden_imports: '{import}' is not provided by any declared dependency \
             (add '{}' to the manifest or build.import_roots)",
            import.root()
        ));
    }

    report
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn validate_stage(stage: &StageSpec, registry: &StageRegistry) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report
            .errors
            .push(format!("{:#}", err.context("Failed to instantiate stage")));
    }

    Ok(report)
}

fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (later, earlier) in ORDERING {
        if stage.stage != *later {
            continue;
        }
        let misplaced = pipeline[idx + 1..]
            .iter()
            .any(|next| next.stage == *earlier);
        if misplaced {
            report.errors.push(format!(
                "Stage '{later}' must come after stage '{earlier}'"
            ));
        }
    }
    if stage.stage == "publish" && !pipeline[..idx].iter().any(|prev| prev.stage == "package") {
        report
            .errors
            .push("Stage 'publish' requires a package stage earlier in the pipeline".into());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildspec::{AssetMapping, HiddenImport};
    use crate::process::SystemRunner;
    use crate::stages::{StageServices, register_defaults};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct NoReleases;

    impl crate::release::ReleaseClient for NoReleases {
        fn find_release(
            &self,
            _: &crate::release::SecretToken,
            _: &str,
        ) -> Result<Option<crate::release::Release>, crate::error::StageError> {
            unreachable!()
        }
        fn create_release(
            &self,
            _: &crate::release::SecretToken,
            _: &str,
        ) -> Result<crate::release::Release, crate::error::StageError> {
            unreachable!()
        }
        fn delete_asset(
            &self,
            _: &crate::release::SecretToken,
            _: &crate::release::ReleaseAsset,
        ) -> Result<(), crate::error::StageError> {
            unreachable!()
        }
        fn rename_asset(
            &self,
            _: &crate::release::SecretToken,
            _: &crate::release::ReleaseAsset,
            _: &str,
        ) -> Result<crate::release::ReleaseAsset, crate::error::StageError> {
            unreachable!()
        }
        fn upload_asset(
            &self,
            _: &crate::release::SecretToken,
            _: &crate::release::Release,
            _: &str,
            _: &Path,
        ) -> Result<crate::release::ReleaseAsset, crate::error::StageError> {
            unreachable!()
        }
    }

    fn recipe() -> Recipe {
        serde_yaml::from_str(
            "version: 1\nbuild:\n  name: SRTTranslator\n  entry_point: main.py\nrelease:\n  repository: octo/srt\n",
        )
        .unwrap()
    }

    fn registry(recipe: &Recipe) -> StageRegistry {
        let services =
            StageServices::with_clients(recipe, Arc::new(SystemRunner), Arc::new(NoReleases));
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry, &services);
        registry
    }

    #[test]
    fn default_recipe_is_valid() {
        let temp = tempdir().unwrap();
        let recipe = recipe();
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn publish_before_package_is_rejected() {
        let temp = tempdir().unwrap();
        let mut recipe = recipe();
        recipe.pipeline = ["provision", "install", "publish", "package"]
            .iter()
            .map(|name| StageSpec::named(name))
            .collect();
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert!(
            report
                .errors
                .iter()
                .any(|err| err.contains("'publish' must come after stage 'package'"))
        );
    }

    #[test]
    fn unknown_stage_and_bad_params_are_reported() {
        let temp = tempdir().unwrap();
        let mut recipe = recipe();
        let mut install = StageSpec::named("install");
        install.params = Some(
            serde_json::json!({"upgrade_instaler": true})
                .as_object()
                .unwrap()
                .clone(),
        );
        recipe.pipeline = vec![StageSpec::named("provision"), install, StageSpec::named("sign")];
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert!(report.errors.iter().any(|err| err.contains("Unknown stage 'sign'")));
    }

    #[test]
    fn release_and_build_fields_are_checked() {
        let temp = tempdir().unwrap();
        let mut recipe = recipe();
        recipe.release.repository = "just-a-name".into();
        recipe.build.name = "dist/app".into();
        recipe.build.assets.push(AssetMapping {
            source: PathBuf::from("assets/[icons"),
            target: PathBuf::from("../escape"),
        });
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        let joined = report.errors.join("\n");
        assert!(joined.contains("owner/name"));
        assert!(joined.contains("plain file name"));
        assert!(joined.contains("not a valid glob"));
        assert!(joined.contains("inside the bundle"));
    }

    #[test]
    fn retry_attempts_are_bounded() {
        let temp = tempdir().unwrap();
        let mut recipe = recipe();
        recipe.retry.max_attempts = 1000;
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("limit is 10"));

        recipe.retry.max_attempts = MAX_ATTEMPTS_LIMIT;
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn hidden_imports_must_be_declared() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("requirements.txt"), "flet==0.21\nGoogle-Trans>=4\n").unwrap();
        let mut recipe = recipe();
        recipe.build.hidden_imports = vec![
            HiddenImport::parse("flet.core").unwrap(),
            HiddenImport::parse("google_trans").unwrap(),
            HiddenImport::parse("pysrt").unwrap(),
        ];
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("'pysrt'"));

        recipe.build.import_roots.push("pysrt".into());
        let report = validate_recipe(&recipe, &registry(&recipe), temp.path());
        assert!(report.is_ok(), "{:?}", report.errors);
    }
}
