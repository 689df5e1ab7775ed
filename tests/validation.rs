use std::fs;
use std::sync::Arc;

use serde_json::json;
use tagpipe::pipeline::{StageParameters, StageRegistry, StageSpec};
use tagpipe::process::SystemRunner;
use tagpipe::recipe::Recipe;
use tagpipe::release::GitHubReleaseClient;
use tagpipe::stages::{self, StageServices};
use tagpipe::validation::validate_recipe;
use tempfile::tempdir;

const BASE: &str = r#"
version: 1
build:
  name: SRTTranslator
  entry_point: main.py
release:
  repository: octo-org/srt-translator
"#;

fn build_registry(recipe: &Recipe) -> StageRegistry {
    let client =
        GitHubReleaseClient::new(&recipe.release.api_url, &recipe.release.repository).unwrap();
    let services = StageServices::with_clients(recipe, Arc::new(SystemRunner), Arc::new(client));
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry, &services);
    registry
}

fn stage_spec(name: &str, params: serde_json::Value) -> StageSpec {
    let map: StageParameters = params.as_object().cloned().unwrap_or_default();
    StageSpec {
        stage: name.to_string(),
        params: Some(map),
    }
}

#[test]
fn malformed_hidden_import_fails_to_load() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("recipe.yaml");
    let yaml = r#"
version: 1
build:
  name: SRTTranslator
  entry_point: main.py
  hidden_imports: ["flet..core"]
release:
  repository: octo-org/srt-translator
"#;
    fs::write(&path, yaml).unwrap();

    let err = Recipe::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("not a dotted module path"));
}

#[test]
fn assets_must_be_staged_before_packaging() {
    let temp = tempdir().unwrap();
    let mut recipe: Recipe = serde_yaml::from_str(BASE).unwrap();
    recipe.pipeline = ["checkout", "provision", "install", "package", "stage-assets", "publish"]
        .iter()
        .map(|name| StageSpec::named(name))
        .collect();

    let report = validate_recipe(&recipe, &build_registry(&recipe), temp.path());
    assert!(!report.is_ok());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("'package' must come after stage 'stage-assets'")),
        "{:?}",
        report.errors
    );
}

#[test]
fn stage_parameters_are_type_checked() {
    let temp = tempdir().unwrap();
    let mut recipe: Recipe = serde_yaml::from_str(BASE).unwrap();
    recipe.pipeline[0] = stage_spec("checkout", json!({"verify_revision": "sometimes"}));
    recipe.pipeline[5] = stage_spec("publish", json!({"on_existing": "overwrite"}));

    let report = validate_recipe(&recipe, &build_registry(&recipe), temp.path());
    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    assert!(report.errors[0].contains("verify_revision"));
    assert!(report.errors[1].contains("on_existing"));
}

#[test]
fn invalid_tag_pattern_is_reported() {
    let temp = tempdir().unwrap();
    let mut recipe: Recipe = serde_yaml::from_str(BASE).unwrap();
    recipe.trigger.tag_pattern = "^v(\\d+".into();

    let report = validate_recipe(&recipe, &build_registry(&recipe), temp.path());
    assert!(report.errors.iter().any(|err| err.starts_with("trigger.tag_pattern")));
}
