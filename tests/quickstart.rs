use std::path::Path;

use tagpipe::pipeline::StageRegistry;
use tagpipe::recipe::Recipe;
use tagpipe::stages::{self, StageServices};
use tagpipe::validation::validate_recipe;

#[test]
fn sample_recipe_is_valid() {
    let recipe = Recipe::load(Path::new("recipes/srt-translator.yaml"))
        .expect("sample recipe should load");
    let services = StageServices::from_recipe(&recipe).expect("services");
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry, &services);
    let report = validate_recipe(&recipe, &registry, Path::new("demo/srt-translator"));
    assert!(
        report.is_ok(),
        "sample recipe should pass validation: {:?}",
        report.errors
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}
