use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tagpipe::observability::{MetricsSnapshot, log_snapshot};
use tagpipe::pipeline::{PipelineRun, RunStatus, StageRegistry, build_pipeline};
use tagpipe::presets::{PRESETS, generate_preset};
use tagpipe::recipe::Recipe;
use tagpipe::security::{checksum_path, compute_sha256, verify_sha256, write_sha256};
use tagpipe::stages::{self, BUILTIN_STAGES, StageServices};
use tagpipe::trigger::{TagPattern, TriggerEvent};
use tagpipe::validation::{ValidationReport, validate_recipe};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run(args) => run_recipe(args),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { recipe, workspace } => {
            validate_recipe_cmd(&recipe, workspace)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recipe { action } => {
            recipe_command(action)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Trigger { tag, pattern } => trigger_command(&tag, pattern.as_deref()),
        Commands::Digest {
            path,
            output,
            verify,
        } => {
            digest_command(&path, output.as_deref(), verify)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tagpipe", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn run_recipe(args: RunArgs) -> Result<ExitCode> {
    let recipe = Recipe::load(&args.recipe)?;
    let pattern = recipe.tag_pattern()?;

    let Some(git_ref) = args.tag.filter(|tag| !tag.trim().is_empty()) else {
        bail!("No tag given; pass --tag or set GITHUB_REF");
    };
    let Some(trigger) = TriggerEvent::from_push(&git_ref, args.revision, args.actor, &pattern)
    else {
        info!(
            git_ref = %git_ref,
            pattern = pattern.as_str(),
            "Ref does not match the release tag pattern; no run started"
        );
        return Ok(ExitCode::SUCCESS);
    };

    let workspace = resolve_workspace(args.workspace)?;
    let services = StageServices::from_recipe(&recipe)?;
    let registry = build_registry(&services);
    let report = validate_recipe(&recipe, &registry, &workspace);
    log_report(&args.recipe, &report);
    if !report.is_ok() {
        bail!(
            "Recipe validation failed with {} error(s); no run started",
            report.errors.len()
        );
    }

    let executor = build_pipeline(&registry, &recipe.pipeline, &workspace)?;

    if args.dry_run {
        info!(
            tag = %trigger.tag,
            workspace = %workspace.display(),
            stages = ?executor.stage_names(),
            artifact = %recipe.build.artifact_path().display(),
            "Dry run: recipe is valid, nothing executed"
        );
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        tag = %trigger.tag,
        revision = trigger.revision.as_deref().unwrap_or("-"),
        actor = trigger.actor.as_deref().unwrap_or("-"),
        "Release run triggered"
    );
    let run = executor.run(trigger);
    print_summary(&run);

    if let Some(path) = &args.report {
        write_json(path, &run, "run report")?;
        info!(report = %path.display(), "Run report written");
    }

    let snapshot = executor.metrics().snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    export_metrics(
        &snapshot,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;

    Ok(ExitCode::from(run.status.exit_code()))
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    let current = env::current_dir().context("Failed to determine current directory")?;
    Ok(match workspace {
        Some(path) if path.is_absolute() => path,
        Some(path) => current.join(path),
        None => current,
    })
}

fn print_summary(run: &PipelineRun) {
    for stage in &run.stages {
        let status = serde_json::to_value(stage.status)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        println!("{:<14} {status}", stage.stage);
    }
    if let Some(artifact) = &run.artifact {
        println!(
            "artifact       {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.size_bytes,
            artifact.sha256
        );
    }
    match run.status {
        RunStatus::Succeeded => println!("run            succeeded"),
        RunStatus::PartialSuccess => {
            println!("run            partial success (artifact built, publish failed)")
        }
        _ => println!("run            failed"),
    }
    if let Some(failure) = &run.failure {
        println!(
            "failure        {} [{}] {}",
            failure.stage, failure.kind, failure.message
        );
    }
}

fn export_metrics(
    snapshot: &MetricsSnapshot,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if let Some(path) = metrics_json {
        write_json(path, snapshot, "metrics JSON")?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what}: {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn list_stages() {
    println!("Available stages:");
    for (name, summary) in BUILTIN_STAGES {
        println!("- {name:<13} {summary}");
    }
}

fn log_report(recipe_path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %recipe_path.display(), "{error_msg}");
    }
}

fn check_recipe(recipe_path: &Path, workspace: &Path) -> Result<ValidationReport> {
    let recipe = Recipe::load(recipe_path)?;
    let services = StageServices::from_recipe(&recipe)?;
    let registry = build_registry(&services);
    Ok(validate_recipe(&recipe, &registry, workspace))
}

fn validate_recipe_cmd(recipe_path: &Path, workspace: Option<PathBuf>) -> Result<()> {
    let workspace = resolve_workspace(workspace)?;
    let report = check_recipe(recipe_path, &workspace)?;
    log_report(recipe_path, &report);

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New {
            preset,
            name,
            repository,
            output,
        } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &name, &repository, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes, workspace } => lint_recipes(&recipes, workspace),
    }
}

fn lint_recipes(recipes: &[PathBuf], workspace: Option<PathBuf>) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }
    let workspace = resolve_workspace(workspace)?;

    let mut failures = 0usize;
    for recipe_path in recipes {
        match check_recipe(recipe_path, &workspace) {
            Ok(report) => {
                log_report(recipe_path, &report);
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }
    info!("All recipe lint checks passed");
    Ok(())
}

/// Reports whether `git_ref` would start a run. Exits 0 on a match, 1 otherwise.
fn trigger_command(git_ref: &str, pattern: Option<&str>) -> Result<ExitCode> {
    let pattern = match pattern {
        Some(pattern) => TagPattern::new(pattern)?,
        None => TagPattern::default(),
    };
    match TriggerEvent::from_push(git_ref, None, None, &pattern) {
        Some(event) => {
            println!("{} matches {}: run would start", event.tag, pattern.as_str());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("{git_ref} does not match {}: no run", pattern.as_str());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn digest_command(path: &Path, output: Option<&Path>, verify: bool) -> Result<()> {
    if verify {
        let checksum_file = output.map_or_else(|| checksum_path(path), Path::to_path_buf);
        let digest = verify_sha256(path, &checksum_file)?;
        println!("{}  {}: OK", digest, path.display());
        info!(
            file = %path.display(),
            checksum_file = %checksum_file.display(),
            "SHA256 verified"
        );
    } else if let Some(out_path) = output {
        let digest = write_sha256(path, out_path)?;
        println!("{}  {}", digest, path.display());
        info!(
            file = %path.display(),
            digest_output = %out_path.display(),
            "SHA256 digest written"
        );
    } else {
        let digest = compute_sha256(path)?;
        println!("{}  {}", digest, path.display());
        info!(file = %path.display(), "SHA256 computed");
    }
    Ok(())
}

fn build_registry(services: &StageServices) -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry, services);
    registry
}

#[derive(Parser)]
#[command(
    name = "tagpipe",
    version,
    about = "Tag-triggered build and release pipeline for single-file desktop executables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    recipe: PathBuf,
    /// Tag or `refs/tags/...` ref that was pushed.
    #[arg(long, env = "GITHUB_REF")]
    tag: Option<String>,
    /// Commit the tag points at.
    #[arg(long, env = "GITHUB_SHA")]
    revision: Option<String>,
    #[arg(long, env = "GITHUB_ACTOR")]
    actor: Option<String>,
    /// Checked-out source tree; defaults to the current directory.
    #[arg(long, value_hint = ValueHint::DirPath)]
    workspace: Option<PathBuf>,
    /// Validate and print the plan without running any stage.
    #[arg(long)]
    dry_run: bool,
    /// Write the run record as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the release pipeline for a pushed tag.
    Run(RunArgs),
    ListStages,
    Validate {
        recipe: PathBuf,
        #[arg(long, value_hint = ValueHint::DirPath)]
        workspace: Option<PathBuf>,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// Check whether a tag or ref would start a run.
    Trigger {
        tag: String,
        /// Regular expression the tag must match; defaults to version tags like `v1.2.3`.
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print (and optionally write) the SHA-256 of a file.
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Check the file against `--output` (default `<path>.sha256`) instead of writing it.
        #[arg(long)]
        verify: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(PRESETS))]
        preset: String,
        /// Executable name.
        #[arg(long, default_value = "app")]
        name: String,
        /// `owner/name` of the release repository.
        #[arg(long, default_value = "owner/app")]
        repository: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
        #[arg(long, value_hint = ValueHint::DirPath)]
        workspace: Option<PathBuf>,
    },
}
