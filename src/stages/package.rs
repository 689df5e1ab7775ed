use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::buildspec::{BuildSpec, BundleMode};
use crate::error::StageError;
use crate::pipeline::{Artifact, ContextDelta, PipelineContext, Stage, StageParameters};
use crate::process::{Invocation, ToolRunner, run_checked};
use crate::security::compute_sha256;

use super::{StageServices, reject_unknown};

/// Drives the single-file-executable builder for one [`BuildSpec`].
pub struct Packager<'a> {
    runner: &'a dyn ToolRunner,
    python: &'a Path,
    workspace: &'a Path,
}

impl<'a> Packager<'a> {
    pub fn new(runner: &'a dyn ToolRunner, python: &'a Path, workspace: &'a Path) -> Self {
        Self {
            runner,
            python,
            workspace,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// The builder command line for `spec`.
    pub fn invocation(&self, spec: &BuildSpec) -> Invocation {
        let work_dir = self.resolve(&spec.work_dir);
        let mut invocation = Invocation::new(self.python)
            .args(["-m", spec.builder.as_str(), "--noconfirm"])
            .arg(spec.mode.builder_flag())
            .arg(if spec.console { "--console" } else { "--windowed" })
            .args(["--name", spec.name.as_str()])
            .arg("--distpath")
            .arg(self.resolve(&spec.output_dir).display().to_string())
            .arg("--workpath")
            .arg(work_dir.display().to_string())
            .arg("--specpath")
            .arg(work_dir.display().to_string())
            .current_dir(self.workspace);

        for mapping in &spec.assets {
            invocation = invocation
                .arg("--add-data")
                .arg(spec.add_data_arg(mapping, self.workspace));
        }
        for module in &spec.hidden_imports {
            invocation = invocation.arg("--hidden-import").arg(module.as_str());
        }
        invocation.arg(self.resolve(&spec.entry_point).display().to_string())
    }

    pub fn build(&self, spec: &BuildSpec) -> Result<Artifact, StageError> {
        let artifact_path = self.resolve(&spec.artifact_path());
        remove_stale(&artifact_path)?;

        let entry = self.resolve(&spec.entry_point);
        if !entry.is_file() {
            return Err(StageError::tool(format!(
                "Entry point {} does not exist; builder not invoked",
                entry.display()
            )));
        }

        let invocation = self.invocation(spec);
        info!(command = %invocation, "Running builder");
        if let Err(err) = run_checked(self.runner, &invocation) {
            if fs::symlink_metadata(&artifact_path).is_ok() {
                warn!(path = %artifact_path.display(), "Discarding output of failed build");
                if let Err(cleanup) = fs::remove_file(&artifact_path) {
                    warn!(
                        path = %artifact_path.display(),
                        error = %cleanup,
                        "Failed to discard output of failed build"
                    );
                    return Err(err.append_diagnostic(format!(
                        "Partial output left at {}: {cleanup}",
                        artifact_path.display()
                    )));
                }
            }
            return Err(err);
        }

        if spec.mode == BundleMode::Onedir {
            let bundle = self.resolve(&spec.bundle_dir());
            if !bundle.is_dir() {
                return Err(StageError::tool(format!(
                    "Builder reported success but {} was not produced",
                    bundle.display()
                )));
            }
            archive_dir(&bundle, &artifact_path)?;
        }

        verify_artifact(&artifact_path)
    }
}

/// A file left at the artifact path by an earlier run must not be mistaken
/// for this run's output.
fn remove_stale(path: &Path) -> Result<(), StageError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(StageError::configuration(
            "build.name",
            format!("{} is a directory, expected the artifact file", path.display()),
        )),
        Ok(_) => {
            warn!(path = %path.display(), "Removing stale artifact");
            fs::remove_file(path).map_err(|err| {
                StageError::tool(format!("Cannot remove stale {}: {err}", path.display()))
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StageError::tool(format!(
            "Cannot inspect {}: {err}",
            path.display()
        ))),
    }
}

fn verify_artifact(path: &Path) -> Result<Artifact, StageError> {
    let meta = fs::metadata(path).map_err(|err| {
        StageError::tool(format!(
            "Builder reported success but {} is missing: {err}",
            path.display()
        ))
    })?;
    if !meta.is_file() {
        return Err(StageError::tool(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(StageError::tool(format!("{} is empty", path.display())));
    }
    let sha256 = compute_sha256(path).map_err(|err| StageError::tool(format!("{err:#}")))?;
    Ok(Artifact {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        sha256,
    })
}

/// Zip `dir` into `dest`, with entries rooted at the directory's own name.
fn archive_dir(dir: &Path, dest: &Path) -> Result<(), StageError> {
    let fail = |err: String| {
        StageError::tool(format!("Failed to archive {}: {err}", dir.display()))
    };
    let prefix = dir.parent().unwrap_or(dir);
    let file = File::create(dest).map_err(|err| fail(err.to_string()))?;
    let mut writer = ZipWriter::new(file);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| fail(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(prefix)
            .map_err(|err| fail(err.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(name, base.clone())
                .map_err(|err| fail(err.to_string()))?;
            continue;
        }
        let options = file_options(base.clone(), entry.path());
        writer
            .start_file(name, options)
            .map_err(|err| fail(err.to_string()))?;
        let mut source = File::open(entry.path()).map_err(|err| fail(err.to_string()))?;
        io::copy(&mut source, &mut writer).map_err(|err| fail(err.to_string()))?;
    }
    writer.finish().map_err(|err| fail(err.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn file_options(base: SimpleFileOptions, path: &Path) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => base.unix_permissions(meta.permissions().mode()),
        Err(_) => base,
    }
}

#[cfg(not(unix))]
fn file_options(base: SimpleFileOptions, _path: &Path) -> SimpleFileOptions {
    base
}

pub(crate) struct PackageStage {
    spec: BuildSpec,
    runner: Arc<dyn ToolRunner>,
}

impl PackageStage {
    pub(crate) fn from_params(params: StageParameters, services: &StageServices) -> Result<Self> {
        reject_unknown(params, "package")?;
        Ok(Self {
            spec: services.build.clone(),
            runner: services.runner.clone(),
        })
    }
}

impl Stage for PackageStage {
    fn name(&self) -> &'static str {
        "package"
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        let python = PathBuf::from(ctx.require("env.python", self.name())?);
        let packager = Packager::new(self.runner.as_ref(), &python, ctx.workspace());
        let artifact = packager.build(&self.spec)?;
        info!(
            artifact = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            sha256 = artifact.sha256.as_str(),
            "Artifact built"
        );
        Ok(ContextDelta::new()
            .with("package.artifact", artifact.path.display())
            .with("package.sha256", &artifact.sha256)
            .with("package.size_bytes", artifact.size_bytes)
            .with_artifact(artifact))
    }
}
