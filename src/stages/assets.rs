use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use crate::error::StageError;
use crate::pipeline::{ContextDelta, PipelineContext, Stage, StageParameters};

use super::{StageServices, reject_unknown, take_string_list};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub created: bool,
}

/// Make sure `path` is a directory, creating it and any missing parents.
///
/// An existing directory is the expected case and reports `created: false`.
/// A file (or other non-directory) at `path` or at one of its parents is a
/// naming collision and is reported, never papered over.
pub fn ensure(path: &Path) -> Result<EnsureOutcome, StageError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            debug!(path = %path.display(), "Directory already present");
            Ok(EnsureOutcome { created: false })
        }
        Ok(_) => Err(collision(path)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => match fs::create_dir_all(path) {
            Ok(()) => {
                info!(path = %path.display(), "Directory created");
                Ok(EnsureOutcome { created: true })
            }
            // Created concurrently between the check and the create.
            Err(_) if path.is_dir() => Ok(EnsureOutcome { created: false }),
            Err(err) => Err(StageError::configuration(
                "assets",
                format!("Cannot create directory {}: {err}", path.display()),
            )),
        },
        Err(err) => Err(StageError::configuration(
            "assets",
            format!("Cannot inspect {}: {err}", path.display()),
        )),
    }
}

fn collision(path: &Path) -> StageError {
    StageError::configuration(
        "assets",
        format!(
            "{} exists but is not a directory",
            path.display()
        ),
    )
}

pub(crate) struct StageAssetsStage {
    paths: Vec<PathBuf>,
}

impl StageAssetsStage {
    pub(crate) fn from_params(mut params: StageParameters, services: &StageServices) -> Result<Self> {
        let mut paths = services.assets.clone();
        paths.extend(take_string_list(&mut params, "paths")?.into_iter().map(PathBuf::from));
        reject_unknown(params, "stage-assets")?;
        Ok(Self { paths })
    }
}

impl Stage for StageAssetsStage {
    fn name(&self) -> &'static str {
        "stage-assets"
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        if self.paths.is_empty() {
            info!("No asset directories configured");
        }
        let mut created = Vec::new();
        for path in &self.paths {
            let resolved = ctx.resolve(path);
            if ensure(&resolved)?.created {
                created.push(path.display().to_string());
            }
        }
        let staged: Vec<_> = self.paths.iter().map(|p| p.display().to_string()).collect();
        Ok(ContextDelta::new()
            .with("assets.staged", staged.join(","))
            .with("assets.created", created.join(",")))
    }
}
