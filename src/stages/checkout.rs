use std::fs;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::error::StageError;
use crate::pipeline::{ContextDelta, PipelineContext, Stage, StageParameters};
use crate::process::{Invocation, ToolRunner, run_checked};

use super::{StageServices, reject_unknown, take_bool};

/// Shortest abbreviated hash accepted as a revision, matching git's default.
const MIN_ABBREV_LEN: usize = 7;

/// Either side may be abbreviated, but never below `MIN_ABBREV_LEN`.
fn revision_matches(head: &str, revision: &str) -> bool {
    let (shorter, longer) = if head.len() <= revision.len() {
        (head, revision)
    } else {
        (revision, head)
    };
    shorter.len() >= MIN_ABBREV_LEN
        && longer
            .get(..shorter.len())
            .is_some_and(|start| start.eq_ignore_ascii_case(shorter))
}

/// Confirms the workspace is present and, for git checkouts, that `HEAD`
/// is the revision the tag was pushed at.
pub(crate) struct CheckoutStage {
    verify_revision: bool,
    runner: Arc<dyn ToolRunner>,
}

impl CheckoutStage {
    pub(crate) fn from_params(mut params: StageParameters, services: &StageServices) -> Result<Self> {
        let verify_revision = take_bool(&mut params, "verify_revision")?.unwrap_or(true);
        reject_unknown(params, "checkout")?;
        Ok(Self {
            verify_revision,
            runner: services.runner.clone(),
        })
    }
}

impl Stage for CheckoutStage {
    fn name(&self) -> &'static str {
        "checkout"
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        let root = ctx.workspace();
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StageError::configuration(
                    "workspace",
                    format!("{} is not a directory", root.display()),
                ));
            }
            Err(err) => {
                return Err(StageError::configuration(
                    "workspace",
                    format!("Workspace {} is not accessible: {err}", root.display()),
                ));
            }
        }

        let mut delta = ContextDelta::new().with("source.root", root.display());
        let Some(revision) = ctx.trigger().revision.as_deref() else {
            return Ok(delta);
        };
        delta = delta.with("source.revision", revision);

        if !self.verify_revision {
            return Ok(delta);
        }
        if !root.join(".git").exists() {
            warn!("Workspace is not a git checkout; revision not verified");
            return Ok(delta);
        }
        let Some(git) = self.runner.locate("git") else {
            warn!("git not found on PATH; revision not verified");
            return Ok(delta);
        };

        if revision.len() < MIN_ABBREV_LEN {
            return Err(StageError::configuration(
                "trigger.revision",
                format!(
                    "Revision '{revision}' is too short to identify a commit (need {MIN_ABBREV_LEN}+ characters)"
                ),
            ));
        }

        let output = run_checked(
            self.runner.as_ref(),
            &Invocation::new(git)
                .args(["rev-parse", "HEAD"])
                .current_dir(root),
        )?;
        let head = output.stdout.trim();
        if !revision_matches(head, revision) {
            return Err(StageError::configuration(
                "trigger.revision",
                format!("Workspace HEAD is {head}, but the tag points at {revision}"),
            ));
        }
        info!(head, "Workspace matches triggering revision");
        Ok(delta.with("source.head", head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::ToolOutput;
    use crate::trigger::TriggerEvent;
    use std::io;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct FixedHead(&'static str);

    impl ToolRunner for FixedHead {
        fn run(&self, _: &Invocation) -> io::Result<ToolOutput> {
            Ok(ToolOutput::success(format!("{}\n", self.0)))
        }

        fn locate(&self, program: &str) -> Option<PathBuf> {
            Some(PathBuf::from(program))
        }
    }

    fn context(workspace: &std::path::Path, revision: &str) -> PipelineContext {
        let trigger = TriggerEvent {
            tag: "v1.0.0".into(),
            revision: Some(revision.into()),
            actor: None,
        };
        PipelineContext::new(trigger, workspace)
    }

    fn stage(head: &'static str) -> CheckoutStage {
        CheckoutStage {
            verify_revision: true,
            runner: Arc::new(FixedHead(head)),
        }
    }

    #[test]
    fn head_must_match_tagged_revision() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();

        let delta = stage("4f2a9c1e").execute(&context(temp.path(), "4f2a9c1")).unwrap();
        let ctx = context(temp.path(), "4f2a9c1").merged("checkout", delta).unwrap();
        assert_eq!(ctx.value("source.head"), Some("4f2a9c1e"));

        let err = stage("b7d0e33")
            .execute(&context(temp.path(), "4f2a9c1"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("b7d0e33"));
    }

    #[test]
    fn abbreviated_revisions_need_seven_characters() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();

        let err = stage("4f2a9c1e")
            .execute(&context(temp.path(), "4"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(err.field.as_deref(), Some("trigger.revision"));

        assert!(revision_matches("4F2A9C1E", "4f2a9c1"));
        assert!(!revision_matches("4f2a9c", "4f2a9c1e"));
        assert!(!revision_matches("", "4f2a9c1e"));
    }

    #[test]
    fn missing_workspace_is_a_configuration_error() {
        let temp = tempdir().unwrap();
        let err = stage("unused")
            .execute(&context(&temp.path().join("gone"), "abc"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
