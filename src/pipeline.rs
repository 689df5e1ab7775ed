use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::error::{ErrorKind, StageError};
use crate::observability::MetricsCollector;
use crate::trigger::TriggerEvent;

/// The packaged executable handed from the packager to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string())
    }
}

/// State threaded through the stages. Each stage sees an immutable
/// snapshot; values it produces come back as a [`ContextDelta`] and are
/// merged into a fresh context. Keys written once cannot be rewritten.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    trigger: TriggerEvent,
    workspace: PathBuf,
    values: BTreeMap<String, String>,
    artifact: Option<Artifact>,
}

impl PipelineContext {
    pub fn new(trigger: TriggerEvent, workspace: impl Into<PathBuf>) -> Self {
        Self {
            trigger,
            workspace: workspace.into(),
            values: BTreeMap::new(),
            artifact: None,
        }
    }

    pub fn trigger(&self) -> &TriggerEvent {
        &self.trigger
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a workspace-relative path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// A value an earlier stage was expected to publish.
    pub fn require(&self, key: &str, stage: &str) -> Result<&str, StageError> {
        self.value(key).ok_or_else(|| {
            StageError::configuration(
                format!("pipeline.{stage}"),
                format!("Stage '{stage}' needs '{key}', which no earlier stage produced"),
            )
        })
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn merged(&self, stage: &str, delta: ContextDelta) -> Result<Self, StageError> {
        let mut next = self.clone();
        for (key, value) in delta.values {
            match next.values.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(StageError::configuration(
                        format!("pipeline.{stage}"),
                        format!(
                            "Stage '{stage}' tried to overwrite context value '{key}' ('{existing}' -> '{value}')"
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    next.values.insert(key, value);
                }
            }
        }
        if let Some(artifact) = delta.artifact {
            if next.artifact.is_some() {
                return Err(StageError::configuration(
                    format!("pipeline.{stage}"),
                    format!("Stage '{stage}' produced a second artifact"),
                ));
            }
            next.artifact = Some(artifact);
        }
        Ok(next)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContextDelta {
    values: Vec<(String, String)>,
    artifact: Option<Artifact>,
}

impl ContextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.push((key.into(), value.to_string()));
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Build,
    /// Runs after the artifact exists; a failure here leaves a usable build behind.
    Publish,
}

pub type StageParameters = Map<String, Value>;

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn role(&self) -> StageRole {
        StageRole::Build
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl StageResult {
    fn pending(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            error_kind: None,
            diagnostic: None,
        }
    }

    fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    fn succeed(&mut self) {
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, err: &StageError) {
        self.status = StageStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error_kind = Some(err.kind);
        self.diagnostic = Some(err.render());
    }

    fn skip(&mut self) {
        self.status = StageStatus::Skipped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The artifact was built but could not be published. Only the publish
    /// stage needs to be repeated.
    PartialSuccess,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::PartialSuccess
        )
    }

    /// Process exit code reported to automation callers.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::PartialSuccess => 2,
            RunStatus::Pending | RunStatus::Running | RunStatus::Failed => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub context: BTreeMap<String, String>,
}

impl PipelineRun {
    fn new<'a>(trigger: TriggerEvent, stage_names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            trigger,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            stages: stage_names.into_iter().map(StageResult::pending).collect(),
            artifact: None,
            failure: None,
            context: BTreeMap::new(),
        }
    }

    fn finish(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        debug_assert!(!self.status.is_terminal(), "run finished twice");
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct PipelineExecutor {
    stages: Vec<Box<dyn Stage>>,
    workspace: PathBuf,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Box<dyn Stage>>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            stages,
            workspace: workspace.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Execute every stage in order, stopping at the first failure.
    #[instrument(skip(self, trigger), fields(tag = %trigger.tag))]
    pub fn run(&self, trigger: TriggerEvent) -> PipelineRun {
        self.metrics.reset();
        let total_start = Instant::now();
        let mut run = PipelineRun::new(trigger.clone(), self.stage_names());
        let mut ctx = PipelineContext::new(trigger, self.workspace.clone());
        run.status = RunStatus::Running;
        info!(stages = self.stages.len(), "Pipeline started");

        let mut outcome = RunStatus::Succeeded;
        for (idx, stage) in self.stages.iter().enumerate() {
            if outcome != RunStatus::Succeeded {
                run.stages[idx].skip();
                warn!(stage = stage.name(), "Stage skipped");
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = stage.name());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(stage.name());
            run.stages[idx].start();
            info!("Stage started");

            match stage
                .execute(&ctx)
                .and_then(|delta| ctx.merged(stage.name(), delta))
            {
                Ok(next) => {
                    ctx = next;
                    if run.artifact.is_none() {
                        run.artifact = ctx.artifact().cloned();
                    }
                    run.stages[idx].succeed();
                    info!("Stage succeeded");
                }
                Err(err) => {
                    self.metrics.record_stage_failure(stage.name());
                    run.stages[idx].fail(&err);
                    error!(kind = %err.kind, attempts = err.attempts, "{}", err.render());
                    outcome = if stage.role() == StageRole::Publish && ctx.artifact().is_some() {
                        RunStatus::PartialSuccess
                    } else {
                        RunStatus::Failed
                    };
                    run.failure = Some(FailureSummary {
                        stage: stage.name().to_string(),
                        kind: err.kind,
                        message: err.message.clone(),
                        attempts: err.attempts,
                    });
                }
            }
        }

        run.context = ctx.values().clone();
        run.finish(outcome);
        self.metrics.record_total_duration(total_start.elapsed());
        self.metrics.record_run(outcome);
        match outcome {
            RunStatus::Succeeded => info!("Pipeline succeeded"),
            RunStatus::PartialSuccess => warn!(
                "Artifact built but not published; re-run only the publish stage"
            ),
            _ => error!("Pipeline failed"),
        }
        run
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }
}

pub fn build_pipeline(
    stage_registry: &StageRegistry,
    stage_specs: &[StageSpec],
    workspace: impl Into<PathBuf>,
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(stage_specs.len());
    for spec in stage_specs {
        let params = spec.params.clone().unwrap_or_default();
        let stage = stage_registry.create(&spec.stage, params)?;
        stages.push(stage);
    }
    Ok(PipelineExecutor::new(stages, workspace))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn named(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            params: None,
        }
    }
}
