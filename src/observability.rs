use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::RunStatus;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_partial: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_stage_failure(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage_name.to_string())
                .or_default()
                .failures += 1;
        }
    }

    pub fn record_run(&self, status: RunStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                RunStatus::Succeeded => guard.runs_succeeded += 1,
                RunStatus::PartialSuccess => guard.runs_partial += 1,
                RunStatus::Failed => guard.runs_failed += 1,
                RunStatus::Pending | RunStatus::Running => {}
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        runs_partial = snapshot.runs_partial,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP tagpipe_runs_total Pipeline runs by terminal status\n");
        output.push_str("# TYPE tagpipe_runs_total counter\n");
        for (status, count) in [
            ("succeeded", self.runs_succeeded),
            ("failed", self.runs_failed),
            ("partial_success", self.runs_partial),
        ] {
            output.push_str(&format!(
                "tagpipe_runs_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        output.push_str("# HELP tagpipe_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE tagpipe_stage_calls_total counter\n");
        output.push_str("# HELP tagpipe_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE tagpipe_stage_failures_total counter\n");
        output.push_str(
            "# HELP tagpipe_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE tagpipe_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP tagpipe_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE tagpipe_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "tagpipe_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "tagpipe_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "tagpipe_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "tagpipe_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP tagpipe_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE tagpipe_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "tagpipe_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
