use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bookreel::error::StageError;
use bookreel::ledger::book::JsonFileBookLedger;
use bookreel::ledger::run::RunLedger;
use bookreel::pipeline::executor::RetryPolicy;
use bookreel::pipeline::{ArtifactSlot, Criticality, Pipeline, RunContext, Stage, StageSpec};
use bookreel::scheduler::{BatchScheduler, SchedulerOptions};
use tokio_util::sync::CancellationToken;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Option<&'static str>),
    Transient(&'static str),
    Fatal(&'static str),
}

/// Plays back `script` one step per call, then repeats `fallback`.
pub struct ScriptedStage {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<String>>,
    cancel_on_call: Option<CancellationToken>,
}

#[allow(dead_code)]
impl ScriptedStage {
    pub fn ok(artifact: Option<&'static str>) -> Arc<Self> {
        Self::scripted(Vec::new(), Step::Ok(artifact))
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::scripted(Vec::new(), step)
    }

    pub fn scripted(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            cancel_on_call: None,
        })
    }

    /// Succeeds, but cancels `token` while running.
    pub fn cancelling(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Ok(None),
            calls: Mutex::new(Vec::new()),
            cancel_on_call: Some(token),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn calls_for(&self, title: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|t| t.as_str() == title)
            .count()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn run(&self, ctx: &RunContext) -> Result<Option<String>, StageError> {
        self.calls.lock().expect("calls lock").push(ctx.title.clone());
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Ok(artifact) => Ok(artifact.map(str::to_owned)),
            Step::Transient(msg) => Err(StageError::transient(anyhow::anyhow!(msg))),
            Step::Fatal(msg) => Err(StageError::fatal(anyhow::anyhow!(msg))),
        }
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub book: Arc<JsonFileBookLedger>,
    pub runs: RunLedger,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_secondary_required(true)
    }

    pub fn with_secondary_required(required: bool) -> anyhow::Result<Self> {
        let temp = tempfile::TempDir::new()?;
        let book = Arc::new(JsonFileBookLedger::new(temp.path()).with_secondary_required(required));
        let runs = RunLedger::new(temp.path());
        Ok(Self { temp, book, runs })
    }

    pub fn scheduler(&self, pipeline: Pipeline) -> BatchScheduler {
        self.scheduler_with(pipeline, options(3, false), CancellationToken::new())
    }

    pub fn scheduler_with(
        &self,
        pipeline: Pipeline,
        options: SchedulerOptions,
        cancel: CancellationToken,
    ) -> BatchScheduler {
        BatchScheduler::new(self.book.clone(), self.runs.clone(), pipeline, options, cancel)
    }

    /// Number of run directories on disk.
    pub fn run_dirs(&self) -> anyhow::Result<usize> {
        let dir = self.runs.runs_dir();
        if !dir.exists() {
            return Ok(0);
        }
        Ok(std::fs::read_dir(dir)?.count())
    }
}

/// No backoff and no inter-item delay.
pub fn options(max_attempts: u32, force: bool) -> SchedulerOptions {
    SchedulerOptions {
        force,
        item_delay: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        error_text_limit: 500,
    }
}

/// The stages a typical batch test cares about, in pipeline order.
#[allow(dead_code)]
pub struct Stages {
    pub search: Arc<ScriptedStage>,
    pub render: Arc<ScriptedStage>,
    pub thumbnail: Arc<ScriptedStage>,
    pub upload: Arc<ScriptedStage>,
    pub upload_short: Arc<ScriptedStage>,
}

#[allow(dead_code)]
impl Stages {
    pub fn happy() -> Self {
        Self {
            search: ScriptedStage::ok(None),
            render: ScriptedStage::ok(Some("video.mp4")),
            thumbnail: ScriptedStage::ok(Some("thumb.png")),
            upload: ScriptedStage::ok(Some("vid-long")),
            upload_short: ScriptedStage::ok(Some("vid-short")),
        }
    }

    pub fn pipeline(&self) -> anyhow::Result<Pipeline> {
        Pipeline::new(vec![
            StageSpec::new("search", Criticality::Fatal, self.search.clone()),
            StageSpec::new("render", Criticality::Fatal, self.render.clone()),
            StageSpec::new("thumbnail", Criticality::BestEffort, self.thumbnail.clone()),
            StageSpec::new("upload", Criticality::Fatal, self.upload.clone())
                .produces(ArtifactSlot::Primary),
            StageSpec::new("upload_short", Criticality::BestEffort, self.upload_short.clone())
                .produces(ArtifactSlot::Secondary),
        ])
    }
}
