pub mod report;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{LedgerError, truncate_error_text};
use crate::identity::{WorkItemKey, normalize};
use crate::ledger::book::{BookLedger, BookLedgerEntry, BookStatus};
use crate::ledger::run::{RunLedger, RunRecord};
use crate::pipeline::Pipeline;
use crate::pipeline::executor::{RetryPolicy, RunOutcome, StageExecutor};
use crate::reconcile::{ListingSource, ReconcileReport, TitleTemplate, reconcile};

/// One requested work item, as given by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl WorkRequest {
    pub fn new(title: impl Into<String>, author: Option<&str>) -> Self {
        Self {
            title: title.into(),
            author: author.map(str::to_owned),
        }
    }

    pub fn key(&self) -> WorkItemKey {
        normalize(&self.title, self.author.as_deref())
    }

    pub fn label(&self) -> String {
        match self.author.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(author) => format!("{} ({author})", self.title.trim()),
            None => self.title.trim().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Resume,
    Process,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Resume => "resume",
            Self::Process => "process",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub request: WorkRequest,
    pub current_status: Option<BookStatus>,
    pub action: Action,
    pub detail: String,
}

/// Read-only classification of a whole batch, shown before anything runs.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub items: Vec<PlannedItem>,
}

impl BatchPlan {
    pub fn count(&self, action: Action) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed {
        run_id: String,
        primary: Option<String>,
        secondary: Option<String>,
        degraded: Vec<String>,
    },
    Resumed {
        run_id: String,
        primary: Option<String>,
        secondary: Option<String>,
        degraded: Vec<String>,
    },
    Failed {
        run_id: Option<String>,
        stage: Option<String>,
        attempts: u32,
        error: String,
    },
    Skipped {
        reason: String,
        primary: Option<String>,
        secondary: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub request: WorkRequest,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub items: Vec<ItemReport>,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn processed(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Processed { .. }))
    }

    pub fn resumed(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Resumed { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Skipped { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Reprocess items whose ledger entry is already done.
    pub force: bool,
    pub item_delay: Duration,
    pub retry: RetryPolicy,
    pub error_text_limit: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            force: false,
            item_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            error_text_limit: 500,
        }
    }
}

/// How a fresh run claims its book-ledger entry.
enum Claim {
    New,
    Reopen(WorkItemKey),
}

/// Drives a batch of work items through the pipeline, one at a time.
pub struct BatchScheduler {
    book: Arc<dyn BookLedger>,
    runs: RunLedger,
    pipeline: Pipeline,
    executor: StageExecutor,
    listing: Option<(Arc<dyn ListingSource>, TitleTemplate)>,
    options: SchedulerOptions,
    cancel: CancellationToken,
}

impl BatchScheduler {
    pub fn new(
        book: Arc<dyn BookLedger>,
        runs: RunLedger,
        pipeline: Pipeline,
        options: SchedulerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let executor = StageExecutor::new(runs.clone(), options.retry, cancel.clone())
            .with_error_text_limit(options.error_text_limit);
        Self {
            book,
            runs,
            pipeline,
            executor,
            listing: None,
            options,
            cancel,
        }
    }

    pub fn with_listing(mut self, source: Arc<dyn ListingSource>, template: TitleTemplate) -> Self {
        self.listing = Some((source, template));
        self
    }

    /// Rebuilds an empty book ledger from the external listing. Reconciliation
    /// failures only degrade duplicate detection; an unreadable ledger is an
    /// error.
    pub async fn prepare(&self) -> anyhow::Result<Option<ReconcileReport>> {
        if !self.book.is_empty().await.context("read book ledger")? {
            return Ok(None);
        }
        let Some((source, template)) = &self.listing else {
            tracing::warn!("book ledger is empty and no listing source is configured; duplicate detection is degraded");
            return Ok(None);
        };

        match reconcile(self.book.as_ref(), source.as_ref(), template).await {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "reconciliation failed; duplicate detection is degraded for this run");
                Ok(None)
            }
        }
    }

    pub async fn plan(&self, requests: &[WorkRequest]) -> Result<BatchPlan, LedgerError> {
        let mut plan = BatchPlan::default();
        let mut claimed: Vec<(WorkItemKey, usize)> = Vec::new();

        for (idx, request) in requests.iter().enumerate() {
            let key = request.key();
            if let Some((_, first)) = claimed.iter().find(|(k, _)| k.matches(&key)) {
                let current_status = self
                    .book
                    .lookup(&request.title, request.author.as_deref())
                    .await?
                    .map(|e| e.status);
                plan.items.push(PlannedItem {
                    request: request.clone(),
                    current_status,
                    action: Action::Skip,
                    detail: format!("duplicate of item #{}", first + 1),
                });
                continue;
            }

            let item = self.classify(request).await?;
            if item.action != Action::Skip {
                claimed.push((key, idx));
            }
            plan.items.push(item);
        }
        Ok(plan)
    }

    pub async fn classify(&self, request: &WorkRequest) -> Result<PlannedItem, LedgerError> {
        let entry = self
            .book
            .lookup(&request.title, request.author.as_deref())
            .await?;
        let current_status = entry.as_ref().map(|e| e.status.clone());

        let (action, detail) = match entry {
            None => (Action::Process, "new".to_owned()),
            Some(entry) => match entry.status.clone() {
                BookStatus::Done if !self.options.force => (
                    Action::Skip,
                    format!(
                        "already done ({})",
                        entry.primary_artifact_id.as_deref().unwrap_or("no artifact id")
                    ),
                ),
                BookStatus::Done => (Action::Process, "forced reprocess".to_owned()),
                BookStatus::Processing => (Action::Resume, self.resume_detail(&entry).await),
                BookStatus::Failed | BookStatus::Unknown(_) => (
                    Action::Process,
                    format!("previous status {}; reprocessing", entry.status.as_str()),
                ),
            },
        };

        Ok(PlannedItem {
            request: request.clone(),
            current_status,
            action,
            detail,
        })
    }

    async fn resume_detail(&self, entry: &BookLedgerEntry) -> String {
        let Some(run_ref) = entry.run_ref.as_deref() else {
            return "no run recorded; fresh run".to_owned();
        };
        match self.runs.load(&self.runs.root_for(run_ref)).await {
            Ok(record) => match record.first_unfinished(self.pipeline.stage_names()) {
                Some(stage) => format!("run {run_ref} from {stage}"),
                None => format!("run {run_ref} (all stages done)"),
            },
            Err(err) if err.is_not_found() => format!("run {run_ref} missing; fresh run"),
            Err(err) => format!("run {run_ref} unreadable: {err}"),
        }
    }

    /// Executes a plan in order. Never fails as a whole: every item ends up in
    /// the summary, including those left unstarted by cancellation.
    pub async fn execute(&self, plan: BatchPlan) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut ran_previous = false;
        let total = plan.items.len();

        for (idx, planned) in plan.items.into_iter().enumerate() {
            let request = planned.request;
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                summary.items.push(ItemReport {
                    request,
                    outcome: interrupted_skip(),
                });
                continue;
            }

            if planned.action == Action::Skip {
                let existing = match self.book.lookup(&request.title, request.author.as_deref()).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(item = %request.label(), error = %err, "could not read artifact refs for skipped item");
                        None
                    }
                };
                let (primary, secondary) = existing
                    .map(|e| (e.primary_artifact_id, e.secondary_artifact_id))
                    .unwrap_or_default();
                tracing::info!(item = %request.label(), reason = %planned.detail, "skipping");
                summary.items.push(ItemReport {
                    request,
                    outcome: ItemOutcome::Skipped {
                        reason: planned.detail,
                        primary,
                        secondary,
                    },
                });
                continue;
            }

            if ran_previous && !self.options.item_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        summary.interrupted = true;
                        summary.items.push(ItemReport {
                            request,
                            outcome: interrupted_skip(),
                        });
                        continue;
                    }
                    () = tokio::time::sleep(self.options.item_delay) => {}
                }
            }

            tracing::info!(item = %request.label(), position = idx + 1, total, "starting item");
            let outcome = match self.run_item(&request).await {
                Ok(outcome) => outcome,
                Err(err) => ItemOutcome::Failed {
                    run_id: None,
                    stage: None,
                    attempts: 0,
                    error: truncate_error_text(&format!("{err:#}"), self.options.error_text_limit),
                },
            };
            ran_previous = true;
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
            }
            summary.items.push(ItemReport { request, outcome });
        }

        summary
    }

    /// Reconcile if needed, classify everything, then execute.
    pub async fn run_batch(&self, requests: &[WorkRequest]) -> anyhow::Result<BatchSummary> {
        self.prepare().await?;
        let plan = self.plan(requests).await.context("classify batch")?;
        Ok(self.execute(plan).await)
    }

    async fn run_item(&self, request: &WorkRequest) -> anyhow::Result<ItemOutcome> {
        // Re-check: an earlier item or another writer may have changed the
        // entry since the plan was made.
        let entry = self
            .book
            .lookup(&request.title, request.author.as_deref())
            .await
            .context("look up work item")?;

        match entry {
            None => self.start_fresh(request, Claim::New).await,
            Some(entry) => match entry.status.clone() {
                BookStatus::Done if !self.options.force => Ok(ItemOutcome::Skipped {
                    reason: "already done".to_owned(),
                    primary: entry.primary_artifact_id,
                    secondary: entry.secondary_artifact_id,
                }),
                BookStatus::Done | BookStatus::Unknown(_) => {
                    self.start_fresh(request, Claim::Reopen(entry.key)).await
                }
                BookStatus::Failed => self.start_fresh(request, Claim::New).await,
                BookStatus::Processing => self.resume(request, entry).await,
            },
        }
    }

    async fn resume(
        &self,
        request: &WorkRequest,
        entry: BookLedgerEntry,
    ) -> anyhow::Result<ItemOutcome> {
        let Some(run_ref) = entry.run_ref.as_deref() else {
            return self.start_fresh(request, Claim::Reopen(entry.key)).await;
        };

        let root = self.runs.root_for(run_ref);
        match self.runs.load(&root).await {
            Ok(record) => {
                tracing::info!(item = %request.label(), run_id = %record.run_id, "resuming run");
                self.execute_run(entry.key, record, true).await
            }
            Err(err) if err.is_not_found() => {
                tracing::warn!(item = %request.label(), run_id = run_ref, "run record missing; starting a fresh run");
                self.start_fresh(request, Claim::Reopen(entry.key)).await
            }
            Err(err) => Err(err).with_context(|| format!("load run record {run_ref}")),
        }
    }

    async fn start_fresh(&self, request: &WorkRequest, claim: Claim) -> anyhow::Result<ItemOutcome> {
        let (run_id, root) = self.runs.allocate_root().await.context("allocate run dir")?;

        let claimed = match claim {
            Claim::New => {
                self.book
                    .begin_processing(&request.title, request.author.as_deref(), &run_id)
                    .await
            }
            Claim::Reopen(key) => self.book.reopen(&key, &run_id).await,
        };
        let entry = match claimed {
            Ok(entry) => entry,
            Err(err) => {
                self.runs
                    .discard_root(&root)
                    .await
                    .context("discard unused run dir")?;
                if let LedgerError::AlreadyExists { .. } = err {
                    return Ok(ItemOutcome::Skipped {
                        reason: "already in ledger".to_owned(),
                        primary: None,
                        secondary: None,
                    });
                }
                return Err(err).context("claim work item");
            }
        };

        let record = self
            .runs
            .create(
                &root,
                &run_id,
                &entry.key,
                request.title.trim(),
                request.author.as_deref().map(str::trim),
                &self.pipeline.stage_names(),
            )
            .await
            .context("create run record")?;
        tracing::info!(item = %request.label(), run_id = %run_id, "started fresh run");
        self.execute_run(entry.key, record, false).await
    }

    async fn execute_run(
        &self,
        key: WorkItemKey,
        record: RunRecord,
        resumed: bool,
    ) -> anyhow::Result<ItemOutcome> {
        let run_id = record.run_id.clone();
        let outcome = self
            .executor
            .run_pipeline(&record, &self.pipeline)
            .await
            .context("run pipeline")?;

        match outcome {
            RunOutcome::Completed {
                primary,
                secondary,
                degraded,
            } => {
                let entry = self
                    .book
                    .complete(&key, primary.as_deref(), secondary.as_deref())
                    .await
                    .context("complete work item")?;
                if entry.status != BookStatus::Done {
                    let missing = missing_artifacts(&entry, &self.pipeline);
                    return Ok(ItemOutcome::Failed {
                        run_id: Some(run_id),
                        stage: None,
                        attempts: 0,
                        error: format!("missing {missing}; will resume"),
                    });
                }

                let primary = entry.primary_artifact_id;
                let secondary = entry.secondary_artifact_id;
                Ok(if resumed {
                    ItemOutcome::Resumed {
                        run_id,
                        primary,
                        secondary,
                        degraded,
                    }
                } else {
                    ItemOutcome::Processed {
                        run_id,
                        primary,
                        secondary,
                        degraded,
                    }
                })
            }
            RunOutcome::Aborted {
                stage,
                attempts,
                error,
            } => {
                self.book
                    .mark_failed(&key)
                    .await
                    .context("mark work item failed")?;
                Ok(ItemOutcome::Failed {
                    run_id: Some(run_id),
                    stage: Some(stage),
                    attempts,
                    error,
                })
            }
            RunOutcome::Interrupted { stage } => Ok(ItemOutcome::Skipped {
                reason: format!("interrupted at {stage}; run {run_id} will resume"),
                primary: None,
                secondary: None,
            }),
        }
    }
}

fn interrupted_skip() -> ItemOutcome {
    ItemOutcome::Skipped {
        reason: "interrupted".to_owned(),
        primary: None,
        secondary: None,
    }
}

fn missing_artifacts(entry: &BookLedgerEntry, pipeline: &Pipeline) -> String {
    use crate::pipeline::ArtifactSlot;

    let mut missing = Vec::new();
    if entry.primary_artifact_id.is_none() {
        missing.push("primary artifact");
    }
    if pipeline.produces(ArtifactSlot::Secondary) && entry.secondary_artifact_id.is_none() {
        missing.push("secondary artifact");
    }
    if missing.is_empty() {
        "artifacts".to_owned()
    } else {
        missing.join(" and ")
    }
}
