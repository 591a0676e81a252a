use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{LedgerError, truncate_error_text};
use crate::ledger::run::{RunLedger, RunRecord, StageResult, StageStatus, find_artifact};
use crate::pipeline::{ArtifactSlot, Criticality, Pipeline, RunContext, StageSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Finished in an earlier run; not invoked.
    AlreadyDone { artifact_ref: Option<String> },
    Succeeded {
        attempts: u32,
        artifact_ref: Option<String>,
    },
    Failed {
        attempts: u32,
        error: String,
        retryable: bool,
    },
    /// Cancelled between attempts.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        primary: Option<String>,
        secondary: Option<String>,
        /// Best-effort stages that ended failed.
        degraded: Vec<String>,
    },
    Aborted {
        stage: String,
        attempts: u32,
        error: String,
    },
    Interrupted {
        stage: String,
    },
}

/// Runs stages under the retry policy and keeps the run ledger current:
/// one ledger write per attempt.
pub struct StageExecutor {
    ledger: RunLedger,
    retry: RetryPolicy,
    error_text_limit: usize,
    cancel: CancellationToken,
}

impl StageExecutor {
    pub fn new(ledger: RunLedger, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            retry,
            error_text_limit: 500,
            cancel,
        }
    }

    pub fn with_error_text_limit(mut self, limit: usize) -> Self {
        self.error_text_limit = limit;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn run_pipeline(
        &self,
        record: &RunRecord,
        pipeline: &Pipeline,
    ) -> Result<RunOutcome, LedgerError> {
        let mut ctx = RunContext::from_record(record);
        let mut primary = None;
        let mut secondary = None;
        let mut degraded = Vec::new();

        for spec in pipeline.stages() {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Interrupted {
                    stage: spec.name.clone(),
                });
            }

            let artifact_ref = match self.run_stage(&ctx, spec).await? {
                StageOutcome::AlreadyDone { artifact_ref } => {
                    tracing::info!(run_id = %ctx.run_id, stage = %spec.name, "stage already done; skipping");
                    artifact_ref
                }
                StageOutcome::Succeeded {
                    attempts,
                    artifact_ref,
                } => {
                    tracing::info!(run_id = %ctx.run_id, stage = %spec.name, attempts, "stage succeeded");
                    artifact_ref
                }
                StageOutcome::Failed {
                    attempts, error, ..
                } => match spec.criticality {
                    Criticality::Fatal => {
                        tracing::error!(
                            run_id = %ctx.run_id,
                            stage = %spec.name,
                            attempts,
                            error = %error,
                            "fatal stage failed; aborting run"
                        );
                        return Ok(RunOutcome::Aborted {
                            stage: spec.name.clone(),
                            attempts,
                            error,
                        });
                    }
                    Criticality::BestEffort => {
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            stage = %spec.name,
                            attempts,
                            error = %error,
                            "best-effort stage failed; continuing"
                        );
                        degraded.push(spec.name.clone());
                        continue;
                    }
                },
                StageOutcome::Interrupted => {
                    return Ok(RunOutcome::Interrupted {
                        stage: spec.name.clone(),
                    });
                }
            };

            if let Some(artifact_ref) = artifact_ref {
                match spec.produces {
                    Some(ArtifactSlot::Primary) => primary = Some(artifact_ref.clone()),
                    Some(ArtifactSlot::Secondary) => secondary = Some(artifact_ref.clone()),
                    None => {}
                }
                ctx.artifacts.insert(spec.name.clone(), artifact_ref);
            }
        }

        Ok(RunOutcome::Completed {
            primary,
            secondary,
            degraded,
        })
    }

    pub async fn run_stage(
        &self,
        ctx: &RunContext,
        spec: &StageSpec,
    ) -> Result<StageOutcome, LedgerError> {
        let root = ctx.root.as_path();
        if self
            .ledger
            .is_stage_done(root, &spec.name, spec.verify.as_ref())
            .await?
        {
            let artifact_ref = self.settle_done_stage(root, spec).await?;
            return Ok(StageOutcome::AlreadyDone { artifact_ref });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(
                run_id = %ctx.run_id,
                stage = %spec.name,
                attempt,
                attempts = max_attempts,
                "stage attempt"
            );

            let err = match spec.stage.run(ctx).await {
                Ok(artifact_ref) => {
                    self.ledger
                        .record_stage(
                            root,
                            StageResult::success(
                                &spec.name,
                                attempt,
                                started.elapsed(),
                                artifact_ref.clone(),
                            ),
                        )
                        .await?;
                    return Ok(StageOutcome::Succeeded {
                        attempts: attempt,
                        artifact_ref,
                    });
                }
                Err(err) => err,
            };

            let retryable = err.is_retryable();
            let error = truncate_error_text(&format!("{err}"), self.error_text_limit);
            self.ledger
                .record_stage(
                    root,
                    StageResult::failed(&spec.name, attempt, started.elapsed(), error.clone()),
                )
                .await?;

            if !retryable || attempt >= max_attempts {
                return Ok(StageOutcome::Failed {
                    attempts: attempt,
                    error,
                    retryable,
                });
            }

            let delay = self.retry.delay_after(attempt);
            tracing::warn!(
                run_id = %ctx.run_id,
                stage = %spec.name,
                attempt,
                attempts = max_attempts,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "stage attempt failed; retrying"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(StageOutcome::Interrupted),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Returns the artifact of a done stage. When only the artifact manifest
    /// shows completion, the ledger is brought up to date first.
    async fn settle_done_stage(
        &self,
        root: &Path,
        spec: &StageSpec,
    ) -> Result<Option<String>, LedgerError> {
        let record = self.ledger.load(root).await?;
        if let Some(result) = record.stage(&spec.name)
            && result.status == StageStatus::Success
        {
            return Ok(result.artifact_ref.clone());
        }

        let Some(check) = spec.verify.as_ref() else {
            return Ok(None);
        };
        let artifact_ref = find_artifact(root, check).await;
        self.ledger
            .record_stage(
                root,
                StageResult::success(&spec.name, 0, Duration::ZERO, artifact_ref.clone()),
            )
            .await?;
        tracing::info!(stage = %spec.name, "stage completion found in artifact manifest");
        Ok(artifact_ref)
    }
}
