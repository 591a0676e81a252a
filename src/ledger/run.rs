use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::LedgerError;
use crate::identity::WorkItemKey;
use crate::ledger::{read_json, write_json_atomic};

pub const RUN_RECORD_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub attempt_count: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: StageStatus::Pending,
            attempt_count: 0,
            duration_ms: 0,
            artifact_ref: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn success(
        name: &str,
        attempt_count: u32,
        duration: Duration,
        artifact_ref: Option<String>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            status: StageStatus::Success,
            attempt_count,
            duration_ms: duration_ms(duration),
            artifact_ref,
            error: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(name: &str, attempt_count: u32, duration: Duration, error: String) -> Self {
        Self {
            name: name.to_owned(),
            status: StageStatus::Failed,
            attempt_count,
            duration_ms: duration_ms(duration),
            artifact_ref: None,
            error: Some(error),
            finished_at: Some(Utc::now()),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Stage history of one execution attempt of one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub work_item_key: WorkItemKey,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub root_location: PathBuf,
    pub stages: Vec<StageResult>,
}

impl RunRecord {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Replaces the entry for `result.name`, or appends it if the stage is new.
    pub fn upsert_stage(&mut self, result: StageResult) {
        match self.stages.iter_mut().find(|s| s.name == result.name) {
            Some(existing) => *existing = result,
            None => self.stages.push(result),
        }
    }

    /// First stage in `order` that has not succeeded.
    pub fn first_unfinished<'a>(&self, order: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
        order
            .into_iter()
            .find(|name| self.stage(name).is_none_or(|s| s.status != StageStatus::Success))
    }
}

/// Points a stage's completion at a field of a JSON manifest inside the run
/// root. Some stages are only observably done through their output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactCheck {
    pub file: String,
    pub field: String,
}

/// File-backed run records: `<data_dir>/runs/<run_id>/run.json`.
#[derive(Debug, Clone)]
pub struct RunLedger {
    base_dir: PathBuf,
}

impl RunLedger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn root_for(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn record_path(root: &Path) -> PathBuf {
        root.join(RUN_RECORD_FILE)
    }

    /// Creates a fresh, empty run directory and returns its id and path.
    pub async fn allocate_root(&self) -> Result<(String, PathBuf), LedgerError> {
        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir)
            .await
            .map_err(|err| LedgerError::io(&runs_dir, err))?;

        loop {
            let run_id = new_run_id();
            let root = self.root_for(&run_id);
            match fs::create_dir(&root).await {
                Ok(()) => return Ok((run_id, root)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(LedgerError::io(&root, err)),
            }
        }
    }

    /// Removes a run directory that never committed a stage.
    pub async fn discard_root(&self, root: &Path) -> Result<(), LedgerError> {
        match fs::remove_dir_all(root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LedgerError::io(root, err)),
        }
    }

    pub async fn create(
        &self,
        root: &Path,
        run_id: &str,
        key: &WorkItemKey,
        title: &str,
        author: Option<&str>,
        stage_names: &[&str],
    ) -> Result<RunRecord, LedgerError> {
        let path = Self::record_path(root);
        if fs::try_exists(&path)
            .await
            .map_err(|err| LedgerError::io(&path, err))?
        {
            return Err(LedgerError::AlreadyExists {
                key: run_id.to_owned(),
            });
        }

        let record = RunRecord {
            run_id: run_id.to_owned(),
            work_item_key: key.clone(),
            title: title.to_owned(),
            author: author.map(str::to_owned),
            created_at: Utc::now(),
            root_location: root.to_path_buf(),
            stages: stage_names.iter().map(|n| StageResult::pending(n)).collect(),
        };
        write_json_atomic(&path, &record).await?;
        Ok(record)
    }

    pub async fn load(&self, root: &Path) -> Result<RunRecord, LedgerError> {
        let path = Self::record_path(root);
        read_json(&path)
            .await?
            .ok_or(LedgerError::NotFound { path })
    }

    /// Replaces any earlier result for the stage and persists before returning.
    pub async fn record_stage(
        &self,
        root: &Path,
        result: StageResult,
    ) -> Result<RunRecord, LedgerError> {
        let mut record = self.load(root).await?;
        record.upsert_stage(result);
        write_json_atomic(&Self::record_path(root), &record).await?;
        Ok(record)
    }

    pub async fn is_stage_done(
        &self,
        root: &Path,
        name: &str,
        verify: Option<&ArtifactCheck>,
    ) -> Result<bool, LedgerError> {
        let record = self.load(root).await?;
        if record
            .stage(name)
            .is_some_and(|s| s.status == StageStatus::Success)
        {
            return Ok(true);
        }
        match verify {
            Some(check) => Ok(find_artifact(root, check).await.is_some()),
            None => Ok(false),
        }
    }
}

/// Reads `check.field` from the JSON manifest. A missing manifest, an
/// unparsable one, or an empty value all count as "not produced yet".
pub async fn find_artifact(root: &Path, check: &ArtifactCheck) -> Option<String> {
    let path = root.join(&check.file);
    let manifest: serde_json::Value = match read_json(&path).await {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable artifact manifest");
            return None;
        }
    };

    let pointer = format!("/{}", check.field.replace('.', "/"));
    match manifest.pointer(&pointer)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.trim().to_owned()),
        other => Some(other.to_string()),
    }
}

fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}
