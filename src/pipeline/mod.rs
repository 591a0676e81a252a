pub mod command;
pub mod executor;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::ledger::run::{ArtifactCheck, RunRecord, StageStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Exhausting retries aborts the run.
    Fatal,
    /// Exhausting retries is logged and the pipeline moves on.
    BestEffort,
}

/// Which book-ledger artifact a stage's output feeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSlot {
    Primary,
    Secondary,
}

/// What a stage sees of the run it belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub root: PathBuf,
    pub title: String,
    pub author: Option<String>,
    /// Artifact refs of stages that already succeeded, by stage name.
    pub artifacts: BTreeMap<String, String>,
}

impl RunContext {
    pub fn from_record(record: &RunRecord) -> Self {
        let artifacts = record
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Success)
            .filter_map(|s| Some((s.name.clone(), s.artifact_ref.clone()?)))
            .collect();
        Self {
            run_id: record.run_id.clone(),
            root: record.root_location.clone(),
            title: record.title.clone(),
            author: record.author.clone(),
            artifacts,
        }
    }
}

/// One external step of the pipeline. Must tolerate being invoked again for
/// the same run after a failed attempt.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Returns the produced artifact reference, or `None` when the stage
    /// succeeded without one.
    async fn run(&self, ctx: &RunContext) -> Result<Option<String>, StageError>;
}

#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub criticality: Criticality,
    pub produces: Option<ArtifactSlot>,
    pub verify: Option<ArtifactCheck>,
    pub stage: Arc<dyn Stage>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, criticality: Criticality, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            criticality,
            produces: None,
            verify: None,
            stage,
        }
    }

    pub fn produces(mut self, slot: ArtifactSlot) -> Self {
        self.produces = Some(slot);
        self
    }

    pub fn verified_by(mut self, check: ArtifactCheck) -> Self {
        self.verify = Some(check);
        self
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .field("produces", &self.produces)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

/// The fixed, ordered stage sequence every work item goes through.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageSpec>) -> anyhow::Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("pipeline has no stages");
        }

        let mut seen = HashSet::new();
        for spec in &stages {
            if spec.name.trim().is_empty() {
                anyhow::bail!("stage name must not be empty");
            }
            if !seen.insert(spec.name.as_str()) {
                anyhow::bail!("duplicate stage name: {}", spec.name);
            }
        }
        if !stages.iter().any(|s| s.produces == Some(ArtifactSlot::Primary)) {
            anyhow::bail!("no stage produces the primary artifact");
        }
        for slot in [ArtifactSlot::Primary, ArtifactSlot::Secondary] {
            let producers = stages.iter().filter(|s| s.produces == Some(slot)).count();
            if producers > 1 {
                anyhow::bail!("more than one stage produces the {slot:?} artifact");
            }
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn produces(&self, slot: ArtifactSlot) -> bool {
        self.stages.iter().any(|s| s.produces == Some(slot))
    }
}
