use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::ledger::run::ArtifactCheck;
use crate::pipeline::command::CommandStage;
use crate::pipeline::executor::RetryPolicy;
use crate::pipeline::{ArtifactSlot, Criticality, Pipeline, StageSpec};
use crate::reconcile::youtube::YoutubeListingSource;
use crate::reconcile::{ListingSource, TitleTemplate};
use crate::scheduler::SchedulerOptions;

pub const DEFAULT_CONFIG_FILE: &str = "bookreel.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub retry: RetryConfig,
    pub item_delay_secs: u64,
    pub error_text_limit: usize,
    /// Required suffix of published titles during reconciliation.
    pub title_suffix: Option<String>,
    pub stages: Vec<StageConfig>,
    pub listing: Option<ListingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "StageConfig::default_criticality")]
    pub criticality: Criticality,
    /// Program to run; `bookreel-<name>` on `PATH` when omitted.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub produces: Option<ArtifactSlot>,
    #[serde(default)]
    pub verify: Option<ArtifactCheck>,
    #[serde(default)]
    pub fatal_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListingConfig {
    pub api_key: Option<String>,
    pub playlist_id: Option<String>,
    pub base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            retry: RetryConfig::default(),
            item_delay_secs: 5,
            error_text_limit: 500,
            title_suffix: None,
            stages: default_stages(),
            listing: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl StageConfig {
    fn default_criticality() -> Criticality {
        Criticality::Fatal
    }

    fn new(name: &str, criticality: Criticality) -> Self {
        Self {
            name: name.to_owned(),
            criticality,
            command: None,
            args: Vec::new(),
            produces: None,
            verify: None,
            fatal_exit_code: Some(2),
        }
    }

    fn program(&self) -> String {
        self.command
            .clone()
            .unwrap_or_else(|| format!("bookreel-{}", self.name.replace('_', "-")))
    }
}

/// search → transcribe → process → narrate → render → thumbnail → upload → upload_short
pub fn default_stages() -> Vec<StageConfig> {
    let mut upload = StageConfig::new("upload", Criticality::Fatal);
    upload.produces = Some(ArtifactSlot::Primary);

    let mut upload_short = StageConfig::new("upload_short", Criticality::BestEffort);
    upload_short.produces = Some(ArtifactSlot::Secondary);
    upload_short.verify = Some(ArtifactCheck {
        file: "manifest.json".to_owned(),
        field: "short_video_id".to_owned(),
    });

    vec![
        StageConfig::new("search", Criticality::Fatal),
        StageConfig::new("transcribe", Criticality::Fatal),
        StageConfig::new("process", Criticality::Fatal),
        StageConfig::new("narrate", Criticality::Fatal),
        StageConfig::new("render", Criticality::Fatal),
        StageConfig::new("thumbnail", Criticality::BestEffort),
        upload,
        upload_short,
    ]
}

impl Config {
    /// Reads `path`, or `bookreel.yaml` in the working directory if it
    /// exists, then applies `BOOKREEL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("deserialize config yaml")?;
        Ok(config)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| var(name).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        if let Some(dir) = var("BOOKREEL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = var("BOOKREEL_MAX_ATTEMPTS") {
            self.retry.max_attempts = raw
                .parse()
                .with_context(|| format!("invalid BOOKREEL_MAX_ATTEMPTS={raw:?}"))?;
        }
        if let Some(raw) = var("BOOKREEL_ITEM_DELAY_SECS") {
            self.item_delay_secs = raw
                .parse()
                .with_context(|| format!("invalid BOOKREEL_ITEM_DELAY_SECS={raw:?}"))?;
        }
        if let Some(key) = var("BOOKREEL_YOUTUBE_API_KEY") {
            self.listing.get_or_insert_with(ListingConfig::default).api_key = Some(key);
        }
        if let Some(playlist) = var("BOOKREEL_YOUTUBE_PLAYLIST_ID") {
            self.listing
                .get_or_insert_with(ListingConfig::default)
                .playlist_id = Some(playlist);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be >= 1");
        }
        if self.error_text_limit == 0 {
            anyhow::bail!("error_text_limit must be > 0");
        }
        self.build_pipeline().context("invalid stages")?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn scheduler_options(&self, force: bool) -> SchedulerOptions {
        SchedulerOptions {
            force,
            item_delay: Duration::from_secs(self.item_delay_secs),
            retry: self.retry_policy(),
            error_text_limit: self.error_text_limit,
        }
    }

    pub fn build_pipeline(&self) -> anyhow::Result<Pipeline> {
        let specs = self
            .stages
            .iter()
            .map(|stage| {
                let command = CommandStage {
                    name: stage.name.clone(),
                    program: stage.program(),
                    args: stage.args.clone(),
                    fatal_exit_code: stage.fatal_exit_code,
                };
                StageSpec {
                    name: stage.name.clone(),
                    criticality: stage.criticality,
                    produces: stage.produces,
                    verify: stage.verify.clone(),
                    stage: Arc::new(command),
                }
            })
            .collect();
        Pipeline::new(specs)
    }

    pub fn title_template(&self) -> TitleTemplate {
        TitleTemplate::new(self.title_suffix.as_deref())
    }

    /// `None` unless both an API key and a playlist are configured.
    pub fn listing_source(&self) -> anyhow::Result<Option<Arc<dyn ListingSource>>> {
        let Some(listing) = &self.listing else {
            return Ok(None);
        };
        let (Some(api_key), Some(playlist_id)) = (&listing.api_key, &listing.playlist_id) else {
            tracing::debug!("listing config incomplete; reconciliation disabled");
            return Ok(None);
        };
        let source =
            YoutubeListingSource::new(listing.base_url.as_deref(), api_key, playlist_id)?;
        Ok(Some(Arc::new(source)))
    }
}
