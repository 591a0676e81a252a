use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};

use crate::scheduler::WorkRequest;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Config file (default: `bookreel.yaml` in the working directory, if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Classify requested items against the ledger without changing anything.
    Plan(ItemsArgs),
    /// Classify, then process or resume every item that needs work.
    Run(RunArgs),
    /// Rebuild the book ledger from the published listing.
    Reconcile,
    /// Show the book ledger, or one run's stage history.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct ItemsArgs {
    /// Title of a single work item.
    #[arg(long, required_unless_present = "input", conflicts_with = "input")]
    pub item: Option<String>,

    /// Author of the single work item.
    #[arg(long, requires = "item")]
    pub author: Option<String>,

    /// YAML list of `{ title, author }` entries.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Reprocess items that are already done.
    #[arg(long)]
    pub force: bool,
}

impl ItemsArgs {
    pub fn requests(&self) -> anyhow::Result<Vec<WorkRequest>> {
        if let Some(title) = &self.item {
            let request = WorkRequest::new(title.clone(), self.author.as_deref());
            if request.key().title.is_empty() {
                anyhow::bail!("--item {title:?} has no usable title");
            }
            return Ok(vec![request]);
        }
        let Some(path) = &self.input else {
            anyhow::bail!("either --item or --input is required");
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read input: {}", path.display()))?;
        let requests: Vec<WorkRequest> = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse input: {}", path.display()))?;
        if let Some(blank) = requests.iter().position(|r| r.key().title.is_empty()) {
            anyhow::bail!("input item #{} has an empty title", blank + 1);
        }
        Ok(requests)
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub items: ItemsArgs,

    /// Print the plan and stop.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Run id to show instead of the book ledger.
    #[arg(long)]
    pub run: Option<String>,
}
