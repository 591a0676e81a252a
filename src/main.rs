use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

use bookreel::cli::{Cli, Command};
use bookreel::config::Config;
use bookreel::ledger::book::{BookLedger, JsonFileBookLedger};
use bookreel::ledger::run::RunLedger;
use bookreel::pipeline::ArtifactSlot;
use bookreel::scheduler::BatchScheduler;
use bookreel::scheduler::report::{render_ledger, render_plan, render_run, render_summary};

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<ExitCode> {
    bookreel::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = Config::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        Command::Plan(args) => {
            let requests = args.requests()?;
            let scheduler = build_scheduler(&config, args.force, CancellationToken::new())?;
            let plan = scheduler.plan(&requests).await.context("classify batch")?;
            print!("{}", render_plan(&plan));
        }
        Command::Run(args) => {
            let requests = args.items.requests()?;
            let cancel = CancellationToken::new();
            spawn_interrupt_listener(cancel.clone());

            let scheduler = build_scheduler(&config, args.items.force, cancel)?;
            scheduler.prepare().await.context("prepare ledger")?;
            let plan = scheduler.plan(&requests).await.context("classify batch")?;
            print!("{}", render_plan(&plan));
            if args.dry_run {
                return Ok(ExitCode::SUCCESS);
            }

            let summary = scheduler.execute(plan).await;
            println!();
            print!("{}", render_summary(&summary));
            if summary.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Reconcile => {
            let book = open_book_ledger(&config)?;
            let source = config
                .listing_source()?
                .context("no listing source configured (set BOOKREEL_YOUTUBE_API_KEY and BOOKREEL_YOUTUBE_PLAYLIST_ID)")?;
            let report =
                bookreel::reconcile::reconcile(book.as_ref(), source.as_ref(), &config.title_template())
                    .await
                    .context("reconcile")?;
            println!(
                "reconciled {} page(s): {} scanned, {} inserted, {} already present, {} unmatched",
                report.pages, report.scanned, report.inserted, report.already_present, report.unmatched
            );
        }
        Command::Status(args) => match args.run {
            Some(run_id) => {
                let runs = RunLedger::new(&config.data_dir);
                let record = runs
                    .load(&runs.root_for(&run_id))
                    .await
                    .with_context(|| format!("load run {run_id}"))?;
                print!("{}", render_run(&record));
            }
            None => {
                let book = open_book_ledger(&config)?;
                let entries = book.entries().await.context("read book ledger")?;
                print!("{}", render_ledger(&entries));
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn open_book_ledger(config: &Config) -> anyhow::Result<Arc<dyn BookLedger>> {
    let pipeline = config.build_pipeline()?;
    let ledger = JsonFileBookLedger::new(&config.data_dir)
        .with_secondary_required(pipeline.produces(ArtifactSlot::Secondary));
    Ok(Arc::new(ledger))
}

fn build_scheduler(
    config: &Config,
    force: bool,
    cancel: CancellationToken,
) -> anyhow::Result<BatchScheduler> {
    let pipeline = config.build_pipeline()?;
    let book = open_book_ledger(config)?;
    let runs = RunLedger::new(&config.data_dir);

    let mut scheduler =
        BatchScheduler::new(book, runs, pipeline, config.scheduler_options(force), cancel);
    if let Some(source) = config.listing_source()? {
        scheduler = scheduler.with_listing(source, config.title_template());
    }
    Ok(scheduler)
}

fn spawn_interrupt_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current stage attempt");
            cancel.cancel();
        }
    });
}
