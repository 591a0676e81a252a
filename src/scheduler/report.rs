use std::fmt::Write as _;

use crate::ledger::book::BookLedgerEntry;
use crate::ledger::run::RunRecord;
use crate::scheduler::{Action, BatchPlan, BatchSummary, ItemOutcome, ItemReport};

/// Pre-flight table: one row per requested item.
pub fn render_plan(plan: &BatchPlan) -> String {
    let rows: Vec<Vec<String>> = plan
        .items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            vec![
                (idx + 1).to_string(),
                item.request.label(),
                item.current_status
                    .as_ref()
                    .map(|s| s.as_str().to_owned())
                    .unwrap_or_else(|| "-".to_owned()),
                item.action.as_str().to_owned(),
                item.detail.clone(),
            ]
        })
        .collect();

    let mut out = table(&["#", "item", "status", "action", "detail"], &rows);
    let _ = writeln!(
        out,
        "\nplan: {} item(s): process {}, resume {}, skip {}",
        plan.items.len(),
        plan.count(Action::Process),
        plan.count(Action::Resume),
        plan.count(Action::Skip),
    );
    out
}

pub fn render_summary(summary: &BatchSummary) -> String {
    let mut out = String::new();
    let processed: Vec<_> = summary.processed().collect();
    let resumed: Vec<_> = summary.resumed().collect();
    let failed: Vec<_> = summary.failed().collect();
    let skipped: Vec<_> = summary.skipped().collect();

    let _ = writeln!(
        out,
        "summary: {} processed, {} resumed, {} failed, {} skipped{}",
        processed.len(),
        resumed.len(),
        failed.len(),
        skipped.len(),
        if summary.interrupted {
            " (interrupted)"
        } else {
            ""
        }
    );

    section(&mut out, "processed", &processed);
    section(&mut out, "resumed", &resumed);
    section(&mut out, "failed", &failed);
    section(&mut out, "skipped", &skipped);
    out
}

fn section(out: &mut String, title: &str, items: &[&ItemReport]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{title}:");
    for item in items {
        let _ = writeln!(out, "  - {}: {}", item.request.label(), describe(&item.outcome));
    }
}

fn describe(outcome: &ItemOutcome) -> String {
    match outcome {
        ItemOutcome::Processed {
            run_id,
            primary,
            secondary,
            degraded,
        }
        | ItemOutcome::Resumed {
            run_id,
            primary,
            secondary,
            degraded,
        } => {
            let mut text = format!(
                "run {run_id}, primary {}, secondary {}",
                primary.as_deref().unwrap_or("-"),
                secondary.as_deref().unwrap_or("-")
            );
            if !degraded.is_empty() {
                let _ = write!(text, ", degraded: {}", degraded.join(", "));
            }
            text
        }
        ItemOutcome::Failed {
            run_id,
            stage,
            attempts,
            error,
        } => {
            let mut text = String::new();
            if let Some(stage) = stage {
                let _ = write!(text, "stage {stage} after {attempts} attempt(s): ");
            }
            text.push_str(error);
            if let Some(run_id) = run_id {
                let _ = write!(text, " [run {run_id}]");
            }
            text
        }
        ItemOutcome::Skipped {
            reason,
            primary,
            secondary,
        } => {
            let refs: Vec<&str> = [primary, secondary]
                .into_iter()
                .filter_map(|r| r.as_deref())
                .collect();
            if refs.is_empty() {
                reason.clone()
            } else {
                format!("{reason} [{}]", refs.join(", "))
            }
        }
    }
}

pub fn render_ledger(entries: &[BookLedgerEntry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.title.clone(),
                e.author.clone().unwrap_or_else(|| "-".to_owned()),
                e.status.as_str().to_owned(),
                e.primary_artifact_id.clone().unwrap_or_else(|| "-".to_owned()),
                e.secondary_artifact_id.clone().unwrap_or_else(|| "-".to_owned()),
                e.run_ref.clone().unwrap_or_else(|| "-".to_owned()),
                e.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    table(
        &["title", "author", "status", "primary", "secondary", "run", "updated"],
        &rows,
    )
}

pub fn render_run(record: &RunRecord) -> String {
    let mut out = format!(
        "run {} for {} (created {})\nroot: {}\n\n",
        record.run_id,
        record.work_item_key,
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.root_location.display()
    );
    let rows: Vec<Vec<String>> = record
        .stages
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                format!("{:?}", s.status).to_lowercase(),
                s.attempt_count.to_string(),
                format!("{:.1}s", s.duration_ms as f64 / 1000.0),
                s.artifact_ref.clone().unwrap_or_else(|| "-".to_owned()),
                s.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    out.push_str(&table(
        &["stage", "status", "attempts", "duration", "artifact", "error"],
        &rows,
    ));
    out
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = headers.iter().map(|h| (*h).to_owned()).collect();
    push_row(&mut out, &header, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_row(&mut out, &rule, &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (idx, cell) in cells.iter().enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        line.push_str(cell);
        let pad = widths[idx].saturating_sub(cell.chars().count());
        line.extend(std::iter::repeat_n(' ', pad));
    }
    out.push_str(line.trim_end());
    out.push('\n');
}
