pub mod youtube;

use std::collections::HashSet;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;

use crate::ledger::book::BookLedger;

/// A published item as the external listing reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub title: String,
    pub artifact_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<ListingItem>,
    pub next_page_token: Option<String>,
}

/// Authoritative, paged listing of what has already been published.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, page_token: Option<&str>) -> anyhow::Result<ListingPage>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedWorkItem {
    pub title: String,
    pub author: Option<String>,
}

/// Parses published titles of the form `<hook> – <title> | <suffix>`.
///
/// The separator is an en dash or an em dash. A spaced ASCII hyphen is only
/// accepted when the title has neither, since hooks often contain one. When a
/// suffix is configured it must match case-insensitively.
#[derive(Debug, Clone)]
pub struct TitleTemplate {
    dashed: Regex,
    hyphenated: Regex,
    suffix: Option<String>,
}

impl Default for TitleTemplate {
    fn default() -> Self {
        Self::new(None)
    }
}

fn template_pattern(separator: &str) -> Regex {
    Regex::new(&format!(
        r"^\s*(?P<hook>[^|]+?)\s+{separator}\s+(?P<title>[^|]+?)\s*\|\s*(?P<suffix>.+?)\s*$"
    ))
    .expect("title template regex is valid")
}

impl TitleTemplate {
    pub fn new(suffix: Option<&str>) -> Self {
        Self {
            dashed: template_pattern(r"[\u{2013}\u{2014}]"),
            hyphenated: template_pattern("-"),
            suffix: suffix
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        }
    }

    /// Authors are not recoverable from published titles; the author-optional
    /// identity match covers that.
    pub fn extract_work_item(&self, title: &str) -> Option<ExtractedWorkItem> {
        let caps = if title.contains(['\u{2013}', '\u{2014}']) {
            self.dashed.captures(title)?
        } else {
            self.hyphenated.captures(title)?
        };
        let work_title = caps.name("title")?.as_str().trim();
        if work_title.is_empty() {
            return None;
        }
        if let Some(expected) = &self.suffix {
            let suffix = caps.name("suffix")?.as_str().trim().to_lowercase();
            if &suffix != expected {
                return None;
            }
        }
        Some(ExtractedWorkItem {
            title: work_title.to_owned(),
            author: None,
        })
    }
}

pub fn extract_work_item(title: &str) -> Option<ExtractedWorkItem> {
    TitleTemplate::default().extract_work_item(title)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pages: usize,
    pub scanned: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub unmatched: usize,
}

/// Imports every published item the listing knows about into the book
/// ledger as `done`. Running it again adds nothing.
pub async fn reconcile(
    ledger: &dyn BookLedger,
    source: &dyn ListingSource,
    template: &TitleTemplate,
) -> anyhow::Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut seen_tokens = HashSet::new();
    let mut page_token: Option<String> = None;

    loop {
        let page = source
            .fetch_page(page_token.as_deref())
            .await
            .with_context(|| format!("fetch listing page {}", report.pages + 1))?;
        report.pages += 1;

        for item in page.items {
            report.scanned += 1;
            let Some(work) = template.extract_work_item(&item.title) else {
                tracing::debug!(title = %item.title, "listing title does not match template");
                report.unmatched += 1;
                continue;
            };
            let inserted = ledger
                .insert_published(&work.title, work.author.as_deref(), &item.artifact_id)
                .await
                .with_context(|| format!("import published item: {}", work.title))?;
            if inserted {
                tracing::info!(title = %work.title, artifact_id = %item.artifact_id, "imported published item");
                report.inserted += 1;
            } else {
                report.already_present += 1;
            }
        }

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => {
                if !seen_tokens.insert(token.clone()) {
                    anyhow::bail!("listing returned a repeated page token: {token}");
                }
                page_token = Some(token);
            }
            None => break,
        }
    }

    tracing::info!(
        pages = report.pages,
        scanned = report.scanned,
        inserted = report.inserted,
        already_present = report.already_present,
        unmatched = report.unmatched,
        "reconciliation finished"
    );
    Ok(report)
}
