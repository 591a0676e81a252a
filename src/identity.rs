use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical comparison key for a work item.
///
/// Titles and authors are lower-cased, apostrophes dropped, other punctuation
/// folded to spaces and whitespace collapsed. An empty author is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl WorkItemKey {
    pub fn new(title: &str, author: Option<&str>) -> Self {
        normalize(title, author)
    }

    /// Author-optional match: if either side lacks an author, the title
    /// decides alone.
    pub fn matches(&self, other: &WorkItemKey) -> bool {
        matches(self, other)
    }

    /// Filesystem-safe slug used in log lines and run directory names.
    pub fn slug(&self) -> String {
        let slug = self.title.replace(' ', "-");
        slug.chars().take(48).collect()
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.author {
            Some(author) => write!(f, "{} / {}", self.title, author),
            None => f.write_str(&self.title),
        }
    }
}

pub fn normalize(title: &str, author: Option<&str>) -> WorkItemKey {
    let title = normalize_text(title);
    let author = author.map(normalize_text).filter(|a| !a.is_empty());
    WorkItemKey { title, author }
}

pub fn matches(a: &WorkItemKey, b: &WorkItemKey) -> bool {
    if a.title != b.title {
        return false;
    }
    match (&a.author, &b.author) {
        (Some(left), Some(right)) => left == right,
        _ => true,
    }
}

fn normalize_text(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if is_apostrophe(ch) {
            continue;
        }
        if ch.is_alphanumeric() {
            folded.extend(ch.to_lowercase());
        } else {
            folded.push(' ');
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_apostrophe(ch: char) -> bool {
    matches!(ch, '\'' | '\u{2019}' | '\u{2018}' | '`')
}
