use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::identity::{WorkItemKey, normalize};
use crate::ledger::{read_json, write_json_atomic};

pub const BOOK_LEDGER_FILE: &str = "book_ledger.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum BookStatus {
    Processing,
    Done,
    Failed,
    /// A status some other writer put there. Kept verbatim so rewriting the
    /// table does not lose it.
    Unknown(String),
}

impl BookStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<String> for BookStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "processing" => Self::Processing,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<BookStatus> for String {
    fn from(status: BookStatus) -> Self {
        match status {
            BookStatus::Unknown(raw) => raw,
            known => known.as_str().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLedgerEntry {
    pub key: WorkItemKey,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub status: BookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Global dedup table: at most one entry per work item.
///
/// Mutations happen only when a fresh run begins (`begin_processing`,
/// `reopen`), when a run resolves (`complete`, `mark_failed`), or when
/// reconciliation imports already-published items.
#[async_trait]
pub trait BookLedger: Send + Sync {
    async fn lookup(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<BookLedgerEntry>, LedgerError>;

    async fn entries(&self) -> Result<Vec<BookLedgerEntry>, LedgerError>;

    async fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.entries().await?.is_empty())
    }

    /// Fails with `AlreadyExists` if a processing or done entry matches.
    /// A failed entry is reopened in place.
    async fn begin_processing(
        &self,
        title: &str,
        author: Option<&str>,
        run_ref: &str,
    ) -> Result<BookLedgerEntry, LedgerError>;

    /// Puts an existing entry back to processing under a new run.
    async fn reopen(
        &self,
        key: &WorkItemKey,
        run_ref: &str,
    ) -> Result<BookLedgerEntry, LedgerError>;

    /// Records artifacts; the entry becomes done only when every required
    /// artifact is present, otherwise it stays processing.
    async fn complete(
        &self,
        key: &WorkItemKey,
        primary_artifact_id: Option<&str>,
        secondary_artifact_id: Option<&str>,
    ) -> Result<BookLedgerEntry, LedgerError>;

    async fn mark_failed(&self, key: &WorkItemKey) -> Result<BookLedgerEntry, LedgerError>;

    /// Inserts an already-published item as done. Returns `false` when a
    /// matching entry exists, leaving it untouched.
    async fn insert_published(
        &self,
        title: &str,
        author: Option<&str>,
        artifact_id: &str,
    ) -> Result<bool, LedgerError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookTable {
    entries: Vec<BookLedgerEntry>,
}

impl BookTable {
    /// Exact key first, then the author-optional match.
    fn position(&self, key: &WorkItemKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.key == key)
            .or_else(|| self.entries.iter().position(|e| e.key.matches(key)))
    }
}

/// Whole table in one JSON document, rewritten atomically on every change.
pub struct JsonFileBookLedger {
    path: PathBuf,
    require_secondary: bool,
    write_lock: Mutex<()>,
}

impl JsonFileBookLedger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: base_dir.into().join(BOOK_LEDGER_FILE),
            require_secondary: false,
            write_lock: Mutex::new(()),
        }
    }

    /// Whether `done` also needs a secondary artifact.
    pub fn with_secondary_required(mut self, required: bool) -> Self {
        self.require_secondary = required;
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_table(&self) -> Result<BookTable, LedgerError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn update<T: Send>(
        &self,
        f: impl FnOnce(&mut BookTable) -> Result<T, LedgerError> + Send,
    ) -> Result<T, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut table = self.read_table().await?;
        let out = f(&mut table)?;
        write_json_atomic(&self.path, &table).await?;
        Ok(out)
    }

    fn not_found(&self) -> LedgerError {
        LedgerError::NotFound {
            path: self.path.clone(),
        }
    }
}

#[async_trait]
impl BookLedger for JsonFileBookLedger {
    async fn lookup(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<BookLedgerEntry>, LedgerError> {
        let key = normalize(title, author);
        let _guard = self.write_lock.lock().await;
        let table = self.read_table().await?;
        Ok(table.position(&key).map(|idx| table.entries[idx].clone()))
    }

    async fn entries(&self) -> Result<Vec<BookLedgerEntry>, LedgerError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_table().await?.entries)
    }

    async fn begin_processing(
        &self,
        title: &str,
        author: Option<&str>,
        run_ref: &str,
    ) -> Result<BookLedgerEntry, LedgerError> {
        let key = normalize(title, author);
        self.update(|table| {
            let now = Utc::now();
            if let Some(idx) = table.position(&key) {
                let entry = &mut table.entries[idx];
                if entry.status != BookStatus::Failed {
                    return Err(LedgerError::AlreadyExists {
                        key: key.to_string(),
                    });
                }
                if entry.author.is_none() && key.author.is_some() {
                    entry.author = author.map(|a| a.trim().to_owned());
                    entry.key = key.clone();
                }
                entry.status = BookStatus::Processing;
                entry.run_ref = Some(run_ref.to_owned());
                entry.updated_at = now;
                return Ok(entry.clone());
            }

            let entry = BookLedgerEntry {
                key,
                title: title.trim().to_owned(),
                author: author.map(|a| a.trim().to_owned()).filter(|a| !a.is_empty()),
                status: BookStatus::Processing,
                primary_artifact_id: None,
                secondary_artifact_id: None,
                run_ref: Some(run_ref.to_owned()),
                created_at: now,
                updated_at: now,
            };
            table.entries.push(entry.clone());
            Ok(entry)
        })
        .await
    }

    async fn reopen(
        &self,
        key: &WorkItemKey,
        run_ref: &str,
    ) -> Result<BookLedgerEntry, LedgerError> {
        let not_found = self.not_found();
        self.update(|table| {
            let idx = table.position(key).ok_or(not_found)?;
            let entry = &mut table.entries[idx];
            entry.status = BookStatus::Processing;
            entry.primary_artifact_id = None;
            entry.secondary_artifact_id = None;
            entry.run_ref = Some(run_ref.to_owned());
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
        .await
    }

    async fn complete(
        &self,
        key: &WorkItemKey,
        primary_artifact_id: Option<&str>,
        secondary_artifact_id: Option<&str>,
    ) -> Result<BookLedgerEntry, LedgerError> {
        let not_found = self.not_found();
        let require_secondary = self.require_secondary;
        self.update(|table| {
            let idx = table.position(key).ok_or(not_found)?;
            let entry = &mut table.entries[idx];
            if let Some(id) = primary_artifact_id {
                entry.primary_artifact_id = Some(id.to_owned());
            }
            if let Some(id) = secondary_artifact_id {
                entry.secondary_artifact_id = Some(id.to_owned());
            }
            let has_all = entry.primary_artifact_id.is_some()
                && (!require_secondary || entry.secondary_artifact_id.is_some());
            entry.status = if has_all {
                BookStatus::Done
            } else {
                BookStatus::Processing
            };
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
        .await
    }

    async fn mark_failed(&self, key: &WorkItemKey) -> Result<BookLedgerEntry, LedgerError> {
        let not_found = self.not_found();
        self.update(|table| {
            let idx = table.position(key).ok_or(not_found)?;
            let entry = &mut table.entries[idx];
            entry.status = BookStatus::Failed;
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
        .await
    }

    async fn insert_published(
        &self,
        title: &str,
        author: Option<&str>,
        artifact_id: &str,
    ) -> Result<bool, LedgerError> {
        let key = normalize(title, author);
        let _guard = self.write_lock.lock().await;
        let mut table = self.read_table().await?;
        if table.position(&key).is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        table.entries.push(BookLedgerEntry {
            key,
            title: title.trim().to_owned(),
            author: author.map(|a| a.trim().to_owned()).filter(|a| !a.is_empty()),
            status: BookStatus::Done,
            primary_artifact_id: Some(artifact_id.to_owned()),
            secondary_artifact_id: None,
            run_ref: None,
            created_at: now,
            updated_at: now,
        });
        write_json_atomic(&self.path, &table).await?;
        Ok(true)
    }
}
