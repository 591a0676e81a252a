use std::path::PathBuf;

/// Failures of the durable ledgers (run records and the book table).
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger record at {}", path.display())]
    NotFound { path: PathBuf },

    /// A caller tried to begin work on an item that already has a live entry.
    /// This is a contract violation: the duplicate check must run first.
    #[error("work item already in ledger: {key}")]
    AlreadyExists { key: String },

    /// A persisted record exists but cannot be parsed. The file is left as-is.
    #[error("ledger record is corrupt: {}", path.display())]
    Corruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger io failed: {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize ledger record")]
    Serialize(#[source] serde_json::Error),
}

impl LedgerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Error returned by a stage function.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Retryable (network, rate limit, flaky tool).
    #[error("{0:#}")]
    Transient(anyhow::Error),

    /// Explicitly non-retryable, e.g. invalid input data.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl StageError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(err)
    }
}

/// Cuts `text` to at most `limit` chars, marking the cut.
pub fn truncate_error_text(text: &str, limit: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}
