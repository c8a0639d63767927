//! Error types for the recycler core library.

/// Top-level error enum for the recycler core library.
#[derive(Debug, thiserror::Error)]
pub enum RecyclerError {
    /// Audit or roadmap text that does not have the expected shape.
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// A unit of work tried to hold a second transaction lock.
    #[error("Concurrency violation: {0}")]
    Concurrency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Roadmap error: {0}")]
    Roadmap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RecyclerError {
    pub(crate) fn malformed(what: &str, text: &str) -> Self {
        RecyclerError::Malformed(format!("{what}: '{text}'"))
    }

    /// True for the "never existed / no longer exists" class of failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecyclerError::NotFound(_))
    }
}

pub type RecyclerResult<T> = Result<T, RecyclerError>;
