//! Error types shared across the ingestion stack

use thiserror::Error;

/// Errors raised while downloading a feed.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The configured URL could not be used.
    #[error("Invalid feed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The proxy settings were rejected by the HTTP client.
    #[error("Invalid proxy configuration: {0}")]
    Proxy(String),

    /// The request did not complete before the timeout.
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// Any other transport failure.
    #[error("Failed to fetch {url}: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout {
                url: url.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            };
        }
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Malformed payload for the declared feed format.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON array, found {0}")]
    NotAnArray(&'static str),

    #[error("Invalid STIX payload: {0}")]
    Stix(String),
}

/// Errors from the indicator store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid database configuration: {0}")]
    Configuration(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl StoreError {
    /// Whether retrying the same write has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::PoolExhausted => true,
            StoreError::Connection(msg) | StoreError::Query(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("database is locked")
                    || msg.contains("busy")
                    || msg.contains("deadlock")
                    || msg.contains("lock wait")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection reset")
                    || msg.contains("could not serialize")
            }
            StoreError::Constraint(_)
            | StoreError::Migration(_)
            | StoreError::Configuration(_)
            | StoreError::InvalidValue(_) => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StoreError::Constraint(db_err.message().to_string())
                } else {
                    StoreError::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => StoreError::PoolExhausted,
            sqlx::Error::Configuration(msg) => StoreError::Configuration(msg.to_string()),
            sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err.to_string())
    }
}

/// Errors loading or validating the settings file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Errors while rendering block-lists and exports.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Unexpected {provider} document: {message}")]
    Payload { provider: String, message: String },

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Failure of a single source's pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    #[error("All {0} batches failed to persist")]
    PersistFailed(usize),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("An aggregation run is already in progress")]
    AlreadyRunning,

    #[error("Source '{0}' is already being processed")]
    SourceBusy(String),

    #[error("Write queue is closed")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_is_transient() {
        assert!(StoreError::Query("database is locked".into()).is_transient());
        assert!(StoreError::PoolExhausted.is_transient());
        assert!(!StoreError::Constraint("UNIQUE constraint failed".into()).is_transient());
        assert!(!StoreError::Query("no such table: indicators".into()).is_transient());
    }
}
