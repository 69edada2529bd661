//! Error types shared by the ingest and summary jobs.

use std::time::Duration;

use thiserror::Error;

/// A single rejected row from a multi-row append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub insert_id: String,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.insert_id, self.message)
    }
}

/// Failures raised by an [`AnalyticalStore`](crate::store::AnalyticalStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{} row(s) rejected", .0.len())]
    Rows(Vec<RowError>),

    #[error("malformed row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

/// Failures raised by an [`EventSource`](crate::spotify::EventSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Backend(String),
}

/// Failures raised by a [`SnapshotSink`](crate::publish::SnapshotSink).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

/// Everything that can end a job run.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to {operation}: {source}")]
    Query {
        operation: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to insert row {insert_id}: {source}")]
    Write {
        insert_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to {operation}: {source}")]
    SourceFetch {
        operation: String,
        #[source]
        source: SourceError,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish {object}: {source}")]
    Publish {
        object: String,
        #[source]
        source: SinkError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl JobError {
    pub fn query(operation: impl Into<String>, source: StoreError) -> Self {
        JobError::Query {
            operation: operation.into(),
            source,
        }
    }

    pub fn source_fetch(operation: impl Into<String>, source: SourceError) -> Self {
        JobError::SourceFetch {
            operation: operation.into(),
            source,
        }
    }

    /// Per-row sub-errors carried by a failed append, if any.
    pub fn row_errors(&self) -> &[RowError] {
        match self {
            JobError::Write {
                source: StoreError::Rows(rows),
                ..
            } => rows,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_exposes_row_errors() {
        let err = JobError::Write {
            insert_id: "1700000000".to_string(),
            source: StoreError::Rows(vec![RowError {
                insert_id: "1700000000".to_string(),
                message: "value too long".to_string(),
            }]),
        };

        assert_eq!(err.row_errors().len(), 1);
        assert_eq!(
            err.to_string(),
            "failed to insert row 1700000000: 1 row(s) rejected"
        );
    }

    #[test]
    fn query_error_names_operation() {
        let err = JobError::query(
            "get plays for last week",
            StoreError::Backend("connection reset".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "failed to get plays for last week: connection reset"
        );
        assert!(err.row_errors().is_empty());
    }
}
