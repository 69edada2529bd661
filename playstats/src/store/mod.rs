//! The analytical store the jobs read from and append to.
//!
//! Queries are a closed set of parameterized shapes rather than SQL text, so
//! values are always bound by the backend and each shape can be exercised
//! against [`MemoryStore`] in tests.
//!
//! ## Backends
//!
//! - `PostgresStore` (in [`crate::db`]) - sqlx/Postgres
//! - [`MemoryStore`] - in-process, evaluates the same shapes over a `Vec`

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::models::InsertRow;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The query shapes the jobs issue.
///
/// Column names in the returned rows match the snapshot field names
/// (`Track`, `Count`, `Month`, ...) so rows decode straight into the
/// published types. [`StoreQuery::LatestPlayedAt`] returns at most one row
/// with a `played_at` column.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreQuery {
    LatestPlayedAt {
        source: String,
        include_untagged: bool,
    },
    TopTracks {
        window_days: u32,
        limit: u32,
    },
    TopArtists {
        window_days: u32,
        limit: u32,
    },
    MonthlyCounts {
        since: DateTime<Utc>,
    },
}

impl StoreQuery {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            StoreQuery::LatestPlayedAt { .. } => "latest_played_at",
            StoreQuery::TopTracks { .. } => "top_tracks",
            StoreQuery::TopArtists { .. } => "top_artists",
            StoreQuery::MonthlyCounts { .. } => "monthly_counts",
        }
    }

    /// Whether the shape reads the raw plays table rather than the enriched one.
    pub fn reads_raw_table(&self) -> bool {
        matches!(self, StoreQuery::LatestPlayedAt { .. })
    }
}

#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    /// Run one query shape, returning rows in the shape's defined order.
    async fn query(&self, query: &StoreQuery) -> Result<Vec<Row>, StoreError>;

    /// Append rows, returning how many were actually inserted. Rows whose
    /// `insert_id` is already stored are skipped and not counted.
    /// Rejected rows are reported together as [`StoreError::Rows`].
    async fn append(&self, rows: &[InsertRow]) -> Result<usize, StoreError>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Decode query rows into typed results.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(serde_json::Value::Object(row)).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Counted {
        #[serde(rename = "Artist")]
        artist: String,
        #[serde(rename = "Count")]
        count: i64,
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn decodes_rows_in_order() {
        let rows = vec![
            row(json!({"Artist": "Boards of Canada", "Count": 9})),
            row(json!({"Artist": "Autechre", "Count": 3})),
        ];
        let decoded: Vec<Counted> = decode_rows(rows).unwrap();
        assert_eq!(decoded[0].artist, "Boards of Canada");
        assert_eq!(decoded[1].count, 3);
    }

    #[test]
    fn malformed_row_is_a_decode_error() {
        let rows = vec![row(json!({"Artist": 12}))];
        let err = decode_rows::<Counted>(rows).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn only_watermark_reads_raw_table() {
        let latest = StoreQuery::LatestPlayedAt {
            source: "spotify".to_string(),
            include_untagged: true,
        };
        assert!(latest.reads_raw_table());
        assert!(!StoreQuery::TopArtists {
            window_days: 7,
            limit: 10
        }
        .reads_raw_table());
        assert_eq!(latest.name(), "latest_played_at");
    }
}
