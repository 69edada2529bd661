//! High-water mark of already ingested plays.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::context::RunContext;
use crate::error::JobError;
use crate::store::{decode_rows, AnalyticalStore, StoreQuery};

/// `played_at` of the newest stored play for a source.
///
/// Plays at or before the watermark (to the second) are treated as already
/// ingested. An empty store yields [`Watermark::epoch`], which admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn epoch() -> Self {
        Watermark(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn at(played_at: DateTime<Utc>) -> Self {
        Watermark(played_at)
    }

    pub fn played_at(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_epoch(&self) -> bool {
        self.0 == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Whether a play is strictly newer than the watermark, compared at
    /// second granularity as the source API reports it.
    pub fn admits(&self, played_at: DateTime<Utc>) -> bool {
        played_at.timestamp() > self.0.timestamp()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[derive(Debug, Deserialize)]
struct LatestRow {
    played_at: DateTime<Utc>,
}

pub struct WatermarkResolver<'a> {
    store: &'a dyn AnalyticalStore,
    include_untagged: bool,
}

impl<'a> WatermarkResolver<'a> {
    pub fn new(store: &'a dyn AnalyticalStore, include_untagged: bool) -> Self {
        Self {
            store,
            include_untagged,
        }
    }

    pub async fn resolve(&self, ctx: &RunContext, source: &str) -> Result<Watermark, JobError> {
        let query = StoreQuery::LatestPlayedAt {
            source: source.to_string(),
            include_untagged: self.include_untagged,
        };
        let rows = ctx
            .bound("query recent timestamp", self.store.query(&query))
            .await?
            .map_err(|e| JobError::query("query recent timestamp", e))?;

        let latest = decode_rows::<LatestRow>(rows)
            .map_err(|e| JobError::query("read recent timestamp", e))?
            .into_iter()
            .next();

        Ok(match latest {
            Some(row) => Watermark::at(row.played_at),
            None => Watermark::epoch(),
        })
    }
}
