use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::SummaryConfig;
use crate::context::RunContext;
use crate::error::JobError;
use crate::store::{decode_rows, AnalyticalStore, StoreQuery};

/// The published stats document. Field names and order are read by the
/// front end and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub plays_by_month: Vec<MonthlyCount>,

    pub plays_year: Vec<TopTrack>,
    pub plays_month: Vec<TopTrack>,
    pub plays_week: Vec<TopTrack>,

    pub artists_year: Vec<TopArtist>,
    pub artists_month: Vec<TopArtist>,
    pub artists_week: Vec<TopArtist>,

    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopTrack {
    pub track: String,
    pub artist: String,
    pub album: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub artwork: String,
    #[serde(default, skip_serializing)]
    pub duration: Option<i64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub spotify: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopArtist {
    pub artist: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonthlyCount {
    pub month: String,
    pub count: i64,
    pub pretty: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A named trailing period ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub name: &'static str,
    pub days: u32,
}

impl AggregationWindow {
    pub const WEEK: AggregationWindow = AggregationWindow {
        name: "week",
        days: 7,
    };
    pub const MONTH: AggregationWindow = AggregationWindow {
        name: "month",
        days: 30,
    };
    pub const YEAR: AggregationWindow = AggregationWindow {
        name: "year",
        days: 365,
    };

    pub fn with_days(self, days: u32) -> Self {
        Self { days, ..self }
    }
}

pub struct WindowAggregator<'a> {
    store: &'a dyn AnalyticalStore,
    week: AggregationWindow,
    month: AggregationWindow,
    year: AggregationWindow,
    top_n: u32,
    monthly_since: DateTime<Utc>,
}

impl<'a> WindowAggregator<'a> {
    pub fn new(store: &'a dyn AnalyticalStore, config: &SummaryConfig) -> Self {
        Self {
            store,
            week: AggregationWindow::WEEK.with_days(config.week_days),
            month: AggregationWindow::MONTH.with_days(config.month_days),
            year: AggregationWindow::YEAR.with_days(config.year_days),
            top_n: config.top_n,
            monthly_since: config.monthly_since,
        }
    }

    /// Most played (track, artist, album) groups in the trailing window.
    pub async fn top_tracks(
        &self,
        ctx: &RunContext,
        window: AggregationWindow,
    ) -> Result<Vec<TopTrack>, JobError> {
        let operation = format!("get plays for last {}", window.name);
        let query = StoreQuery::TopTracks {
            window_days: window.days,
            limit: self.top_n,
        };
        let mut tracks: Vec<TopTrack> = self.run(ctx, &operation, &query).await?;
        tracks.truncate(self.top_n as usize);
        Ok(tracks)
    }

    /// Most played artists in the trailing window.
    pub async fn top_artists(
        &self,
        ctx: &RunContext,
        window: AggregationWindow,
    ) -> Result<Vec<TopArtist>, JobError> {
        let operation = format!("get artists for last {}", window.name);
        let query = StoreQuery::TopArtists {
            window_days: window.days,
            limit: self.top_n,
        };
        let mut artists: Vec<TopArtist> = self.run(ctx, &operation, &query).await?;
        artists.truncate(self.top_n as usize);
        Ok(artists)
    }

    /// Play counts for every month with plays since the fixed epoch, oldest first.
    pub async fn monthly_counts(&self, ctx: &RunContext) -> Result<Vec<MonthlyCount>, JobError> {
        let query = StoreQuery::MonthlyCounts {
            since: self.monthly_since,
        };
        self.run(ctx, "get counts for months", &query).await
    }

    /// Run every aggregation and assemble the snapshot. Any failed query
    /// fails the whole summary; partial results are never returned.
    pub async fn summarize(&self, ctx: &RunContext) -> Result<Snapshot, JobError> {
        let plays_by_month = self.monthly_counts(ctx).await?;

        let plays_year = self.top_tracks(ctx, self.year).await?;
        let plays_month = self.top_tracks(ctx, self.month).await?;
        let plays_week = self.top_tracks(ctx, self.week).await?;

        let artists_year = self.top_artists(ctx, self.year).await?;
        let artists_month = self.top_artists(ctx, self.month).await?;
        let artists_week = self.top_artists(ctx, self.week).await?;

        Ok(Snapshot {
            plays_by_month,
            plays_year,
            plays_month,
            plays_week,
            artists_year,
            artists_month,
            artists_week,
            last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    async fn run<T>(
        &self,
        ctx: &RunContext,
        operation: &str,
        query: &StoreQuery,
    ) -> Result<Vec<T>, JobError>
    where
        T: serde::de::DeserializeOwned,
    {
        let rows = ctx
            .bound(operation, self.store.query(query))
            .await?
            .map_err(|e| JobError::query(operation, e))?;
        tracing::debug!("{}: {} rows", operation, rows.len());
        decode_rows(rows).map_err(|e| JobError::query(operation, e))
    }
}
