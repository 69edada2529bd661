//! The two scheduled jobs, wired from [`Config`].
//!
//! `run_*` build the concrete store, source and sink; the `*_with` variants
//! take them as trait objects.

use crate::config::{Config, IngestConfig, SinkConfig, SummaryConfig};
use crate::context::RunContext;
use crate::db::PostgresStore;
use crate::error::JobError;
use crate::ingest::EventIngestor;
use crate::publish::{sink_from_config, SnapshotPublisher, SnapshotSink};
use crate::spotify::{EventSource, SpotifyClient};
use crate::store::AnalyticalStore;
use crate::summary::WindowAggregator;
use crate::watermark::{Watermark, WatermarkResolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub watermark: Watermark,
    pub written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryReport {
    pub object: String,
    pub bytes: usize,
    pub last_updated: String,
}

async fn connect_store(config: &Config, ctx: &RunContext) -> Result<PostgresStore, JobError> {
    let store = ctx
        .bound("connect to store", PostgresStore::connect(&config.store))
        .await?
        .map_err(|e| JobError::Auth(format!("store: {}", e)))?;
    tracing::info!("database initialized ({})", store.backend_type());
    Ok(store)
}

pub async fn run_ingest(config: &Config, ctx: &RunContext) -> Result<IngestReport, JobError> {
    let spotify = config.spotify.as_ref().ok_or_else(|| {
        JobError::Config(
            "SPOTIFY_CLIENT_ID, SPOTIFY_CLIENT_SECRET and SPOTIFY_REFRESH_TOKEN must be set"
                .to_string(),
        )
    })?;

    let store = connect_store(config, ctx).await?;

    let source = ctx
        .bound(
            "authorize spotify",
            SpotifyClient::connect(spotify, ctx.call_timeout()),
        )
        .await?
        .map_err(|e| JobError::Auth(format!("spotify: {}", e)))?;

    ingest_with(ctx, &source, &store, &config.ingest).await
}

/// Resolve the watermark, then append everything newer.
pub async fn ingest_with(
    ctx: &RunContext,
    source: &dyn EventSource,
    store: &dyn AnalyticalStore,
    config: &IngestConfig,
) -> Result<IngestReport, JobError> {
    let watermark = WatermarkResolver::new(store, config.watermark_include_untagged)
        .resolve(ctx, &config.source_tag)
        .await?;
    tracing::info!(
        "ingesting {} plays after {} into {} store",
        config.source_tag,
        watermark,
        store.backend_type()
    );

    let written = EventIngestor::new(source, store, config)
        .ingest(ctx, &config.source_tag, watermark)
        .await?;

    Ok(IngestReport { watermark, written })
}

pub async fn run_summary(config: &Config, ctx: &RunContext) -> Result<SummaryReport, JobError> {
    let sink = sink_from_config(ctx, &config.sink).await?;
    let store = connect_store(config, ctx).await?;

    summarize_with(ctx, &store, sink.as_ref(), &config.summary, &config.sink).await
}

/// Aggregate every window, then publish the snapshot in one write.
///
/// Any failed query ends the run before the sink is touched.
pub async fn summarize_with(
    ctx: &RunContext,
    store: &dyn AnalyticalStore,
    sink: &dyn SnapshotSink,
    summary: &SummaryConfig,
    sink_config: &SinkConfig,
) -> Result<SummaryReport, JobError> {
    tracing::debug!(
        "summarizing from {} store into {} sink",
        store.backend_type(),
        sink.sink_type()
    );
    let snapshot = WindowAggregator::new(store, summary).summarize(ctx).await?;

    let bytes = SnapshotPublisher::new(sink, sink_config)
        .publish(ctx, &snapshot)
        .await?;

    Ok(SummaryReport {
        object: sink_config.object.clone(),
        bytes,
        last_updated: snapshot.last_updated,
    })
}
