//! Pull recent plays from the source and append the new ones to the store.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::config::IngestConfig;
use crate::context::RunContext;
use crate::error::{JobError, StoreError};
use crate::models::{CrossReferences, InsertRow, PlayEvent};
use crate::spotify::{EventSource, RawEvent, TrackDetail};
use crate::store::AnalyticalStore;
use crate::watermark::Watermark;

pub struct EventIngestor<'a> {
    source: &'a dyn EventSource,
    store: &'a dyn AnalyticalStore,
    page_size: u32,
    enrich_concurrency: usize,
}

impl<'a> EventIngestor<'a> {
    pub fn new(
        source: &'a dyn EventSource,
        store: &'a dyn AnalyticalStore,
        config: &IngestConfig,
    ) -> Self {
        Self {
            source,
            store,
            page_size: config.page_size,
            enrich_concurrency: config.enrich_concurrency.max(1),
        }
    }

    /// Append every fetched play newer than `watermark`, oldest first.
    ///
    /// Returns the number of plays actually inserted; a play whose insert id is
    /// already stored is skipped and not counted. The first failed append ends the
    /// run: plays are written in event order so that a later run's watermark
    /// never moves past a play that was not stored.
    pub async fn ingest(
        &self,
        ctx: &RunContext,
        source_tag: &str,
        watermark: Watermark,
    ) -> Result<usize, JobError> {
        let recent = ctx
            .bound("get recent plays", self.source.fetch_recent(self.page_size))
            .await?
            .map_err(|e| JobError::source_fetch("get recent plays", e))?;
        let fetched = recent.len();

        let mut candidates: Vec<RawEvent> = recent
            .into_iter()
            .filter(|event| watermark.admits(event.played_at))
            .collect();

        if candidates.is_empty() {
            tracing::info!(
                "no new plays among {} fetched (watermark {})",
                fetched,
                watermark
            );
            return Ok(0);
        }
        candidates.sort_by_key(|event| event.played_at);

        tracing::debug!(
            "{} of {} fetched plays are newer than {}",
            candidates.len(),
            fetched,
            watermark
        );

        // Lookups may run concurrently; `buffered` keeps results in input order.
        let details: Vec<TrackDetail> = stream::iter(candidates.iter())
            .map(|event| self.track_detail(ctx, event))
            .buffered(self.enrich_concurrency)
            .try_collect()
            .await?;

        let mut written = 0;
        for (raw, detail) in candidates.into_iter().zip(details) {
            let row = InsertRow::from(play_event(raw, detail, source_tag));

            let inserted = match ctx
                .bound("insert row", self.store.append(std::slice::from_ref(&row)))
                .await?
            {
                Ok(inserted) => inserted,
                Err(e) => {
                    if let StoreError::Rows(errors) = &e {
                        for err in errors {
                            tracing::error!("row insertion error: {}", err);
                        }
                    }
                    return Err(JobError::Write {
                        insert_id: row.insert_id,
                        source: e,
                    });
                }
            };

            if inserted == 0 {
                // same-second key as a stored play
                tracing::warn!(
                    "{} {} not stored, insert id {} already present",
                    row.event.played_at,
                    row.event.track,
                    row.insert_id
                );
                continue;
            }

            tracing::info!("{} {}", row.event.played_at, row.event.track);
            written += inserted;
        }

        Ok(written)
    }

    async fn track_detail(
        &self,
        ctx: &RunContext,
        event: &RawEvent,
    ) -> Result<TrackDetail, JobError> {
        let operation = format!("get full track {}", event.track_id);
        ctx.bound(&operation, self.source.fetch_track_detail(&event.track_id))
            .await?
            .map_err(|e| JobError::source_fetch(operation.clone(), e))
    }
}

fn play_event(raw: RawEvent, detail: TrackDetail, source_tag: &str) -> PlayEvent {
    PlayEvent {
        track: raw.track_name,
        artists: raw.artists,
        album: detail.album.unwrap_or(raw.album),
        spotify_id: raw.track_id,
        duration_ms: raw.duration_ms,
        album_cover: detail.artwork_url.unwrap_or_default(),
        played_at: raw.played_at,
        ingested_at: Utc::now(),
        source: Some(source_tag.to_string()),
        cross_refs: CrossReferences::default(),
    }
}
