use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as Span, TimeZone, Utc};

use playstats::config::{IngestConfig, SinkConfig, SummaryConfig};
use playstats::error::{SinkError, SourceError};
use playstats::jobs::{ingest_with, summarize_with};
use playstats::publish::{FilesystemSink, ObjectMetadata, SnapshotSink};
use playstats::spotify::{EventSource, RawEvent, TrackDetail};
use playstats::store::{MemoryStore, StoreQuery};
use playstats::{JobError, RunContext, Snapshot};

/// Serves whatever page it currently holds, newest first.
#[derive(Default)]
struct ScriptedSource {
    page: Mutex<Vec<RawEvent>>,
}

impl ScriptedSource {
    fn serve(&self, mut events: Vec<RawEvent>) {
        events.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        *self.page.lock().unwrap() = events;
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<RawEvent>, SourceError> {
        let page = self.page.lock().unwrap();
        Ok(page.iter().take(limit as usize).cloned().collect())
    }

    async fn fetch_track_detail(&self, track_id: &str) -> Result<TrackDetail, SourceError> {
        Ok(TrackDetail {
            album: None,
            artwork_url: Some(format!("https://i.scdn.co/image/{}", track_id)),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl SnapshotSink for RecordingSink {
    async fn atomic_write(
        &self,
        _object: &str,
        bytes: Vec<u8>,
        _metadata: &ObjectMetadata,
    ) -> Result<(), SinkError> {
        self.writes.lock().unwrap().push(bytes);
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "recording"
    }
}

fn ctx() -> RunContext {
    RunContext::new(Duration::from_secs(5))
}

/// Now, truncated to the second like the store's insert ids.
fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

fn play(track: &str, artist: &str, played_at: DateTime<Utc>) -> RawEvent {
    RawEvent {
        track_id: track.to_lowercase().replace(' ', "-"),
        track_name: track.to_string(),
        artists: vec![artist.to_string()],
        album: "Singles".to_string(),
        played_at,
        duration_ms: 200_000,
    }
}

fn sink_config() -> SinkConfig {
    SinkConfig {
        target: None,
        object: "stats.json".to_string(),
        cache_control: "max-age=3600".to_string(),
    }
}

#[tokio::test]
async fn rerunning_ingest_on_the_same_page_adds_nothing() {
    let t0 = now() - Span::hours(3);
    let source = ScriptedSource::default();
    source.serve(vec![
        play("Windowlicker", "Aphex Twin", t0),
        play("Xtal", "Aphex Twin", t0 + Span::minutes(5)),
        play("Avril 14th", "Aphex Twin", t0 + Span::minutes(10)),
    ]);
    let store = MemoryStore::new();
    let config = IngestConfig::default();

    let first = ingest_with(&ctx(), &source, &store, &config).await.unwrap();
    assert!(first.watermark.is_epoch());
    assert_eq!(first.written, 3);

    let second = ingest_with(&ctx(), &source, &store, &config).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.watermark.played_at(), t0 + Span::minutes(10));
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let t0 = now() - Span::hours(5);
    let source = ScriptedSource::default();
    let store = MemoryStore::new();
    let config = IngestConfig::default();

    source.serve(vec![play("Alberto Balsalm", "Aphex Twin", t0)]);
    let first = ingest_with(&ctx(), &source, &store, &config).await.unwrap();

    // the next page overlaps the last one and adds two newer plays
    source.serve(vec![
        play("Alberto Balsalm", "Aphex Twin", t0),
        play("Flim", "Aphex Twin", t0 + Span::minutes(4)),
        play("Girl/Boy Song", "Aphex Twin", t0 + Span::minutes(9)),
    ]);
    let second = ingest_with(&ctx(), &source, &store, &config).await.unwrap();
    assert_eq!(second.written, 2);
    assert!(second.watermark >= first.watermark);

    let third = ingest_with(&ctx(), &source, &store, &config).await.unwrap();
    assert!(third.watermark > second.watermark);
    assert_eq!(third.watermark.played_at(), t0 + Span::minutes(9));

    let ids: Vec<String> = store.rows().into_iter().map(|r| r.insert_id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn ingested_plays_show_up_in_published_snapshot() {
    let t0 = now() - Span::days(2);
    let source = ScriptedSource::default();
    source.serve(vec![
        play("Teen Age Riot", "Sonic Youth", t0),
        play("Teen Age Riot", "Sonic Youth", t0 + Span::minutes(8)),
        play("Kool Thing", "Sonic Youth", t0 + Span::minutes(16)),
        play("Cannonball", "The Breeders", t0 + Span::minutes(20)),
    ]);
    let store = MemoryStore::new();
    ingest_with(&ctx(), &source, &store, &IngestConfig::default())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sink = FilesystemSink::new(dir.path()).await.unwrap();
    let report = summarize_with(
        &ctx(),
        &store,
        &sink,
        &SummaryConfig::default(),
        &sink_config(),
    )
    .await
    .unwrap();

    let text = std::fs::read_to_string(sink.path_for("stats.json")).unwrap();
    assert_eq!(report.bytes, text.len());
    let snapshot: Snapshot = serde_json::from_str(&text).unwrap();

    assert_eq!(snapshot.last_updated, report.last_updated);
    assert_eq!(snapshot.plays_week[0].track, "Teen Age Riot");
    assert_eq!(snapshot.plays_week[0].count, 2);
    assert_eq!(
        snapshot.plays_week[0].artwork,
        "https://i.scdn.co/image/teen-age-riot"
    );
    assert_eq!(snapshot.plays_week.len(), 3);
    assert_eq!(snapshot.artists_week[0].artist, "Sonic Youth");
    assert_eq!(snapshot.artists_week[0].count, 3);
    assert_eq!(snapshot.plays_year.len(), 3);
    let total: i64 = snapshot.plays_by_month.iter().map(|m| m.count).sum();
    assert_eq!(total, 4);
}

#[tokio::test]
async fn failed_window_leaves_previous_snapshot_in_place() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let sink = FilesystemSink::new(dir.path()).await.unwrap();

    summarize_with(
        &ctx(),
        &store,
        &sink,
        &SummaryConfig::default(),
        &sink_config(),
    )
    .await
    .unwrap();
    let before = std::fs::read_to_string(sink.path_for("stats.json")).unwrap();

    store.fail_queries_when(|q| matches!(q, StoreQuery::TopArtists { window_days: 7, .. }));
    let recording = RecordingSink::default();
    let err = summarize_with(
        &ctx(),
        &store,
        &recording,
        &SummaryConfig::default(),
        &sink_config(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, JobError::Query { .. }));
    assert!(recording.writes.lock().unwrap().is_empty());

    let err = summarize_with(
        &ctx(),
        &store,
        &sink,
        &SummaryConfig::default(),
        &sink_config(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("get artists for last week"));
    let after = std::fs::read_to_string(sink.path_for("stats.json")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn cancelled_run_does_nothing() {
    let source = ScriptedSource::default();
    source.serve(vec![play("Roygbiv", "Boards of Canada", now())]);
    let store = MemoryStore::new();
    let ctx = ctx();
    ctx.cancel();

    let err = ingest_with(&ctx, &source, &store, &IngestConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Cancelled { .. }));
    assert!(store.is_empty());
    assert!(store.executed_queries().is_empty());
}
