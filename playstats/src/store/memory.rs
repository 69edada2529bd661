use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use super::{AnalyticalStore, Row, StoreQuery};
use crate::error::{RowError, StoreError};
use crate::models::InsertRow;

type QueryFault = Box<dyn Fn(&StoreQuery) -> bool + Send + Sync>;

/// In-process store holding rows in insertion order.
///
/// Evaluates every [`StoreQuery`] shape with the same semantics as the SQL
/// backend, and can be told to fail chosen queries or reject chosen rows.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<InsertRow>>,
    executed: Mutex<Vec<StoreQuery>>,
    query_fault: Mutex<Option<QueryFault>>,
    rejected: Mutex<HashSet<String>>,
}

struct TrackGroup {
    track: String,
    artist: String,
    album: String,
    artwork: String,
    duration_ms: i64,
    spotify_id: String,
    count: i64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows directly, bypassing dedup. Lets tests stage legacy rows.
    pub fn with_rows(rows: Vec<InsertRow>) -> Self {
        let store = Self::default();
        *lock(&store.rows) = rows;
        store
    }

    /// Fail every query for which `fault` returns true.
    pub fn fail_queries_when<F>(&self, fault: F)
    where
        F: Fn(&StoreQuery) -> bool + Send + Sync + 'static,
    {
        *lock(&self.query_fault) = Some(Box::new(fault));
    }

    /// Reject appends of the given insert id.
    pub fn reject_insert_id(&self, insert_id: impl Into<String>) {
        lock(&self.rejected).insert(insert_id.into());
    }

    pub fn rows(&self) -> Vec<InsertRow> {
        lock(&self.rows).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every query run so far, in order.
    pub fn executed_queries(&self) -> Vec<StoreQuery> {
        lock(&self.executed).clone()
    }

    fn latest_played_at(rows: &[InsertRow], source: &str, include_untagged: bool) -> Vec<Row> {
        rows.iter()
            .filter(|r| match r.event.source.as_deref() {
                Some(tag) => tag == source,
                None => include_untagged,
            })
            .map(|r| r.event.played_at)
            .max()
            .map(|played_at| to_row(json!({ "played_at": played_at })))
            .into_iter()
            .collect()
    }

    fn track_groups(rows: &[InsertRow], window_days: u32, now: DateTime<Utc>) -> Vec<TrackGroup> {
        let mut groups: Vec<TrackGroup> = Vec::new();
        let mut index: HashMap<(String, String, String), usize> = HashMap::new();

        for row in rows.iter().filter(|r| in_window(r, window_days, now)) {
            let event = &row.event;
            let key = (event.track.clone(), event.artist(), event.album.clone());
            match index.get(&key) {
                Some(&i) => {
                    let group = &mut groups[i];
                    group.count += 1;
                    // longest non-empty URL stands in for the largest image
                    if event.album_cover.len() > group.artwork.len() {
                        group.artwork = event.album_cover.clone();
                    }
                }
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(TrackGroup {
                        track: key.0,
                        artist: key.1,
                        album: key.2,
                        artwork: event.album_cover.clone(),
                        duration_ms: event.duration_ms,
                        spotify_id: event.spotify_id.clone(),
                        count: 1,
                    });
                }
            }
        }
        groups
    }

    fn top_tracks(rows: &[InsertRow], window_days: u32, limit: u32) -> Vec<Row> {
        let mut groups = Self::track_groups(rows, window_days, Utc::now());
        groups.sort_by(|a, b| b.count.cmp(&a.count));
        groups.truncate(limit as usize);
        groups
            .into_iter()
            .map(|g| {
                to_row(json!({
                    "Track": g.track,
                    "Artist": g.artist,
                    "Album": g.album,
                    "Artwork": g.artwork,
                    "Duration": g.duration_ms,
                    "Spotify": g.spotify_id,
                    "Count": g.count,
                }))
            })
            .collect()
    }

    fn top_artists(rows: &[InsertRow], window_days: u32, limit: u32) -> Vec<Row> {
        let now = Utc::now();
        let mut counts: Vec<(String, i64)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in rows.iter().filter(|r| in_window(r, window_days, now)) {
            let artist = row.event.artist();
            match index.get(&artist) {
                Some(&i) => counts[i].1 += 1,
                None => {
                    index.insert(artist.clone(), counts.len());
                    counts.push((artist, 1));
                }
            }
        }

        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts.truncate(limit as usize);
        counts
            .into_iter()
            .map(|(artist, count)| to_row(json!({ "Artist": artist, "Count": count })))
            .collect()
    }

    fn monthly_counts(rows: &[InsertRow], since: DateTime<Utc>) -> Vec<Row> {
        let mut months: BTreeMap<String, (String, i64)> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.event.played_at > since) {
            let played_at = row.event.played_at;
            months
                .entry(played_at.format("%Y-%m").to_string())
                .or_insert_with(|| (played_at.format("%B %Y").to_string(), 0))
                .1 += 1;
        }
        months
            .into_iter()
            .map(|(month, (pretty, count))| {
                to_row(json!({ "Month": month, "Count": count, "Pretty": pretty }))
            })
            .collect()
    }
}

fn in_window(row: &InsertRow, window_days: u32, now: DateTime<Utc>) -> bool {
    let start = now - chrono::Duration::days(i64::from(window_days));
    row.event.played_at >= start && row.event.played_at <= now
}

fn to_row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[async_trait]
impl AnalyticalStore for MemoryStore {
    async fn query(&self, query: &StoreQuery) -> Result<Vec<Row>, StoreError> {
        lock(&self.executed).push(query.clone());

        if let Some(fault) = lock(&self.query_fault).as_ref() {
            if fault(query) {
                return Err(StoreError::Backend(format!(
                    "injected failure for {}",
                    query.name()
                )));
            }
        }

        let rows = lock(&self.rows);
        let result = match query {
            StoreQuery::LatestPlayedAt {
                source,
                include_untagged,
            } => Self::latest_played_at(&rows, source, *include_untagged),
            StoreQuery::TopTracks { window_days, limit } => {
                Self::top_tracks(&rows, *window_days, *limit)
            }
            StoreQuery::TopArtists { window_days, limit } => {
                Self::top_artists(&rows, *window_days, *limit)
            }
            StoreQuery::MonthlyCounts { since } => Self::monthly_counts(&rows, *since),
        };
        Ok(result)
    }

    async fn append(&self, new_rows: &[InsertRow]) -> Result<usize, StoreError> {
        let rejected = lock(&self.rejected).clone();
        let mut rows = lock(&self.rows);
        let mut errors = Vec::new();
        let mut inserted = 0;

        for row in new_rows {
            if rejected.contains(&row.insert_id) {
                errors.push(RowError {
                    insert_id: row.insert_id.clone(),
                    message: "row rejected by store".to_string(),
                });
                continue;
            }
            if rows.iter().any(|r| r.insert_id == row.insert_id) {
                continue;
            }
            rows.push(row.clone());
            inserted += 1;
        }

        if errors.is_empty() {
            Ok(inserted)
        } else {
            Err(StoreError::Rows(errors))
        }
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrossReferences, PlayEvent};
    use chrono::Duration;

    fn play(track: &str, artist: &str, played_at: DateTime<Utc>, cover: &str) -> InsertRow {
        InsertRow::from(PlayEvent {
            track: track.to_string(),
            artists: vec![artist.to_string()],
            album: format!("{} (album)", track),
            spotify_id: format!("id-{}", track),
            duration_ms: 200_000,
            album_cover: cover.to_string(),
            played_at,
            ingested_at: played_at,
            source: Some("spotify".to_string()),
            cross_refs: CrossReferences::default(),
        })
    }

    #[tokio::test]
    async fn append_skips_known_insert_ids() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rows = vec![play("Roygbiv", "Boards of Canada", now, "")];

        assert_eq!(store.append(&rows).await.unwrap(), 1);
        assert_eq!(store.append(&rows).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.backend_type(), "memory");
    }

    #[tokio::test]
    async fn append_reports_rejected_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let row = play("Roygbiv", "Boards of Canada", now, "");
        store.reject_insert_id(row.insert_id.clone());

        let err = store.append(&[row]).await.unwrap_err();
        match err {
            StoreError::Rows(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn window_excludes_old_and_future_plays() {
        let now = Utc::now();
        let store = MemoryStore::with_rows(vec![
            play("Recent", "A", now - Duration::days(2), ""),
            play("Old", "A", now - Duration::days(10), ""),
            play("Future", "A", now + Duration::days(1), ""),
        ]);

        let rows = store
            .query(&StoreQuery::TopTracks {
                window_days: 7,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Track"], "Recent");
    }

    #[tokio::test]
    async fn injected_fault_only_hits_matching_queries() {
        let store = MemoryStore::new();
        store.fail_queries_when(|q| matches!(q, StoreQuery::TopArtists { .. }));

        assert!(store
            .query(&StoreQuery::TopArtists {
                window_days: 7,
                limit: 10
            })
            .await
            .is_err());
        assert!(store
            .query(&StoreQuery::MonthlyCounts { since: Utc::now() })
            .await
            .is_ok());
        assert_eq!(store.executed_queries().len(), 2);
    }
}
