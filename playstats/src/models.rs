use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifiers of the same recording on other services. Populated by a
/// separate enrichment pass, so always empty when written by the ingest job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferences {
    pub youtube_id: Option<String>,
    pub youtube_category_id: Option<String>,
    pub soundcloud_id: Option<String>,
    pub soundcloud_permalink: Option<String>,
    pub shazam_id: Option<String>,
    pub shazam_permalink: Option<String>,
}

/// One historical playback, as stored in the plays table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub track: String,
    pub artists: Vec<String>,
    pub album: String,
    pub spotify_id: String,
    pub duration_ms: i64,
    pub album_cover: String,
    pub played_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    /// `None` only for rows written before plays were tagged with a source.
    pub source: Option<String>,
    #[serde(default)]
    pub cross_refs: CrossReferences,
}

impl PlayEvent {
    /// Artist list as displayed and stored: `"A, B"`.
    pub fn artist(&self) -> String {
        self.artists.join(", ")
    }

    /// Store key for this play: Unix seconds of `played_at`.
    ///
    /// Two different tracks played within the same second share a key and
    /// collapse into one row. This is an accepted limitation of keying on
    /// event time alone.
    pub fn insert_id(&self) -> String {
        self.played_at.timestamp().to_string()
    }
}

/// A play paired with the idempotency key the store dedups on.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub insert_id: String,
    pub event: PlayEvent,
}

impl From<PlayEvent> for InsertRow {
    fn from(event: PlayEvent) -> Self {
        Self {
            insert_id: event.insert_id(),
            event,
        }
    }
}
