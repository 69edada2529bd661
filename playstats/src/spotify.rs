use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::config::SpotifyConfig;
use crate::error::SourceError;

/// A play as reported by the streaming service, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub track_id: String,
    pub track_name: String,
    pub artists: Vec<String>,
    pub album: String,
    pub played_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Full track metadata looked up per candidate play.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackDetail {
    pub album: Option<String>,
    pub artwork_url: Option<String>,
}

/// Where plays come from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Most recent plays, newest first.
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<RawEvent>, SourceError>;

    async fn fetch_track_detail(&self, track_id: &str) -> Result<TrackDetail, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SpotifyTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    #[serde(default)]
    items: Vec<PlayHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: SpotifyTrack,
    played_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    id: Option<String>,
    name: String,
    #[serde(default)]
    duration_ms: i64,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    album: Option<SpotifyAlbum>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    name: String,
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
    width: Option<u32>,
}

/// Spotify Web API client for one user, authorized with a refresh token.
pub struct SpotifyClient {
    client: Client,
    api_base: String,
    access_token: String,
}

impl SpotifyClient {
    /// Exchange the refresh token for an access token.
    pub async fn connect(config: &SpotifyConfig, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        let auth = format!("{}:{}", config.client_id, config.client_secret);
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, auth.as_bytes());

        let token_response = client
            .post(format!("{}/api/token", config.accounts_base))
            .header("Authorization", format!("Basic {}", encoded))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", config.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let token: SpotifyTokenResponse = check(token_response).await?.json().await?;
        tracing::debug!("obtained spotify access token");

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            access_token: token.access_token,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, SourceError> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .query(query)
            .send()
            .await?;
        check(response).await
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

fn raw_events(response: RecentlyPlayedResponse) -> Vec<RawEvent> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let track = item.track;
            let Some(track_id) = track.id else {
                // local files have no catalog id and cannot be looked up
                tracing::warn!("skipping play of {} without a track id", track.name);
                return None;
            };
            Some(RawEvent {
                track_id,
                track_name: track.name,
                artists: track.artists.into_iter().map(|a| a.name).collect(),
                album: track.album.map(|a| a.name).unwrap_or_default(),
                played_at: item.played_at,
                duration_ms: track.duration_ms,
            })
        })
        .collect()
}

fn track_detail(track: SpotifyTrack) -> TrackDetail {
    match track.album {
        Some(album) => {
            // Get the largest image
            let artwork_url = album
                .images
                .iter()
                .max_by_key(|img| img.width.unwrap_or(0))
                .map(|img| img.url.clone());
            TrackDetail {
                album: Some(album.name),
                artwork_url,
            }
        }
        None => TrackDetail::default(),
    }
}

#[async_trait]
impl EventSource for SpotifyClient {
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<RawEvent>, SourceError> {
        let response: RecentlyPlayedResponse = self
            .get("/v1/me/player/recently-played", &[("limit", limit.to_string())])
            .await?
            .json()
            .await?;
        Ok(raw_events(response))
    }

    async fn fetch_track_detail(&self, track_id: &str) -> Result<TrackDetail, SourceError> {
        let track: SpotifyTrack = self
            .get(&format!("/v1/tracks/{}", track_id), &[])
            .await?
            .json()
            .await?;
        Ok(track_detail(track))
    }
}
