//! Process configuration, read once at startup and passed down by reference.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::JobError;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/playstats";
pub const DEFAULT_OBJECT_NAME: &str = "stats.json";
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=3600";

#[derive(Debug, Clone)]
pub struct Config {
    /// Present only when all three Spotify credentials are set.
    pub spotify: Option<SpotifyConfig>,
    pub store: StoreConfig,
    pub sink: SinkConfig,
    pub ingest: IngestConfig,
    pub summary: SummaryConfig,
    pub call_timeout: Duration,
}

#[derive(Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub api_base: String,
    pub accounts_base: String,
}

impl std::fmt::Debug for SpotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyConfig")
            .field("client_id", &self.client_id)
            .field("api_base", &self.api_base)
            .field("accounts_base", &self.accounts_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub schema: String,
    pub table: String,
    pub enriched_table: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Gcs { bucket: String },
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub target: Option<SinkTarget>,
    pub object: String,
    pub cache_control: String,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_tag: String,
    pub page_size: u32,
    pub enrich_concurrency: usize,
    /// Count rows with no source tag toward the watermark. Rows written before
    /// the source column existed carry no tag.
    pub watermark_include_untagged: bool,
}

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    pub week_days: u32,
    pub month_days: u32,
    pub year_days: u32,
    pub top_n: u32,
    pub monthly_since: DateTime<Utc>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_tag: "spotify".to_string(),
            page_size: 50,
            enrich_concurrency: 4,
            watermark_include_untagged: true,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            week_days: 7,
            month_days: 30,
            year_days: 365,
            top_n: 10,
            monthly_since: Utc
                .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
                .single()
                .expect("2000-01-01 is a valid UTC timestamp"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, JobError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, JobError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let spotify = match (
            get("SPOTIFY_CLIENT_ID"),
            get("SPOTIFY_CLIENT_SECRET"),
            get("SPOTIFY_REFRESH_TOKEN"),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Some(SpotifyConfig {
                client_id,
                client_secret,
                refresh_token,
                api_base: get("SPOTIFY_API_BASE")
                    .unwrap_or_else(|| "https://api.spotify.com".to_string()),
                accounts_base: get("SPOTIFY_ACCOUNTS_BASE")
                    .unwrap_or_else(|| "https://accounts.spotify.com".to_string()),
            }),
            (None, None, None) => None,
            _ => {
                return Err(JobError::Config(
                    "SPOTIFY_CLIENT_ID, SPOTIFY_CLIENT_SECRET and SPOTIFY_REFRESH_TOKEN must be set together"
                        .to_string(),
                ))
            }
        };

        let table = get("STORE_TABLE").unwrap_or_else(|| "plays".to_string());
        let store = StoreConfig {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            schema: identifier(
                "STORE_SCHEMA",
                get("STORE_SCHEMA").unwrap_or_else(|| "public".to_string()),
            )?,
            enriched_table: identifier(
                "STORE_TABLE_ENRICHED",
                get("STORE_TABLE_ENRICHED").unwrap_or_else(|| table.clone()),
            )?,
            table: identifier("STORE_TABLE", table)?,
            max_connections: parse(&get, "STORE_MAX_CONNECTIONS", 5)?,
        };

        let target = match (get("SUMMARY_BUCKET"), get("SUMMARY_DIR")) {
            (Some(bucket), _) => Some(SinkTarget::Gcs { bucket }),
            (None, Some(dir)) => Some(SinkTarget::Directory(PathBuf::from(dir))),
            (None, None) => None,
        };
        let sink = SinkConfig {
            target,
            object: get("SUMMARY_OBJECT").unwrap_or_else(|| DEFAULT_OBJECT_NAME.to_string()),
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
        };

        let defaults = IngestConfig::default();
        let ingest = IngestConfig {
            source_tag: get("SOURCE_TAG").unwrap_or(defaults.source_tag),
            page_size: parse(&get, "INGEST_PAGE_SIZE", defaults.page_size)?,
            enrich_concurrency: parse(&get, "ENRICH_CONCURRENCY", defaults.enrich_concurrency)?
                .max(1),
            watermark_include_untagged: match get("WATERMARK_INCLUDE_UNTAGGED") {
                Some(v) => parse_bool("WATERMARK_INCLUDE_UNTAGGED", &v)?,
                None => defaults.watermark_include_untagged,
            },
        };
        if ingest.page_size == 0 || ingest.page_size > 50 {
            return Err(JobError::Config(format!(
                "INGEST_PAGE_SIZE must be between 1 and 50, got {}",
                ingest.page_size
            )));
        }

        let defaults = SummaryConfig::default();
        let summary = SummaryConfig {
            week_days: parse(&get, "WINDOW_WEEK_DAYS", defaults.week_days)?,
            month_days: parse(&get, "WINDOW_MONTH_DAYS", defaults.month_days)?,
            year_days: parse(&get, "WINDOW_YEAR_DAYS", defaults.year_days)?,
            ..defaults
        };

        let call_timeout = Duration::from_secs(parse(&get, "CALL_TIMEOUT_SECS", 30u64)?);

        Ok(Self {
            spotify,
            store,
            sink,
            ingest,
            summary,
            call_timeout,
        })
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, JobError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| JobError::Config(format!("invalid {}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, JobError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(JobError::Config(format!("invalid {}={:?}: expected a boolean", key, raw))),
    }
}

/// Table and schema names are spliced into SQL, so only plain identifiers pass.
fn identifier(key: &str, value: String) -> Result<String, JobError> {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && value.len() <= 63;
    if valid {
        Ok(value)
    } else {
        Err(JobError::Config(format!(
            "{} must be a plain SQL identifier, got {:?}",
            key, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, JobError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_any_variables() {
        let cfg = config(&[]).unwrap();
        assert!(cfg.spotify.is_none());
        assert_eq!(cfg.store.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(cfg.store.schema, "public");
        assert_eq!(cfg.store.table, "plays");
        assert_eq!(cfg.store.enriched_table, "plays");
        assert_eq!(cfg.sink.target, None);
        assert_eq!(cfg.sink.object, "stats.json");
        assert_eq!(cfg.sink.cache_control, "max-age=3600");
        assert_eq!(cfg.ingest.page_size, 50);
        assert_eq!(cfg.ingest.source_tag, "spotify");
        assert!(cfg.ingest.watermark_include_untagged);
        assert_eq!(
            (cfg.summary.week_days, cfg.summary.month_days, cfg.summary.year_days),
            (7, 30, 365)
        );
        assert_eq!(cfg.summary.top_n, 10);
        assert_eq!(cfg.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reads_store_and_sink_settings() {
        let cfg = config(&[
            ("DATABASE_URL", "postgresql://db/music"),
            ("STORE_SCHEMA", "listening"),
            ("STORE_TABLE", "raw_plays"),
            ("STORE_TABLE_ENRICHED", "plays_enriched"),
            ("SUMMARY_BUCKET", "stats-bucket"),
            ("SUMMARY_DIR", "/tmp/ignored"),
            ("WATERMARK_INCLUDE_UNTAGGED", "false"),
            ("ENRICH_CONCURRENCY", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.store.table, "raw_plays");
        assert_eq!(cfg.store.enriched_table, "plays_enriched");
        assert_eq!(
            cfg.sink.target,
            Some(SinkTarget::Gcs {
                bucket: "stats-bucket".to_string()
            })
        );
        assert!(!cfg.ingest.watermark_include_untagged);
        assert_eq!(cfg.ingest.enrich_concurrency, 1);
    }

    #[test]
    fn directory_sink_when_no_bucket() {
        let cfg = config(&[("SUMMARY_DIR", "/srv/stats")]).unwrap();
        assert_eq!(
            cfg.sink.target,
            Some(SinkTarget::Directory(PathBuf::from("/srv/stats")))
        );
    }

    #[test]
    fn spotify_credentials_all_or_nothing() {
        let err = config(&[("SPOTIFY_CLIENT_ID", "abc")]).unwrap_err();
        assert!(matches!(err, JobError::Config(_)));

        let cfg = config(&[
            ("SPOTIFY_CLIENT_ID", "abc"),
            ("SPOTIFY_CLIENT_SECRET", "shh"),
            ("SPOTIFY_REFRESH_TOKEN", "refresh"),
        ])
        .unwrap();
        let spotify = cfg.spotify.unwrap();
        assert_eq!(spotify.api_base, "https://api.spotify.com");
        assert!(!format!("{:?}", spotify).contains("shh"));
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let err = config(&[("STORE_TABLE", "plays; DROP TABLE plays")]).unwrap_err();
        assert!(matches!(err, JobError::Config(_)));
        assert!(config(&[("STORE_SCHEMA", "1abc")]).is_err());
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(config(&[("INGEST_PAGE_SIZE", "lots")]).is_err());
        assert!(config(&[("INGEST_PAGE_SIZE", "51")]).is_err());
        assert!(config(&[("WATERMARK_INCLUDE_UNTAGGED", "maybe")]).is_err());
    }
}
