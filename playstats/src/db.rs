use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row as _;

use crate::config::StoreConfig;
use crate::error::{RowError, StoreError};
use crate::models::InsertRow;
use crate::store::{AnalyticalStore, Row, StoreQuery};

/// Plays table in Postgres, created on connect if missing.
///
/// Every query shape is wrapped as `SELECT to_jsonb(q) AS row FROM (...) q`
/// so the rows come back keyed by column alias, the same way
/// [`MemoryStore`](crate::store::MemoryStore) produces them.
pub struct PostgresStore {
    pool: PgPool,
    raw_table: String,
    enriched_table: String,
}

pub async fn init_db(config: &StoreConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}

/// DDL for the raw plays table at its configured location. The enriched
/// table is owned elsewhere and never created here.
fn schema_statements(schema: &str, table: &str) -> Vec<String> {
    let target = qualified(schema, table);
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                insert_id TEXT PRIMARY KEY,
                track TEXT NOT NULL,
                artist TEXT NOT NULL,
                album TEXT NOT NULL,
                played_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT,
                spotify_id TEXT,
                album_cover TEXT NOT NULL DEFAULT '',
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                source TEXT,
                youtube_id TEXT,
                youtube_category_id TEXT,
                soundcloud_id TEXT,
                soundcloud_permalink TEXT,
                shazam_id TEXT,
                shazam_permalink TEXT
            )
            "#,
            target
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}_played_at_idx\" ON {} (played_at DESC)",
            table, target
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}_source_played_at_idx\" ON {} (source, played_at DESC)",
            table, target
        ),
    ]
}

impl PostgresStore {
    /// Connect and make sure the raw table exists.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = init_db(config).await?;
        for statement in schema_statements(&config.schema, &config.table) {
            sqlx::query(&statement).execute(&pool).await?;
        }
        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: &StoreConfig) -> Self {
        Self {
            pool,
            raw_table: qualified(&config.schema, &config.table),
            enriched_table: qualified(&config.schema, &config.enriched_table),
        }
    }

    fn sql_for(&self, query: &StoreQuery) -> String {
        let table = if query.reads_raw_table() {
            &self.raw_table
        } else {
            &self.enriched_table
        };
        query_sql(query, table)
    }

    /// Returns whether the row was new.
    async fn insert_one(&self, row: &InsertRow) -> Result<bool, sqlx::Error> {
        let event = &row.event;
        let refs = &event.cross_refs;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                insert_id, track, artist, album, played_at, duration_ms,
                spotify_id, album_cover, ingested_at, source,
                youtube_id, youtube_category_id, soundcloud_id,
                soundcloud_permalink, shazam_id, shazam_permalink
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (insert_id) DO NOTHING
            "#,
            self.raw_table
        ))
        .bind(&row.insert_id)
        .bind(&event.track)
        .bind(event.artist())
        .bind(&event.album)
        .bind(event.played_at)
        .bind(event.duration_ms)
        .bind(&event.spotify_id)
        .bind(&event.album_cover)
        .bind(event.ingested_at)
        .bind(&event.source)
        .bind(&refs.youtube_id)
        .bind(&refs.youtube_category_id)
        .bind(&refs.soundcloud_id)
        .bind(&refs.soundcloud_permalink)
        .bind(&refs.shazam_id)
        .bind(&refs.shazam_permalink)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("\"{}\".\"{}\"", schema, table)
}

fn as_json_rows(inner: &str, order: &str) -> String {
    format!(
        "SELECT to_jsonb(q) AS row FROM ({}) q ORDER BY {}",
        inner, order
    )
}

/// SQL text for a query shape. Parameters are bound in [`bind_params`] order.
fn query_sql(query: &StoreQuery, table: &str) -> String {
    match query {
        StoreQuery::LatestPlayedAt {
            include_untagged, ..
        } => {
            let filter = if *include_untagged {
                "source = $1 OR source IS NULL"
            } else {
                "source = $1"
            };
            as_json_rows(
                &format!(
                    "SELECT played_at FROM {} WHERE {} ORDER BY played_at DESC LIMIT 1",
                    table, filter
                ),
                "q.played_at DESC",
            )
        }
        StoreQuery::TopTracks { .. } => as_json_rows(
            &format!(
                r#"
                SELECT
                    track AS "Track",
                    artist AS "Artist",
                    album AS "Album",
                    COALESCE((ARRAY_AGG(album_cover ORDER BY LENGTH(COALESCE(album_cover, '')) DESC))[1], '') AS "Artwork",
                    MIN(duration_ms) AS "Duration",
                    MIN(spotify_id) AS "Spotify",
                    COUNT(track) AS "Count"
                FROM {}
                WHERE played_at BETWEEN NOW() - make_interval(days => $1) AND NOW()
                GROUP BY track, artist, album
                ORDER BY "Count" DESC
                LIMIT $2
                "#,
                table
            ),
            r#"q."Count" DESC"#,
        ),
        StoreQuery::TopArtists { .. } => as_json_rows(
            &format!(
                r#"
                SELECT
                    artist AS "Artist",
                    COUNT(track) AS "Count"
                FROM {}
                WHERE played_at BETWEEN NOW() - make_interval(days => $1) AND NOW()
                GROUP BY artist
                ORDER BY "Count" DESC
                LIMIT $2
                "#,
                table
            ),
            r#"q."Count" DESC"#,
        ),
        StoreQuery::MonthlyCounts { .. } => as_json_rows(
            &format!(
                r#"
                SELECT
                    to_char(played_at AT TIME ZONE 'UTC', 'YYYY-MM') AS "Month",
                    COUNT(track) AS "Count",
                    to_char(played_at AT TIME ZONE 'UTC', 'FMMonth YYYY') AS "Pretty"
                FROM {}
                WHERE played_at > $1
                GROUP BY 1, 3
                "#,
                table
            ),
            r#"q."Month" ASC"#,
        ),
    }
}

fn bind_params<'q>(
    sql: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    query: &'q StoreQuery,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match query {
        StoreQuery::LatestPlayedAt { source, .. } => sql.bind(source.as_str()),
        StoreQuery::TopTracks { window_days, limit }
        | StoreQuery::TopArtists { window_days, limit } => sql
            .bind(i32::try_from(*window_days).unwrap_or(i32::MAX))
            .bind(i64::from(*limit)),
        StoreQuery::MonthlyCounts { since } => sql.bind(*since),
    }
}

#[async_trait]
impl AnalyticalStore for PostgresStore {
    async fn query(&self, query: &StoreQuery) -> Result<Vec<Row>, StoreError> {
        let sql = self.sql_for(query);
        tracing::debug!("running {} query", query.name());

        let rows = bind_params(sqlx::query(&sql), query)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("row")?;
                match value {
                    serde_json::Value::Object(map) => Ok(map),
                    other => Err(StoreError::Backend(format!(
                        "expected a json object row, got {}",
                        other
                    ))),
                }
            })
            .collect()
    }

    async fn append(&self, rows: &[InsertRow]) -> Result<usize, StoreError> {
        let mut errors = Vec::new();
        let mut inserted = 0;

        for row in rows {
            match self.insert_one(row).await {
                Ok(true) => inserted += 1,
                Ok(false) => tracing::debug!("play {} already stored", row.insert_id),
                Err(e) => {
                    tracing::debug!("failed to insert play {}: {}", row.insert_id, e);
                    errors.push(RowError {
                        insert_id: row.insert_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(inserted)
        } else {
            Err(StoreError::Rows(errors))
        }
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
