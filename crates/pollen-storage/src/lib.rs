//! Forecast persistence + HTTP fetch utilities for the pollen ingestor.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use pollen_core::{
    Forecast, PollenSeverityRecord, PollenType, Severity, SiteForecast, SiteRegistry,
    ThunderstormAsthmaRecord,
};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pollen-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Spaces consecutive requests at least `interval` apart.
///
/// A zero interval never sleeps, which is what tests use.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET with no retries; a failure aborts the caller's attempt.
    pub async fn fetch_bytes(
        &self,
        source_name: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_name, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                warn!(status = status.as_u16(), %final_url, "upstream returned an error status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS sites (
        id   INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )",
    // Append-only fact rows; one per (site, type) per ingestion.
    "CREATE TABLE IF NOT EXISTS pollen (
        site_id       INTEGER NOT NULL REFERENCES sites(id),
        type          TEXT NOT NULL,
        severity      TEXT NOT NULL CHECK (severity IN ('low', 'moderate', 'high', 'extreme')),
        forecast_for  TEXT,
        timestamp     TEXT NOT NULL,
        forecast_date TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS thunderstorm_asthma (
        region        TEXT NOT NULL CHECK (length(region) > 0),
        severity      TEXT NOT NULL CHECK (severity IN ('low', 'moderate', 'high', 'extreme')),
        updated_at    TEXT,
        timestamp     TEXT NOT NULL,
        forecast_date TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS pollen_date_idx ON pollen(forecast_date, site_id)",
    "CREATE INDEX IF NOT EXISTS pollen_timestamp_idx ON pollen(timestamp)",
    "CREATE INDEX IF NOT EXISTS asthma_date_idx ON thunderstorm_asthma(forecast_date)",
];

const INSERT_SITE: &str = "INSERT INTO sites (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING";

const INSERT_POLLEN: &str = "INSERT INTO pollen (site_id, type, severity, forecast_for, timestamp, forecast_date)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const DELETE_POLLEN_DAY: &str = "DELETE FROM pollen WHERE forecast_date = ?1";

const DELETE_ASTHMA_DAY: &str = "DELETE FROM thunderstorm_asthma WHERE forecast_date = ?1";

const INSERT_ASTHMA: &str = "INSERT INTO thunderstorm_asthma (region, severity, updated_at, timestamp, forecast_date)
     VALUES (?1, ?2, ?3, ?4, ?5)";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store holds no forecast yet. Callers treat this as the bootstrap case.
    #[error("no forecast has been stored yet")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored {column} value {value:?} is invalid: {reason}")]
    Corrupt {
        column: &'static str,
        value: String,
        reason: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertSummary {
    pub pollen_rows: u64,
    pub asthma_rows: u64,
}

/// SQLite-backed forecast tables plus the site dimension.
#[derive(Debug, Clone)]
pub struct ForecastStore {
    pool: SqlitePool,
    zone: Tz,
    sites: SiteRegistry,
}

impl ForecastStore {
    /// Open (or create) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str, zone: Tz, sites: SiteRegistry) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `:memory:` is its own database, so pin to one.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };
        let store = Self { pool, zone, sites };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory(zone: Tz, sites: SiteRegistry) -> StoreResult<Self> {
        Self::connect("sqlite::memory:", zone, sites).await
    }

    async fn init_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn sites(&self) -> &SiteRegistry {
        &self.sites
    }

    /// Insert-or-ignore every site. Existing ids keep their stored name.
    pub async fn seed_sites(&self, sites: &SiteRegistry) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for site in sites.iter() {
            let result = sqlx::query(INSERT_SITE)
                .bind(i64::from(site.id))
                .bind(&site.name)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, total = sites.len(), "seeded site dimension");
        Ok(inserted)
    }

    /// Write both table families, each in its own transaction.
    ///
    /// Pollen rows commit before asthma rows are attempted. A failure in the
    /// asthma family leaves the committed pollen rows in place. Each family
    /// replaces whatever it already holds for the same local date, so a retry
    /// after a partial write never duplicates rows.
    pub async fn insert_forecast(&self, forecast: &Forecast) -> StoreResult<InsertSummary> {
        let stamp = encode_instant(&forecast.date);
        let day = encode_day(forecast.local_date(self.zone));

        let pollen_rows = self.insert_pollen_rows(forecast, &stamp, &day).await?;
        let asthma_rows = self.insert_asthma_rows(forecast, &stamp, &day).await?;

        info!(pollen_rows, asthma_rows, forecast_date = %day, "forecast stored");
        Ok(InsertSummary {
            pollen_rows,
            asthma_rows,
        })
    }

    async fn insert_pollen_rows(&self, forecast: &Forecast, stamp: &str, day: &str) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query(DELETE_POLLEN_DAY).bind(day).execute(&mut *tx).await?;
        if replaced.rows_affected() > 0 {
            info!(table = "pollen", replaced = replaced.rows_affected(), forecast_date = day, "replacing partial day");
        }
        let mut written = 0u64;
        for site in &forecast.site_forecasts {
            let forecast_for = site.forecast_for.as_ref().map(encode_instant);
            for record in &site.severities {
                let result = sqlx::query(INSERT_POLLEN)
                    .bind(i64::from(site.site))
                    .bind(record.pollen_type.as_str())
                    .bind(record.severity.as_str())
                    .bind(forecast_for.as_deref())
                    .bind(stamp)
                    .bind(day)
                    .execute(&mut *tx)
                    .await;
                if let Err(err) = result {
                    warn!(table = "pollen", written, site = site.site, error = %err, "rolling back");
                    abandon(tx, "pollen").await;
                    return Err(err.into());
                }
                written += 1;
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_asthma_rows(&self, forecast: &Forecast, stamp: &str, day: &str) -> StoreResult<u64> {
        let updated_at = forecast.asthma_updated_at.as_ref().map(encode_instant);
        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query(DELETE_ASTHMA_DAY).bind(day).execute(&mut *tx).await?;
        if replaced.rows_affected() > 0 {
            info!(table = "thunderstorm_asthma", replaced = replaced.rows_affected(), forecast_date = day, "replacing partial day");
        }
        let mut written = 0u64;
        for record in &forecast.asthma_records {
            let result = sqlx::query(INSERT_ASTHMA)
                .bind(&record.region)
                .bind(record.severity.as_str())
                .bind(updated_at.as_deref())
                .bind(stamp)
                .bind(day)
                .execute(&mut *tx)
                .await;
            if let Err(err) = result {
                warn!(table = "thunderstorm_asthma", written, region = %record.region, error = %err, "rolling back");
                abandon(tx, "thunderstorm_asthma").await;
                return Err(err.into());
            }
            written += 1;
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Most recent capture instant stored in both table families.
    ///
    /// The older of the two per-family maxima wins, so a day whose asthma
    /// write failed after the pollen commit does not count as ingested.
    pub async fn latest_date(&self) -> StoreResult<DateTime<FixedOffset>> {
        let row = sqlx::query(
            "SELECT (SELECT MAX(timestamp) FROM pollen) AS pollen_latest,
                    (SELECT MAX(timestamp) FROM thunderstorm_asthma) AS asthma_latest",
        )
        .fetch_one(&self.pool)
        .await?;
        let pollen_latest: Option<String> = row.try_get("pollen_latest")?;
        let asthma_latest: Option<String> = row.try_get("asthma_latest")?;
        let (Some(pollen_latest), Some(asthma_latest)) = (pollen_latest, asthma_latest) else {
            return Err(StoreError::NotFound);
        };
        self.decode_instant("timestamp", pollen_latest.min(asthma_latest).as_str())
    }

    /// Rebuild the forecast stored for the local calendar `date`.
    ///
    /// Every registered site appears in the result, with empty severities when
    /// nothing was stored for it on that date.
    pub async fn select_forecast(&self, date: NaiveDate) -> StoreResult<Forecast> {
        let day = encode_day(date);
        let mut latest_stamp: Option<String> = None;
        let mut site_forecasts = Vec::with_capacity(self.sites.len());

        for site in self.sites.iter() {
            let rows = sqlx::query(
                "SELECT type, severity, forecast_for, timestamp
                   FROM pollen
                  WHERE forecast_date = ?1 AND site_id = ?2
                  ORDER BY rowid",
            )
            .bind(&day)
            .bind(i64::from(site.id))
            .fetch_all(&self.pool)
            .await?;

            let mut forecast_for = None;
            let mut severities = Vec::with_capacity(rows.len());
            for row in rows {
                let pollen_type: String = row.try_get("type")?;
                let severity: String = row.try_get("severity")?;
                let stored_for: Option<String> = row.try_get("forecast_for")?;
                let stamp: String = row.try_get("timestamp")?;

                if let Some(value) = stored_for {
                    forecast_for = Some(self.decode_instant("forecast_for", &value)?);
                }
                bump_latest(&mut latest_stamp, stamp);
                severities.push(PollenSeverityRecord::new(
                    PollenType::new(pollen_type),
                    decode_severity(&severity)?,
                ));
            }

            site_forecasts.push(SiteForecast {
                site: site.id,
                forecast_for,
                severities,
            });
        }

        let rows = sqlx::query(
            "SELECT region, severity, updated_at, timestamp
               FROM thunderstorm_asthma
              WHERE forecast_date = ?1
              ORDER BY rowid",
        )
        .bind(&day)
        .fetch_all(&self.pool)
        .await?;

        let mut asthma_updated_at = None;
        let mut asthma_records = Vec::with_capacity(rows.len());
        for row in rows {
            let region: String = row.try_get("region")?;
            let severity: String = row.try_get("severity")?;
            let updated_at: Option<String> = row.try_get("updated_at")?;
            let stamp: String = row.try_get("timestamp")?;

            if let Some(value) = updated_at {
                asthma_updated_at = Some(self.decode_instant("updated_at", &value)?);
            }
            bump_latest(&mut latest_stamp, stamp);
            asthma_records.push(ThunderstormAsthmaRecord {
                region,
                severity: decode_severity(&severity)?,
            });
        }

        let date = match latest_stamp {
            Some(stamp) => self.decode_instant("timestamp", &stamp)?,
            None => self.local_midnight(date),
        };

        Ok(Forecast {
            date,
            asthma_updated_at,
            site_forecasts,
            asthma_records,
        })
    }

    fn decode_instant(&self, column: &'static str, value: &str) -> StoreResult<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&self.zone).fixed_offset())
            .map_err(|e| StoreError::Corrupt {
                column,
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<FixedOffset> {
        let naive = date.and_time(NaiveTime::MIN);
        self.zone
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.fixed_offset())
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive).fixed_offset())
    }
}

// Fixed-width UTC text so MAX(timestamp) orders chronologically.
/// Roll back after a failed statement. The statement's error is the one the
/// caller reports; a rollback failure is only logged.
async fn abandon(tx: Transaction<'_, Sqlite>, table: &'static str) {
    if let Err(err) = tx.rollback().await {
        warn!(table, error = %err, "rollback failed");
    }
}

fn encode_instant(instant: &DateTime<FixedOffset>) -> String {
    instant
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn decode_severity(value: &str) -> StoreResult<Severity> {
    value.parse::<Severity>().map_err(|e| StoreError::Corrupt {
        column: "severity",
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn bump_latest(latest: &mut Option<String>, stamp: String) {
    if latest.as_deref().map_or(true, |current| stamp.as_str() > current) {
        *latest = Some(stamp);
    }
}
