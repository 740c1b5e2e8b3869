//! Ingestion orchestration: configuration, the once-per-day guard, forecast
//! assembly and the periodic ticker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, SubsecRound, Utc};
use chrono_tz::Tz;
use pollen_adapters::{fetch_all_pollen, AdapterError, ForecastSource, ProviderEndpoints, ProviderSource};
use pollen_core::{local_calendar_date, AsthmaForecast, Forecast, Site, SiteForecast, SiteRegistry};
use pollen_storage::{ForecastStore, HttpClientConfig, HttpFetcher, RequestPacer, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pollen-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub zone: Tz,
    pub sites_file: Option<PathBuf>,
    pub endpoints: ProviderEndpoints,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pacing: Duration,
    pub schedule_cron: String,
    pub port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ProviderEndpoints::default();
        let zone_name = lookup("POLLEN_TIMEZONE").unwrap_or_else(|| "Australia/Melbourne".to_string());
        let zone = zone_name
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid POLLEN_TIMEZONE {zone_name:?}: {err}"))?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://pollen.db".to_string()),
            zone,
            sites_file: lookup("POLLEN_SITES_FILE").map(PathBuf::from),
            endpoints: ProviderEndpoints {
                app_data_url: lookup("POLLEN_APP_DATA_URL").unwrap_or(defaults.app_data_url),
                data_acquisition_url: lookup("POLLEN_DATA_ACQUISITION_URL")
                    .unwrap_or(defaults.data_acquisition_url),
            },
            user_agent: lookup("POLLEN_USER_AGENT").unwrap_or_else(|| "pollen-bot/0.1".to_string()),
            http_timeout_secs: parse_or("POLLEN_HTTP_TIMEOUT_SECS", &lookup, 20)?,
            pacing: Duration::from_millis(parse_or("POLLEN_PACING_MS", &lookup, 1000)?),
            schedule_cron: lookup("POLLEN_SCHEDULE_CRON").unwrap_or_else(|| "0 5 * * * *".to_string()),
            port: parse_or("PORT", &lookup, 8080)?,
        })
    }

    /// Registry from `sites_file` when set, otherwise the built-in provider sites.
    pub fn site_registry(&self) -> Result<SiteRegistry> {
        match &self.sites_file {
            Some(path) => load_site_registry(path),
            None => Ok(SiteRegistry::default()),
        }
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid {key} value {raw:?}: {err}")),
        None => Ok(default),
    }
}

#[derive(Debug, Deserialize)]
struct SitesFile {
    sites: Vec<Site>,
}

pub fn load_site_registry(path: &Path) -> Result<SiteRegistry> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: SitesFile =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    SiteRegistry::new(parsed.sites).with_context(|| format!("validating {}", path.display()))
}

/// True unless the latest stored forecast already falls on today's calendar
/// date in `zone`. An empty store always ingests.
pub fn should_ingest(latest: Option<&DateTime<FixedOffset>>, now: DateTime<Utc>, zone: Tz) -> bool {
    match latest {
        None => true,
        Some(latest) => local_calendar_date(latest, zone) != local_calendar_date(&now, zone),
    }
}

/// Combine one asthma table and the per-site pollen outlooks into the
/// aggregate stamped with the capture instant.
pub fn assemble_forecast(
    asthma: AsthmaForecast,
    site_forecasts: Vec<SiteForecast>,
    captured_at: DateTime<Utc>,
    zone: Tz,
) -> Forecast {
    Forecast {
        // Storage keeps microseconds.
        date: captured_at.trunc_subsecs(6).with_timezone(&zone).fixed_offset(),
        asthma_updated_at: Some(asthma.updated_at),
        site_forecasts,
        asthma_records: asthma.records,
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching forecasts failed: {0}")]
    Source(#[from] AdapterError),
    #[error("persisting forecast failed: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Skipped {
        latest: DateTime<FixedOffset>,
    },
    Ingested {
        run_id: Uuid,
        date: DateTime<FixedOffset>,
        sites: usize,
        regions: usize,
    },
}

pub struct IngestionPipeline {
    store: ForecastStore,
    source: Arc<dyn ForecastSource>,
    sites: SiteRegistry,
    pacer: RequestPacer,
    zone: Tz,
    ingest_lock: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        store: ForecastStore,
        source: Arc<dyn ForecastSource>,
        sites: SiteRegistry,
        pacer: RequestPacer,
    ) -> Self {
        let zone = store.zone();
        Self {
            store,
            source,
            sites,
            pacer,
            zone,
            ingest_lock: Mutex::new(()),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let sites = config.site_registry()?;
        let store = ForecastStore::connect(&config.database_url, config.zone, sites.clone())
            .await
            .with_context(|| format!("opening store at {}", config.database_url))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = ProviderSource::new(http, config.endpoints.clone(), config.zone);
        Ok(Self::new(store, Arc::new(source), sites, RequestPacer::new(config.pacing)))
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn sites(&self) -> &SiteRegistry {
        &self.sites
    }

    /// Today's calendar date in the reporting zone.
    pub fn today(&self) -> NaiveDate {
        local_calendar_date(&Utc::now(), self.zone)
    }

    pub async fn run_if_needed(&self) -> Result<IngestOutcome, IngestError> {
        self.run_if_needed_at(Utc::now()).await
    }

    /// Ingest unless a forecast for `now`'s local date is already stored.
    /// Attempts within this process are serialized.
    pub async fn run_if_needed_at(&self, now: DateTime<Utc>) -> Result<IngestOutcome, IngestError> {
        let _guard = self.ingest_lock.lock().await;
        let run_id = Uuid::new_v4();
        let result = self
            .ingest(run_id, now)
            .instrument(info_span!("ingestion", %run_id))
            .await;
        if let Err(err) = &result {
            error!(%run_id, error = %err, "ingestion failed; stored data left untouched");
        }
        result
    }

    async fn ingest(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<IngestOutcome, IngestError> {
        self.store.seed_sites(&self.sites).await?;

        let latest = match self.store.latest_date().await {
            Ok(latest) => Some(latest),
            Err(StoreError::NotFound) => {
                info!("store is empty; bootstrapping");
                None
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(latest) = latest {
            if !should_ingest(Some(&latest), now, self.zone) {
                info!(%latest, "forecast for today already stored");
                return Ok(IngestOutcome::Skipped { latest });
            }
        }

        info!("fetching thunderstorm asthma forecast");
        let asthma = self.source.fetch_thunderstorm_asthma().await?;
        let pollen = fetch_all_pollen(self.source.as_ref(), &self.sites, &self.pacer).await?;

        let forecast = assemble_forecast(asthma, pollen, now, self.zone);
        let summary = self.store.insert_forecast(&forecast).await?;
        info!(
            date = %forecast.date,
            pollen_rows = summary.pollen_rows,
            asthma_rows = summary.asthma_rows,
            "forecast ingested"
        );

        Ok(IngestOutcome::Ingested {
            run_id,
            date: forecast.date,
            sites: forecast.site_forecasts.len(),
            regions: forecast.asthma_records.len(),
        })
    }

    pub async fn latest_forecast_date(&self) -> StoreResult<DateTime<FixedOffset>> {
        self.store.latest_date().await
    }

    pub async fn forecast_for(&self, date: NaiveDate) -> StoreResult<Forecast> {
        self.store.select_forecast(date).await
    }
}

/// Scheduler that calls `run_if_needed` on `cron`. Failed runs are logged and
/// picked up again on the next tick.
pub async fn build_scheduler(pipeline: Arc<IngestionPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_if_needed().await {
                Ok(outcome) => info!(?outcome, "scheduled ingestion finished"),
                Err(err) => error!(error = %err, "scheduled ingestion failed; retrying next tick"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_once_from_env() -> Result<IngestOutcome> {
    let config = SyncConfig::from_env()?;
    let pipeline = IngestionPipeline::from_config(&config).await?;
    Ok(pipeline.run_if_needed().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use pollen_core::{
        PollenSeverityRecord, PollenType, Severity, ThunderstormAsthmaRecord, DEFAULT_REPORTING_ZONE,
    };
    use pollen_adapters::ExtractionError;

    const ZONE: Tz = DEFAULT_REPORTING_ZONE;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[derive(Default)]
    struct StubSource {
        asthma_calls: AtomicUsize,
        pollen_calls: AtomicUsize,
        fail_pollen: AtomicBool,
        blank_region: AtomicBool,
    }

    impl StubSource {
        fn calls(&self) -> usize {
            self.asthma_calls.load(Ordering::SeqCst) + self.pollen_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ForecastSource for StubSource {
        async fn fetch_thunderstorm_asthma(&self) -> Result<AsthmaForecast, AdapterError> {
            self.asthma_calls.fetch_add(1, Ordering::SeqCst);
            let mut records = vec![
                ThunderstormAsthmaRecord {
                    region: "central".into(),
                    severity: Severity::Low,
                },
                ThunderstormAsthmaRecord {
                    region: "mallee".into(),
                    severity: Severity::High,
                },
            ];
            // Passes extraction but fails the store's region check.
            if self.blank_region.load(Ordering::SeqCst) {
                records[1].region.clear();
            }
            Ok(AsthmaForecast {
                updated_at: ZONE
                    .with_ymd_and_hms(2024, 3, 1, 10, 45, 12)
                    .single()
                    .unwrap()
                    .fixed_offset(),
                records,
            })
        }

        async fn fetch_pollen_for_site(&self, site: &Site) -> Result<SiteForecast, AdapterError> {
            self.pollen_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_pollen.load(Ordering::SeqCst) {
                return Err(AdapterError::Extraction {
                    context: format!("pollen page for site {}", site.id),
                    source: ExtractionError::EmptyText {
                        selector: "p.date-forecast-today",
                    },
                });
            }
            Ok(SiteForecast {
                site: site.id,
                forecast_for: None,
                severities: vec![
                    PollenSeverityRecord::new(PollenType::grass(), Severity::Moderate),
                    PollenSeverityRecord::new(PollenType::new("olive"), Severity::Low),
                ],
            })
        }
    }

    fn two_sites() -> SiteRegistry {
        SiteRegistry::new(vec![Site::new(1, "melbourne"), Site::new(6, "bendigo")]).unwrap()
    }

    async fn pipeline(source: Arc<StubSource>) -> IngestionPipeline {
        let store = ForecastStore::open_in_memory(ZONE, two_sites()).await.unwrap();
        IngestionPipeline::new(store, source, two_sites(), RequestPacer::disabled())
    }

    #[test]
    fn guard_skips_when_latest_is_same_local_day() {
        let latest = utc(2024, 3, 1, 10, 0).fixed_offset();
        // 09:00 UTC on 1 March is 20:00 local, still 1 March in Melbourne.
        assert!(!should_ingest(Some(&latest), utc(2024, 3, 1, 9, 0), ZONE));
        assert!(should_ingest(Some(&latest), utc(2024, 3, 2, 10, 0), ZONE));
        assert!(should_ingest(None, utc(2024, 3, 1, 9, 0), ZONE));
    }

    #[test]
    fn guard_compares_dates_in_reporting_zone_not_utc() {
        // 23:30 UTC on 29 Feb is already 1 March in Melbourne.
        let latest = utc(2024, 2, 29, 23, 30).fixed_offset();
        assert!(!should_ingest(Some(&latest), utc(2024, 3, 1, 5, 0), ZONE));
        assert!(should_ingest(Some(&latest), utc(2024, 3, 1, 5, 0), chrono_tz::UTC));
    }

    #[test]
    fn assembled_forecast_is_stamped_with_capture_instant() {
        let asthma = AsthmaForecast {
            updated_at: utc(2024, 3, 1, 0, 0).fixed_offset(),
            records: vec![],
        };
        let captured = utc(2024, 3, 1, 14, 30);
        let forecast = assemble_forecast(asthma, vec![], captured, ZONE);
        assert_eq!(forecast.date, captured);
        assert_eq!(forecast.local_date(ZONE), day(2024, 3, 2));
        assert_eq!(forecast.asthma_updated_at, Some(utc(2024, 3, 1, 0, 0).fixed_offset()));
    }

    #[tokio::test]
    async fn empty_store_is_bootstrapped_then_same_day_run_is_skipped() {
        let source = Arc::new(StubSource::default());
        let pipeline = pipeline(source.clone()).await;
        assert!(matches!(
            pipeline.latest_forecast_date().await,
            Err(StoreError::NotFound)
        ));

        let first = pipeline.run_if_needed_at(utc(2024, 3, 1, 1, 0)).await.unwrap();
        match first {
            IngestOutcome::Ingested { sites, regions, .. } => {
                assert_eq!(sites, 2);
                assert_eq!(regions, 2);
            }
            other => panic!("expected ingestion, got {other:?}"),
        }
        assert_eq!(source.calls(), 3);

        let second = pipeline.run_if_needed_at(utc(2024, 3, 1, 9, 0)).await.unwrap();
        assert!(matches!(second, IngestOutcome::Skipped { .. }));
        assert_eq!(source.calls(), 3, "skipped run must not touch the source");

        let stored = pipeline.forecast_for(day(2024, 3, 1)).await.unwrap();
        assert_eq!(stored.pollen_record_count(), 4);
        assert_eq!(stored.asthma_records.len(), 2);
    }

    #[tokio::test]
    async fn next_local_day_triggers_a_fresh_ingestion() {
        let source = Arc::new(StubSource::default());
        let pipeline = pipeline(source.clone()).await;
        pipeline.run_if_needed_at(utc(2024, 3, 1, 1, 0)).await.unwrap();
        let next = pipeline.run_if_needed_at(utc(2024, 3, 1, 14, 0)).await.unwrap();
        assert!(matches!(next, IngestOutcome::Ingested { .. }));
        assert_eq!(
            pipeline.latest_forecast_date().await.unwrap(),
            utc(2024, 3, 1, 14, 0)
        );
    }

    #[tokio::test]
    async fn source_failure_leaves_prior_forecast_untouched() {
        let source = Arc::new(StubSource::default());
        let pipeline = pipeline(source.clone()).await;
        pipeline.run_if_needed_at(utc(2024, 3, 1, 1, 0)).await.unwrap();

        source.fail_pollen.store(true, Ordering::SeqCst);
        let err = pipeline.run_if_needed_at(utc(2024, 3, 2, 1, 0)).await.unwrap_err();
        assert!(matches!(err, IngestError::Source(_)));
        assert_eq!(
            pipeline.latest_forecast_date().await.unwrap(),
            utc(2024, 3, 1, 1, 0)
        );
        let empty = pipeline.forecast_for(day(2024, 3, 2)).await.unwrap();
        assert_eq!(empty.pollen_record_count(), 0);
        assert!(empty.asthma_records.is_empty());
    }

    #[tokio::test]
    async fn failed_asthma_write_is_retried_the_same_day() {
        let source = Arc::new(StubSource::default());
        let pipeline = pipeline(source.clone()).await;

        source.blank_region.store(true, Ordering::SeqCst);
        let err = pipeline.run_if_needed_at(utc(2024, 3, 1, 1, 0)).await.unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));
        let partial = pipeline.forecast_for(day(2024, 3, 1)).await.unwrap();
        assert_eq!(partial.pollen_record_count(), 4);
        assert!(partial.asthma_records.is_empty());

        source.blank_region.store(false, Ordering::SeqCst);
        let retry = pipeline.run_if_needed_at(utc(2024, 3, 1, 2, 0)).await.unwrap();
        assert!(matches!(retry, IngestOutcome::Ingested { .. }));

        let stored = pipeline.forecast_for(day(2024, 3, 1)).await.unwrap();
        assert_eq!(stored.pollen_record_count(), 4);
        assert_eq!(stored.asthma_records.len(), 2);
        assert_eq!(
            pipeline.latest_forecast_date().await.unwrap(),
            utc(2024, 3, 1, 2, 0)
        );

        let again = pipeline.run_if_needed_at(utc(2024, 3, 1, 3, 0)).await.unwrap();
        assert!(matches!(again, IngestOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn concurrent_triggers_ingest_once() {
        let source = Arc::new(StubSource::default());
        let pipeline = pipeline(source.clone()).await;
        let now = utc(2024, 3, 1, 1, 0);
        let (a, b) = tokio::join!(pipeline.run_if_needed_at(now), pipeline.run_if_needed_at(now));
        let ingested = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|o| matches!(o, IngestOutcome::Ingested { .. }))
            .count();
        assert_eq!(ingested, 1);
        assert_eq!(source.asthma_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_url, "sqlite://pollen.db");
        assert_eq!(config.zone, ZONE);
        assert_eq!(config.pacing, Duration::from_millis(1000));
        assert_eq!(config.port, 8080);
        assert_eq!(config.site_registry().unwrap().len(), 8);

        let env = HashMap::from([
            ("POLLEN_TIMEZONE", "Australia/Sydney"),
            ("POLLEN_PACING_MS", "250"),
            ("PORT", "9000"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.zone, chrono_tz::Australia::Sydney);
        assert_eq!(config.pacing, Duration::from_millis(250));
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn config_rejects_bad_zone_and_numbers() {
        let bad_zone = HashMap::from([("POLLEN_TIMEZONE", "Mars/Olympus")]);
        assert!(SyncConfig::from_lookup(|k| bad_zone.get(k).map(|v| v.to_string())).is_err());
        let bad_port = HashMap::from([("PORT", "eighty")]);
        assert!(SyncConfig::from_lookup(|k| bad_port.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn site_registry_loads_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sites:\n  - id: 6\n    name: bendigo\n  - id: 1\n    name: melbourne").unwrap();
        let registry = load_site_registry(file.path()).unwrap();
        assert_eq!(registry.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 6]);

        let mut dup = tempfile::NamedTempFile::new().unwrap();
        writeln!(dup, "sites:\n  - id: 1\n    name: a\n  - id: 1\n    name: b").unwrap();
        assert!(load_site_registry(dup.path()).is_err());
    }

    #[test]
    fn bundled_sites_file_matches_builtin_registry() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sites.yaml");
        assert_eq!(load_site_registry(&path).unwrap(), SiteRegistry::default());
    }

    #[tokio::test]
    async fn scheduler_rejects_malformed_cron() {
        let pipeline = Arc::new(pipeline(Arc::new(StubSource::default())).await);
        assert!(build_scheduler(pipeline.clone(), "0 5 * * * *").await.is_ok());
        assert!(build_scheduler(pipeline, "every hour").await.is_err());
    }
}
