//! Provider markup extractors + the source fetcher that feeds them.
//!
//! The provider answers with JSON envelopes whose payload is an HTML
//! fragment. Extraction is strict: any structural surprise is an
//! error, never a guessed or defaulted severity.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use pollen_core::{
    AsthmaForecast, PollenSeverityRecord, PollenType, Severity, Site, SiteForecast, SiteId,
    SiteRegistry, ThunderstormAsthmaRecord, UnknownSeverity,
};
use pollen_storage::{FetchError, HttpFetcher, RequestPacer};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pollen-adapters";

pub const APP_DATA_URL: &str = "https://api.pollenforecast.com.au/app/json/app_data.php?app=1&version=4";
pub const DATA_ACQUISITION_URL: &str =
    "https://api.pollenforecast.com.au/app/json/data_acquisition.php?app=1&version=4";

const LAST_UPDATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FORECAST_DATE_FORMAT: &str = "%d %B %Y";

const SEL_TBODY: &str = "tbody";
const SEL_ROW: &str = "tr";
const SEL_STAMP_PARAGRAPH: &str = "div > p";
const SEL_FORECAST_DATE: &str = "p.date-forecast-today";
const SEL_GRASS_LEVEL: &str = "div#pollenCount div:nth-of-type(4)";
const SEL_OTHER_FORECASTS: &str = "div#other_forecasts";
const SEL_OTHER_CARD: &str = "li > div.other_card_wrapper > div.card";
const SEL_CARD_LABEL: &str = "a";
const SEL_CARD_LEVEL: &str = "div:nth-of-type(2)";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("markup has no node matching `{selector}`")]
    MissingNode { selector: &'static str },
    #[error("node matching `{selector}` has no text")]
    EmptyText { selector: &'static str },
    #[error("table row {row} splits into {lines} lines, expected at least 4")]
    RowShape { row: usize, lines: usize },
    #[error("table row {row} has an empty region")]
    EmptyRegion { row: usize },
    #[error("no paragraph carries a `Last updated: <timestamp>;` stamp")]
    MissingTimestamp,
    #[error("cannot parse {value:?} with format {format:?}: {reason}")]
    BadTimestamp {
        value: String,
        format: &'static str,
        reason: String,
    },
    #[error("local time {value} does not exist in {zone}")]
    NonexistentLocalTime { value: NaiveDateTime, zone: Tz },
    #[error(transparent)]
    Severity(#[from] UnknownSeverity),
    #[error("pollen type {0} is listed more than once")]
    DuplicatePollenType(PollenType),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector {
        selector: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("malformed {envelope} envelope: {source}")]
    Envelope {
        envelope: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Extraction {
        context: String,
        #[source]
        source: ExtractionError,
    },
}

#[derive(Debug, Deserialize)]
struct AppDataEnvelope {
    #[serde(rename = "div8")]
    thunderstorm_asthma: String,
}

#[derive(Debug, Deserialize)]
struct DataAcquisitionEnvelope {
    result: String,
}

pub fn unwrap_app_data(body: &[u8]) -> Result<String, AdapterError> {
    serde_json::from_slice::<AppDataEnvelope>(body)
        .map(|e| e.thunderstorm_asthma)
        .map_err(|source| AdapterError::Envelope {
            envelope: "app_data",
            source,
        })
}

pub fn unwrap_data_acquisition(body: &[u8]) -> Result<String, AdapterError> {
    serde_json::from_slice::<DataAcquisitionEnvelope>(body)
        .map(|e| e.result)
        .map_err(|source| AdapterError::Envelope {
            envelope: "data_acquisition",
            source,
        })
}

fn selector(css: &'static str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Selector {
        selector: css,
        reason: e.to_string(),
    })
}

fn first_node<'a>(scope: ElementRef<'a>, css: &'static str) -> Result<ElementRef<'a>, ExtractionError> {
    let sel = selector(css)?;
    scope
        .select(&sel)
        .next()
        .ok_or(ExtractionError::MissingNode { selector: css })
}

fn first_text(scope: ElementRef<'_>, css: &'static str) -> Result<String, ExtractionError> {
    let text = first_node(scope, css)?.text().collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        return Err(ExtractionError::EmptyText { selector: css });
    }
    Ok(text.to_string())
}

fn parse_local(value: &str, format: &'static str, zone: Tz) -> Result<DateTime<FixedOffset>, ExtractionError> {
    let naive = NaiveDateTime::parse_from_str(value, format).map_err(|e| {
        ExtractionError::BadTimestamp {
            value: value.to_string(),
            format,
            reason: e.to_string(),
        }
    })?;
    localize(naive, zone)
}

fn localize(naive: NaiveDateTime, zone: Tz) -> Result<DateTime<FixedOffset>, ExtractionError> {
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
        .ok_or(ExtractionError::NonexistentLocalTime { value: naive, zone })
}

/// Pull `<timestamp>` out of `... Last updated: <timestamp>; ...`.
fn last_updated_stamp(text: &str) -> Option<&str> {
    let (_, rest) = text.split_once("Last updated:")?;
    let (stamp, _) = rest.split_once(';')?;
    Some(stamp.trim())
}

/// Read one table row's text: the 2nd line is the region, the 4th the severity.
pub fn parse_asthma_row(row: usize, text: &str) -> Result<ThunderstormAsthmaRecord, ExtractionError> {
    let lines = text.split('\n').collect::<Vec<_>>();
    if lines.len() < 4 {
        return Err(ExtractionError::RowShape {
            row,
            lines: lines.len(),
        });
    }
    let region = lines[1].trim().to_lowercase();
    if region.is_empty() {
        return Err(ExtractionError::EmptyRegion { row });
    }
    let severity = lines[3].parse::<Severity>()?;
    Ok(ThunderstormAsthmaRecord { region, severity })
}

/// Extract the regional thunderstorm-asthma table and its "last updated" stamp.
pub fn extract_thunderstorm_asthma(markup: &str, zone: Tz) -> Result<AsthmaForecast, ExtractionError> {
    let document = Html::parse_document(markup);
    let root = document.root_element();

    let tbody = first_node(root, SEL_TBODY)?;
    let row_sel = selector(SEL_ROW)?;
    let records = tbody
        .select(&row_sel)
        .enumerate()
        .map(|(idx, row)| parse_asthma_row(idx, &row.text().collect::<String>()))
        .collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Err(ExtractionError::MissingNode { selector: "tbody tr" });
    }

    let paragraph_sel = selector(SEL_STAMP_PARAGRAPH)?;
    let stamp = root
        .select(&paragraph_sel)
        .find_map(|p| last_updated_stamp(&p.text().collect::<String>()).map(ToString::to_string))
        .ok_or(ExtractionError::MissingTimestamp)?;
    let updated_at = parse_local(&stamp, LAST_UPDATED_FORMAT, zone)?;

    Ok(AsthmaForecast {
        updated_at,
        records,
    })
}

/// Extract one site's pollen page: the fixed grass reading plus every
/// "other forecast" card. An empty card list is valid.
pub fn extract_pollen(markup: &str, site: SiteId, zone: Tz) -> Result<SiteForecast, ExtractionError> {
    let document = Html::parse_document(markup);
    let root = document.root_element();

    let date_text = first_text(root, SEL_FORECAST_DATE)?;
    let date = NaiveDate::parse_from_str(&date_text, FORECAST_DATE_FORMAT).map_err(|e| {
        ExtractionError::BadTimestamp {
            value: date_text.clone(),
            format: FORECAST_DATE_FORMAT,
            reason: e.to_string(),
        }
    })?;
    let forecast_for = localize(date.and_time(NaiveTime::MIN), zone)?;

    let grass = first_text(root, SEL_GRASS_LEVEL)?.parse::<Severity>()?;
    let mut severities = vec![PollenSeverityRecord::new(PollenType::grass(), grass)];

    let container = first_node(root, SEL_OTHER_FORECASTS)?;
    let card_sel = selector(SEL_OTHER_CARD)?;
    for card in container.select(&card_sel) {
        let label = first_text(card, SEL_CARD_LABEL)?;
        let level = first_text(card, SEL_CARD_LEVEL)?.parse::<Severity>()?;
        severities.push(PollenSeverityRecord::new(PollenType::new(label), level));
    }

    let forecast = SiteForecast {
        site,
        forecast_for: Some(forecast_for),
        severities,
    };
    if let Some(duplicate) = forecast.duplicate_pollen_type() {
        return Err(ExtractionError::DuplicatePollenType(duplicate.clone()));
    }
    Ok(forecast)
}

#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch_thunderstorm_asthma(&self) -> Result<AsthmaForecast, AdapterError>;

    async fn fetch_pollen_for_site(&self, site: &Site) -> Result<SiteForecast, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub app_data_url: String,
    pub data_acquisition_url: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            app_data_url: APP_DATA_URL.to_string(),
            data_acquisition_url: DATA_ACQUISITION_URL.to_string(),
        }
    }
}

/// Live provider reached over HTTP.
#[derive(Debug)]
pub struct ProviderSource {
    http: HttpFetcher,
    endpoints: ProviderEndpoints,
    zone: Tz,
}

impl ProviderSource {
    pub fn new(http: HttpFetcher, endpoints: ProviderEndpoints, zone: Tz) -> Self {
        Self {
            http,
            endpoints,
            zone,
        }
    }
}

#[async_trait]
impl ForecastSource for ProviderSource {
    async fn fetch_thunderstorm_asthma(&self) -> Result<AsthmaForecast, AdapterError> {
        let resp = self
            .http
            .fetch_bytes("thunderstorm_asthma", &self.endpoints.app_data_url, &[])
            .await?;
        let markup = unwrap_app_data(&resp.body)?;
        let forecast =
            extract_thunderstorm_asthma(&markup, self.zone).map_err(|source| AdapterError::Extraction {
                context: "thunderstorm asthma table".to_string(),
                source,
            })?;
        debug!(regions = forecast.records.len(), updated_at = %forecast.updated_at, "thunderstorm asthma extracted");
        Ok(forecast)
    }

    async fn fetch_pollen_for_site(&self, site: &Site) -> Result<SiteForecast, AdapterError> {
        let resp = self
            .http
            .fetch_bytes(
                "pollen",
                &self.endpoints.data_acquisition_url,
                &[("site_id", site.id.to_string())],
            )
            .await?;
        let markup = unwrap_data_acquisition(&resp.body)?;
        extract_pollen(&markup, site.id, self.zone).map_err(|source| AdapterError::Extraction {
            context: format!("pollen page for site {} ({})", site.id, site.name),
            source,
        })
    }
}

/// Fetch every registered site in order, pacing requests. The first failure
/// aborts the whole sweep; no partial result is returned.
pub async fn fetch_all_pollen<S>(
    source: &S,
    sites: &SiteRegistry,
    pacer: &RequestPacer,
) -> Result<Vec<SiteForecast>, AdapterError>
where
    S: ForecastSource + ?Sized,
{
    let mut out = Vec::with_capacity(sites.len());
    for site in sites.iter() {
        pacer.wait().await;
        info!(site_id = site.id, site = %site.name, "fetching pollen forecast");
        let forecast = source.fetch_pollen_for_site(site).await?;
        debug!(site_id = site.id, records = forecast.severities.len(), "pollen forecast extracted");
        out.push(forecast);
    }
    Ok(out)
}
