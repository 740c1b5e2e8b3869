//! Core forecast model and site registry for the pollen ingestor.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pollen-core";

/// Zone the provider publishes in; also the zone "today" is judged in.
pub const DEFAULT_REPORTING_ZONE: Tz = chrono_tz::Australia::Melbourne;

/// Provider-assigned monitoring site identifier.
pub type SiteId = u32;

/// Ordinal risk level shared by pollen and thunderstorm-asthma forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Extreme,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Moderate,
        Severity::High,
        Severity::Extreme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Extreme => "extreme",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown severity level {0:?}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "moderate" => Ok(Severity::Moderate),
            "high" => Ok(Severity::High),
            "extreme" => Ok(Severity::Extreme),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

/// Open pollen label. Upstream may introduce labels at any time, so this is
/// free text normalized to trimmed lower case rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollenType(String);

impl PollenType {
    pub const GRASS: &'static str = "grass";
    pub const CYPRESS: &'static str = "cypress";
    pub const MYRTLE: &'static str = "myrtle";
    pub const OLIVE: &'static str = "olive";
    pub const PLANE: &'static str = "plane";
    pub const ALTERNARIA: &'static str = "alternaria";
    pub const PLANTAIN: &'static str = "plantain";

    pub fn new(label: impl AsRef<str>) -> Self {
        Self(label.as_ref().trim().to_lowercase())
    }

    pub fn grass() -> Self {
        Self(Self::GRASS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollenSeverityRecord {
    #[serde(rename = "type")]
    pub pollen_type: PollenType,
    pub severity: Severity,
}

impl PollenSeverityRecord {
    pub fn new(pollen_type: PollenType, severity: Severity) -> Self {
        Self {
            pollen_type,
            severity,
        }
    }
}

/// Pollen outlook for one monitoring site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteForecast {
    pub site: SiteId,
    /// Date the provider says the outlook is for, when known.
    pub forecast_for: Option<DateTime<FixedOffset>>,
    pub severities: Vec<PollenSeverityRecord>,
}

impl SiteForecast {
    /// First pollen type that appears more than once, if any.
    pub fn duplicate_pollen_type(&self) -> Option<&PollenType> {
        let mut seen = BTreeSet::new();
        self.severities
            .iter()
            .map(|r| &r.pollen_type)
            .find(|t| !seen.insert(*t))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThunderstormAsthmaRecord {
    pub region: String,
    pub severity: Severity,
}

/// Regional thunderstorm-asthma table plus the provider's "last updated" stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsthmaForecast {
    pub updated_at: DateTime<FixedOffset>,
    pub records: Vec<ThunderstormAsthmaRecord>,
}

/// Complete snapshot for one calendar date. Built once per ingestion and never
/// mutated after it is handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forecast {
    pub date: DateTime<FixedOffset>,
    pub asthma_updated_at: Option<DateTime<FixedOffset>>,
    pub site_forecasts: Vec<SiteForecast>,
    pub asthma_records: Vec<ThunderstormAsthmaRecord>,
}

impl Forecast {
    pub fn pollen_record_count(&self) -> usize {
        self.site_forecasts.iter().map(|s| s.severities.len()).sum()
    }

    pub fn local_date(&self, zone: Tz) -> NaiveDate {
        local_calendar_date(&self.date, zone)
    }
}

/// Calendar date of `instant` as seen in `zone`.
pub fn local_calendar_date<T: TimeZone>(instant: &DateTime<T>, zone: Tz) -> NaiveDate {
    instant.with_timezone(&zone).date_naive()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
}

impl Site {
    pub fn new(id: SiteId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("site id {0} is listed more than once")]
    DuplicateId(SiteId),
    #[error("site id {0} has an empty name")]
    EmptyName(SiteId),
}

const BUILTIN_SITES: [(SiteId, &str); 8] = [
    (1, "melbourne"),
    (5, "dookie"),
    (6, "bendigo"),
    (7, "creswick"),
    (8, "hamilton"),
    (9, "churchill"),
    (15, "burwood"),
    (16, "geelong"),
];

/// Immutable set of monitored sites, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRegistry {
    sites: Vec<Site>,
}

impl SiteRegistry {
    pub fn new(sites: impl IntoIterator<Item = Site>) -> Result<Self, RegistryError> {
        let mut sites: Vec<Site> = sites.into_iter().collect();
        sites.sort_by_key(|s| s.id);
        for pair in sites.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(RegistryError::DuplicateId(pair[0].id));
            }
        }
        if let Some(site) = sites.iter().find(|s| s.name.trim().is_empty()) {
            return Err(RegistryError::EmptyName(site.id));
        }
        Ok(Self { sites })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Site> {
        self.sites.iter()
    }

    pub fn get(&self, id: SiteId) -> Option<&Site> {
        self.sites
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|idx| &self.sites[idx])
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self {
            sites: BUILTIN_SITES
                .iter()
                .map(|(id, name)| Site::new(*id, *name))
                .collect(),
        }
    }
}
