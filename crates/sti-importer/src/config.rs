//! Importer configuration
//!
//! One TOML file describes a run: the SensorThings service to write to and
//! exactly one importer. Every option has a default except the ones that
//! only the operator can know (source URLs, converters, target datastreams).
//!
//! ```toml
//! [service]
//! base_url = "http://localhost:8080/FROST-Server/v1.1"
//!
//! [importer]
//! kind = "csv"
//! urls = ["https://example.org/data.csv"]
//! has_header = true
//!
//! [[importer.converters]]
//! datastream_id = 12
//! result_column = "value"
//! time_column = "time"
//! ```

use crate::delimited::ColumnConverter;
use crate::documents::DataArrayDocumentParser;
use crate::model::{Datastream, EntityId};
use crate::sequencer::compile_file_pattern;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sti_common::{Result, StiError};
use url::Url;

/// Overrides `service.base_url`
pub const ENV_SERVICE_URL: &str = "STI_SERVICE_URL";
/// Overrides `service.timeout_secs`
pub const ENV_SERVICE_TIMEOUT: &str = "STI_SERVICE_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImporterConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub importer: ImporterKind,
}

impl ImporterConfig {
    /// Load, apply environment overrides and validate
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without overrides or validation
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| StiError::parse(format!("Invalid configuration: {}", e)))
    }

    /// Apply `STI_SERVICE_*` overrides, looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVICE_URL) {
            self.service.base_url = url;
        }
        if let Some(timeout) = lookup(ENV_SERVICE_TIMEOUT) {
            self.service.timeout_secs = timeout.trim().parse().map_err(|_| {
                StiError::config(format!("{} must be a number of seconds, got '{}'", ENV_SERVICE_TIMEOUT, timeout))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        match self.importer {
            ImporterKind::Csv(ref csv) => csv.validate(),
            ImporterKind::Documents(ref documents) => documents.validate(),
            ImporterKind::Aqd(ref aqd) => aqd.validate(),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root of the SensorThings API, version segment included
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout in seconds (default: 60)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `$top` for cache preload queries (default: 1000)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Log creates and updates instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

fn default_base_url() -> String {
    "http://localhost:8080/FROST-Server/v1.1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_page_size() -> usize {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            dry_run: false,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| StiError::config(format!("service.base_url '{}' is not a URL: {}", self.base_url, e)))?;
        if self.timeout_secs == 0 {
            return Err(StiError::config("service.timeout_secs must be greater than 0"));
        }
        if self.page_size == 0 {
            return Err(StiError::config("service.page_size must be greater than 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Importers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImporterKind {
    /// Delimited text from URLs or files
    Csv(CsvConfig),
    /// A directory of documents, one unit per file
    Documents(DocumentsConfig),
    /// Air quality e-reporting feeds (WFS features, SOS observations)
    Aqd(AqdConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvConfig {
    /// http(s) and ftp URLs or local paths, imported in order
    pub urls: Vec<String>,
    /// Leading rows of each source to drop
    #[serde(default)]
    pub row_skip: usize,
    /// Last row of each source to import, 0 for all
    #[serde(default)]
    pub row_limit: usize,
    /// Charset of HTTP bodies that do not declare one (default: UTF-8)
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Single character, `\t` for tab (default: `,`)
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub has_header: bool,
    pub converters: Vec<ColumnConverter>,
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl CsvConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_str() {
            "\\t" | "\t" => Ok(b'\t'),
            d if d.len() == 1 => Ok(d.as_bytes()[0]),
            d => Err(StiError::config(format!(
                "importer.delimiter must be a single ASCII character, got '{}'",
                d
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(StiError::config("importer.urls must name at least one source"));
        }
        if self.converters.is_empty() {
            return Err(StiError::config("importer.converters must not be empty"));
        }
        if self.charset.trim().is_empty() {
            return Err(StiError::config("importer.charset must not be empty"));
        }
        self.delimiter_byte()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// Directory holding the documents (default: `./importFiles`)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Regex with one capture group holding the numeric file id
    pub file_id_regex: String,
    /// Leave the newest file alone, it may still be written
    #[serde(default)]
    pub skip_last: bool,
    /// Pause before each file
    #[serde(default)]
    pub sleep_secs: u64,
    /// Datastream checked for already imported file ids
    #[serde(default)]
    pub check_datastream_id: Option<EntityId>,
    pub parser: DataArrayDocumentParser,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./importFiles")
}

impl DocumentsConfig {
    pub fn sleep(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sleep_secs)
    }

    fn validate(&self) -> Result<()> {
        compile_file_pattern(&self.file_id_regex).map_err(|e| StiError::config(e.to_string()))?;
        if self.parser.value_field.trim().is_empty() {
            return Err(StiError::config("importer.parser.value_field must not be empty"));
        }
        Ok(())
    }
}

const AQD_WFS: &str = "http://luft.umweltbundesamt.at/inspire/wfs?service=WFS&version=2.0.0&request=GetFeature&typeName=";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqdConfig {
    /// Reconcile stations, processes, samples and sampling points before
    /// importing observations
    #[serde(default)]
    pub full_import: bool,
    #[serde(default = "default_stations_url")]
    pub stations_url: String,
    #[serde(default = "default_processes_url")]
    pub processes_url: String,
    #[serde(default = "default_samples_url")]
    pub samples_url: String,
    #[serde(default = "default_sampling_points_url")]
    pub sampling_points_url: String,
    /// Template with `{datastreamLocalId}` and `{phenomenonTimeInterval}`
    #[serde(default = "default_observations_url")]
    pub observations_url: String,
    /// Value of the `owner` property on every entity this importer manages
    #[serde(default = "default_entity_owner")]
    pub entity_owner: String,
    #[serde(default = "default_field_start_time")]
    pub field_start_time: String,
    #[serde(default = "default_field_end_time")]
    pub field_end_time: String,
    #[serde(default = "default_field_value")]
    pub field_value: String,
    #[serde(default)]
    pub start_time: StartTimeConfig,
}

fn default_stations_url() -> String {
    format!("{}aqd:AQD_Station", AQD_WFS)
}

fn default_processes_url() -> String {
    format!("{}aqd:AQD_SamplingPointProcess", AQD_WFS)
}

fn default_samples_url() -> String {
    format!("{}aqd:AQD_Sample", AQD_WFS)
}

fn default_sampling_points_url() -> String {
    format!("{}aqd:AQD_SamplingPoint", AQD_WFS)
}

fn default_observations_url() -> String {
    "http://luft.umweltbundesamt.at/inspire/sos?service=SOS&version=2.0.0&request=getObservation&offering=urn:STA/{datastreamLocalId}&eventTime={phenomenonTimeInterval}".to_string()
}

fn default_entity_owner() -> String {
    "http://luft.umweltbundesamt.at".to_string()
}

fn default_field_start_time() -> String {
    "StartTime".to_string()
}

fn default_field_end_time() -> String {
    "EndTime".to_string()
}

fn default_field_value() -> String {
    "Value".to_string()
}

impl Default for AqdConfig {
    fn default() -> Self {
        Self {
            full_import: false,
            stations_url: default_stations_url(),
            processes_url: default_processes_url(),
            samples_url: default_samples_url(),
            sampling_points_url: default_sampling_points_url(),
            observations_url: default_observations_url(),
            entity_owner: default_entity_owner(),
            field_start_time: default_field_start_time(),
            field_end_time: default_field_end_time(),
            field_value: default_field_value(),
            start_time: StartTimeConfig::default(),
        }
    }
}

impl AqdConfig {
    fn validate(&self) -> Result<()> {
        if self.entity_owner.trim().is_empty() {
            return Err(StiError::config("importer.entity_owner must not be empty"));
        }
        if !self.observations_url.contains("{datastreamLocalId}") {
            return Err(StiError::config(
                "importer.observations_url must contain the {datastreamLocalId} placeholder",
            ));
        }
        for (name, value) in [
            ("field_start_time", &self.field_start_time),
            ("field_end_time", &self.field_end_time),
            ("field_value", &self.field_value),
        ] {
            if value.trim().is_empty() {
                return Err(StiError::config(format!("importer.{} must not be empty", name)));
            }
        }
        self.start_time.validate()
    }
}

/// Where the observation window of each datastream starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTimeConfig {
    /// A fixed number of hours before now
    HoursAgo(i64),
    /// A fixed instant
    Fixed(DateTime<Utc>),
    /// The end of the datastream's phenomenon time, or `fallback_hours`
    /// before now for datastreams without observations
    LatestObservation { fallback_hours: i64 },
}

impl Default for StartTimeConfig {
    fn default() -> Self {
        StartTimeConfig::HoursAgo(24)
    }
}

impl StartTimeConfig {
    pub fn start_for(&self, datastream: &Datastream, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            StartTimeConfig::HoursAgo(hours) => now - Duration::hours(hours),
            StartTimeConfig::Fixed(start) => start,
            StartTimeConfig::LatestObservation { fallback_hours } => datastream
                .phenomenon_time
                .map(|t| t.end())
                .unwrap_or_else(|| now - Duration::hours(fallback_hours)),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            StartTimeConfig::HoursAgo(hours) | StartTimeConfig::LatestObservation { fallback_hours: hours }
                if hours < 0 =>
            {
                Err(StiError::config("importer.start_time hours must not be negative"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{TimeInterval, TimeObject};

    const CSV: &str = r#"
[importer]
kind = "csv"
urls = ["https://example.org/a.csv", "./b.csv"]
row_skip = 1
delimiter = "\\t"
has_header = true

[[importer.converters]]
datastream_id = 12
result_column = "value"
time_column = 0
"#;

    #[test]
    fn test_csv_config_with_defaults() {
        let config = ImporterConfig::from_toml_str(CSV).unwrap();
        config.validate().unwrap();

        assert_eq!(config.service, ServiceConfig::default());
        let ImporterKind::Csv(ref csv) = config.importer else {
            panic!("expected csv importer");
        };
        assert_eq!(csv.row_skip, 1);
        assert_eq!(csv.row_limit, 0);
        assert_eq!(csv.charset, "UTF-8");
        assert_eq!(csv.delimiter_byte().unwrap(), b'\t');
        assert_eq!(csv.converters[0].datastream_id, EntityId::Number(12));
    }

    #[test]
    fn test_overrides_replace_service_settings() {
        let mut config = ImporterConfig::from_toml_str(CSV).unwrap();
        config
            .apply_overrides(|key| match key {
                ENV_SERVICE_URL => Some("http://frost:8080/v1.1".to_string()),
                ENV_SERVICE_TIMEOUT => Some("5".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.service.base_url, "http://frost:8080/v1.1");
        assert_eq!(config.service.timeout_secs, 5);

        let err = config
            .apply_overrides(|key| (key == ENV_SERVICE_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, StiError::Config(_)));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let no_converters = r#"
[importer]
kind = "csv"
urls = ["a.csv"]
converters = []
"#;
        let config = ImporterConfig::from_toml_str(no_converters).unwrap();
        assert!(config.validate().is_err());

        let bad_pattern = r#"
[importer]
kind = "documents"
file_id_regex = "data_[0-9]+"

[importer.parser]
datastream_id = 3
"#;
        let config = ImporterConfig::from_toml_str(bad_pattern).unwrap();
        assert!(config.validate().is_err());

        assert!(ImporterConfig::from_toml_str("[importer]\nkind = \"xml\"\n").is_err());
    }

    #[test]
    fn test_aqd_start_time_variants() {
        let raw = r#"
[service]
dry_run = true

[importer]
kind = "aqd"
full_import = true
start_time = { latest_observation = { fallback_hours = 6 } }
"#;
        let config = ImporterConfig::from_toml_str(raw).unwrap();
        config.validate().unwrap();
        assert!(config.service.dry_run);
        let ImporterKind::Aqd(ref aqd) = config.importer else {
            panic!("expected aqd importer");
        };
        assert_eq!(aqd.field_value, "Value");
        assert!(aqd.observations_url.contains("{phenomenonTimeInterval}"));

        let now: DateTime<Utc> = "2024-03-01T12:00:00Z".parse().unwrap();
        let mut datastream = Datastream::default();
        assert_eq!(
            aqd.start_time.start_for(&datastream, now),
            "2024-03-01T06:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );

        let latest: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        datastream.phenomenon_time = Some(TimeObject::Interval(TimeInterval::new(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            latest,
        )));
        assert_eq!(aqd.start_time.start_for(&datastream, now), latest);

        let fixed: StartTimeConfig = toml::from_str::<AqdConfig>(
            "start_time = { fixed = \"2024-02-01T00:00:00Z\" }",
        )
        .unwrap()
        .start_time;
        assert_eq!(
            fixed.start_for(&datastream, now),
            "2024-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_documents_config() {
        let raw = r#"
[importer]
kind = "documents"
file_id_regex = "obs_([0-9]+)\\.xml"
skip_last = true
check_datastream_id = 7

[importer.parser]
datastream_id = 3
"#;
        let config = ImporterConfig::from_toml_str(raw).unwrap();
        config.validate().unwrap();
        let ImporterKind::Documents(ref documents) = config.importer else {
            panic!("expected documents importer");
        };
        assert_eq!(documents.data_path, PathBuf::from("./importFiles"));
        assert_eq!(documents.check_datastream_id, Some(EntityId::Number(7)));
        assert_eq!(documents.parser.value_field, "Value");
        assert!(documents.parser.numeric);
    }
}
