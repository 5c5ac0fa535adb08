//! Directory-of-documents importer
//!
//! Imports one file per `next_batch`, in file id order. Each file's data
//! covers the window from the previous file's modification time to its own;
//! the first file only seeds that window and is not imported. Every
//! observation is tagged with the file id and the number of results the
//! file produced, which is what makes re-runs skip finished files.

use crate::dedup::{UnitGuard, IMPORT_KEY_PARAMETER, RESULT_COUNT_PARAMETER};
use crate::error::{ConvertError, Result};
use crate::fetch::Locator;
use crate::model::{EntityId, EntityRef, Observation, TimeInterval, TimeObject};
use crate::sequencer::{SourceSequence, SourceUnit, TimeWindow, WindowTracker};
use crate::source::ObservationSource;
use crate::swe::{DataArray, FieldSpec, SweDecoder};
use crate::xml::Element;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

/// Turns the text of one document into observations
///
/// Parsers fill in `result` and `datastream`; the importer sets the
/// phenomenon time and the import parameters afterwards.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, content: &str) -> Result<Vec<Observation>>;
}

/// Parses a document holding a SWE `DataArray` into one observation
/// whose result is the list of values of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArrayDocumentParser {
    pub datastream_id: EntityId,
    #[serde(default = "default_value_field")]
    pub value_field: String,
    #[serde(default = "default_numeric")]
    pub numeric: bool,
}

fn default_value_field() -> String {
    "Value".to_string()
}

fn default_numeric() -> bool {
    true
}

impl DataArrayDocumentParser {
    fn parse_value(&self, raw: &str) -> std::result::Result<Value, ConvertError> {
        if !self.numeric {
            return Ok(Value::from(raw));
        }
        raw.parse::<serde_json::Number>()
            .map(Value::Number)
            .map_err(|_| ConvertError::Number(raw.to_string()))
    }
}

impl DocumentParser for DataArrayDocumentParser {
    fn parse(&self, content: &str) -> Result<Vec<Observation>> {
        let root = Element::parse(content)?;
        let mut decoder = SweDecoder::new(DataArray::find_in(&root)?);
        let spec = FieldSpec {
            name: self.value_field.clone(),
            numeric: self.numeric,
        };
        decoder.configure(&[spec]);
        decoder.parse()?;

        let mut values = Vec::with_capacity(decoder.block_count());
        while let Some(record) = decoder.next_record() {
            let Some(raw) = record.get(&self.value_field) else {
                continue;
            };
            match self.parse_value(raw) {
                Ok(value) => values.push(value),
                Err(e) => warn!(error = %e, "Dropping value"),
            }
        }

        if values.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Observation {
            result: Value::Array(values),
            datastream: Some(EntityRef::new(self.datastream_id.clone())),
            ..Default::default()
        }])
    }
}

pub struct DocumentImporter<P> {
    units: SourceSequence,
    windows: WindowTracker,
    guard: Option<Box<dyn UnitGuard>>,
    parser: P,
    sleep: Duration,
}

impl<P: DocumentParser> DocumentImporter<P> {
    pub fn new(units: SourceSequence, parser: P) -> Self {
        Self {
            units,
            windows: WindowTracker::new(),
            guard: None,
            parser,
            sleep: Duration::ZERO,
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn UnitGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Pause before reading each file
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    async fn import_unit(&self, unit: &SourceUnit, window: TimeWindow) -> Vec<Observation> {
        let content = match read_unit(unit).await {
            Ok(content) => content,
            Err(e) => {
                error!(unit = %unit.key, error = %e, "Failed to read file");
                return Vec::new();
            }
        };

        let mut observations = match self.parser.parse(&content) {
            Ok(observations) => observations,
            Err(e) => {
                error!(unit = %unit.key, error = %e, "Failed to parse file");
                return Vec::new();
            }
        };

        let phenomenon_time = TimeObject::Interval(TimeInterval::new(window.start, window.end));
        for observation in &mut observations {
            let result_count = match observation.result {
                Value::Array(ref values) => values.len(),
                _ => 1,
            };
            observation.phenomenon_time = Some(phenomenon_time);
            observation
                .parameters
                .insert(IMPORT_KEY_PARAMETER.to_string(), unit.key.to_json());
            observation
                .parameters
                .insert(RESULT_COUNT_PARAMETER.to_string(), Value::from(result_count));
        }

        info!(unit = %unit.key, observations = observations.len(), "Imported file");
        observations
    }
}

async fn read_unit(unit: &SourceUnit) -> std::io::Result<String> {
    match unit.locator {
        Locator::File(ref path) => tokio::fs::read_to_string(path).await,
        Locator::Url(ref url) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} is not a local file", url),
        )),
    }
}

async fn modified_time(unit: &SourceUnit) -> std::io::Result<DateTime<Utc>> {
    match unit.locator {
        Locator::File(ref path) => {
            let modified = tokio::fs::metadata(path).await?.modified()?;
            Ok(DateTime::<Utc>::from(modified))
        }
        Locator::Url(ref url) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} has no modification time", url),
        )),
    }
}

#[async_trait]
impl<P: DocumentParser> ObservationSource for DocumentImporter<P> {
    fn has_next(&self) -> bool {
        self.units.has_more()
    }

    async fn next_batch(&mut self) -> Result<Vec<Observation>> {
        let Some(unit) = self.units.next_unit() else {
            return Ok(Vec::new());
        };

        if let Some(ref guard) = self.guard {
            if guard.already_imported(&unit.key).await? {
                info!(unit = %unit.key, "Skipping file, already imported");
                return Ok(Vec::new());
            }
        }

        let end = match modified_time(&unit).await {
            Ok(end) => end,
            Err(e) => {
                error!(unit = %unit.key, error = %e, "Failed to read modification time");
                return Ok(Vec::new());
            }
        };

        let Some(window) = self.windows.advance(end) else {
            info!(unit = %unit.key, "First file has no start time, only recording its end time");
            return Ok(Vec::new());
        };

        if !self.sleep.is_zero() {
            info!("Sleeping {:?} before reading {}", self.sleep, unit.locator);
            tokio::time::sleep(self.sleep).await;
        }

        Ok(self.import_unit(&unit, window).await)
    }
}
