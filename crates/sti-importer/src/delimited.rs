//! Delimited text (CSV, TSV) records and column converters

use crate::batch::{RecordConverter, RecordReader};
use crate::error::{ConvertError, ImportError, Result};
use crate::model::{EntityId, EntityRef, Observation, TimeObject};
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A data row, with the header row of its file when there is one
#[derive(Debug, Clone)]
pub struct CsvRecord {
    headers: Option<Arc<StringRecord>>,
    fields: StringRecord,
}

impl CsvRecord {
    pub fn get(&self, column: &ColumnRef) -> Option<&str> {
        let index = match column {
            ColumnRef::Index(i) => *i,
            ColumnRef::Name(name) => self.headers.as_ref()?.iter().position(|h| h.trim() == name)?,
        };
        self.fields.get(index)
    }
}

/// Parses delimited text into [`CsvRecord`]s
#[derive(Debug, Clone)]
pub struct CsvReader {
    delimiter: u8,
    has_header: bool,
}

impl CsvReader {
    pub fn new(delimiter: u8, has_header: bool) -> Self {
        Self {
            delimiter,
            has_header,
        }
    }
}

impl Default for CsvReader {
    fn default() -> Self {
        Self::new(b',', true)
    }
}

impl RecordReader for CsvReader {
    type Record = CsvRecord;

    fn read(&self, content: &str) -> Result<Vec<CsvRecord>> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_header)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers = if self.has_header {
            let headers = reader
                .headers()
                .map_err(|e| ImportError::format(format!("Failed to read CSV header: {}", e)))?;
            Some(Arc::new(headers.clone()))
        } else {
            None
        };

        reader
            .records()
            .map(|row| {
                row.map(|fields| CsvRecord {
                    headers: headers.clone(),
                    fields,
                })
                .map_err(|e| ImportError::format(format!("Failed to read CSV row: {}", e)))
            })
            .collect()
    }
}

/// A column by header name or by zero-based index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "#{}", i),
            ColumnRef::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    #[default]
    Number,
    String,
}

/// Maps one column pair (time, result) of a row to an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConverter {
    pub datastream_id: EntityId,
    #[serde(default)]
    pub feature_of_interest_id: Option<EntityId>,
    pub result_column: ColumnRef,
    pub time_column: ColumnRef,
    /// chrono format string; RFC 3339 when absent
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub result_type: ResultType,
    /// Copied into every observation's parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ColumnConverter {
    fn parse_time(&self, raw: &str) -> std::result::Result<TimeObject, ConvertError> {
        let raw = raw.trim();
        let Some(ref format) = self.time_format else {
            return raw.parse::<TimeObject>().map_err(|e| ConvertError::time(raw, e));
        };

        if let Ok(t) = DateTime::parse_from_str(raw, format) {
            return Ok(TimeObject::Instant(t.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw, format)
            .map(|t| TimeObject::Instant(t.and_utc()))
            .map_err(|e| ConvertError::time(raw, e))
    }

    fn parse_result(&self, raw: &str) -> std::result::Result<Value, ConvertError> {
        match self.result_type {
            ResultType::String => Ok(Value::from(raw)),
            ResultType::Number => raw
                .trim()
                .parse::<serde_json::Number>()
                .map(Value::Number)
                .map_err(|_| ConvertError::Number(raw.to_string())),
        }
    }
}

impl RecordConverter<CsvRecord> for ColumnConverter {
    fn convert(&self, record: &CsvRecord) -> std::result::Result<Option<Observation>, ConvertError> {
        let raw_result = record
            .get(&self.result_column)
            .ok_or_else(|| ConvertError::MissingField(self.result_column.to_string()))?;
        if raw_result.trim().is_empty() {
            return Ok(None);
        }

        let raw_time = record
            .get(&self.time_column)
            .ok_or_else(|| ConvertError::MissingField(self.time_column.to_string()))?;

        let mut observation = Observation::new(
            self.parse_time(raw_time)?,
            self.parse_result(raw_result)?,
            self.datastream_id.clone(),
        );
        observation.feature_of_interest = self.feature_of_interest_id.clone().map(EntityRef::new);
        observation.parameters = self.parameters.clone();
        Ok(Some(observation))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn converter() -> ColumnConverter {
        ColumnConverter {
            datastream_id: EntityId::Number(3),
            feature_of_interest_id: None,
            result_column: ColumnRef::Name("value".into()),
            time_column: ColumnRef::Name("time".into()),
            time_format: None,
            result_type: ResultType::Number,
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_reads_rows_with_header() {
        let records = CsvReader::default()
            .read("time,value\n2024-01-01T00:00:00Z,1.5\n2024-01-01T01:00:00Z,2\n")
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get(&ColumnRef::Name("value".into())), Some("2"));
        assert_eq!(records[1].get(&ColumnRef::Index(0)), Some("2024-01-01T01:00:00Z"));
    }

    #[test]
    fn test_tab_delimited_without_header() {
        let records = CsvReader::new(b'\t', false).read("a\tb\nc\td\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get(&ColumnRef::Index(1)), Some("b"));
        assert_eq!(records[0].get(&ColumnRef::Name("b".into())), None);
    }

    #[test]
    fn test_converts_row() {
        let records = CsvReader::default()
            .read("time,value\n2024-01-01T00:00:00Z,1.5\n")
            .unwrap();
        let mut conv = converter();
        conv.feature_of_interest_id = Some(EntityId::Number(9));
        conv.parameters.insert("source".into(), json!("csv"));

        let obs = conv.convert(&records[0]).unwrap().unwrap();
        assert_eq!(obs.result, json!(1.5));
        assert_eq!(obs.phenomenon_time.unwrap().to_string(), "2024-01-01T00:00:00Z");
        assert_eq!(obs.datastream, Some(EntityRef::new(EntityId::Number(3))));
        assert_eq!(obs.feature_of_interest, Some(EntityRef::new(EntityId::Number(9))));
        assert_eq!(obs.parameters.get("source"), Some(&json!("csv")));
    }

    #[test]
    fn test_empty_cell_means_no_observation() {
        let records = CsvReader::default().read("time,value\n2024-01-01T00:00:00Z,\n").unwrap();
        assert!(converter().convert(&records[0]).unwrap().is_none());
    }

    #[test]
    fn test_bad_values_are_record_errors() {
        let records = CsvReader::default()
            .read("time,value\n2024-01-01T00:00:00Z,abc\nyesterday,1\n")
            .unwrap();
        assert!(matches!(
            converter().convert(&records[0]),
            Err(ConvertError::Number(_))
        ));
        assert!(matches!(
            converter().convert(&records[1]),
            Err(ConvertError::Time { .. })
        ));
    }

    #[test]
    fn test_custom_time_format_without_zone_is_utc() {
        let records = CsvReader::new(b';', true)
            .read("time;value\n01.02.2024 13:30;7\n")
            .unwrap();
        let mut conv = converter();
        conv.time_format = Some("%d.%m.%Y %H:%M".into());

        let obs = conv.convert(&records[0]).unwrap().unwrap();
        assert_eq!(obs.phenomenon_time.unwrap().to_string(), "2024-02-01T13:30:00Z");
        assert_eq!(obs.result, json!(7));
    }

    #[test]
    fn test_string_results() {
        let records = CsvReader::default()
            .read("time,value\n2024-01-01T00:00:00Z,clear\n")
            .unwrap();
        let mut conv = converter();
        conv.result_type = ResultType::String;
        assert_eq!(conv.convert(&records[0]).unwrap().unwrap().result, json!("clear"));
    }
}
