//! Ordering of source units and their time windows
//!
//! A source unit is one file or one URL. In URL-list mode units come in the
//! configured order, keyed by position. In directory mode each file name is
//! matched against a pattern whose first capture group is a numeric id;
//! units are then ordered by that id.

use crate::error::{ImportError, Result};
use crate::fetch::Locator;
use crate::service::FilterLiteral;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Identity of a source unit, used for ordering and deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitKey {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Numeric(n) => write!(f, "{}", n),
            UnitKey::Text(s) => f.write_str(s),
        }
    }
}

impl FilterLiteral for UnitKey {
    fn to_literal(&self) -> String {
        match self {
            UnitKey::Numeric(n) => n.to_literal(),
            UnitKey::Text(s) => s.to_literal(),
        }
    }
}

impl UnitKey {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            UnitKey::Numeric(n) => serde_json::Value::from(*n),
            UnitKey::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// One file or URL to import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub key: UnitKey,
    pub locator: Locator,
}

/// Half-open interval `[start, end)` covered by a unit's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Remaining units, in import order
#[derive(Debug, Clone, Default)]
pub struct SourceSequence {
    units: VecDeque<SourceUnit>,
}

impl SourceSequence {
    /// Units for a list of URLs, keyed by position
    pub fn from_locators(locators: impl IntoIterator<Item = Locator>) -> Self {
        let units = locators
            .into_iter()
            .enumerate()
            .map(|(index, locator)| SourceUnit {
                key: UnitKey::Numeric(index as i64),
                locator,
            })
            .collect();
        Self { units }
    }

    /// Units for the files of `dir` whose names match `pattern`
    ///
    /// The first capture group must parse as an integer; that integer is the
    /// unit key and the sort order. Names that do not match are skipped.
    /// With `skip_last` the unit with the largest key is dropped, since it
    /// may still be being written.
    pub fn from_directory(dir: &Path, pattern: &Regex, skip_last: bool) -> Result<Self> {
        if !dir.is_dir() {
            return Err(ImportError::DirectoryNotFound(dir.display().to_string()));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        let mut by_key: BTreeMap<i64, String> = BTreeMap::new();
        for name in names {
            let id = pattern
                .captures(&name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<i64>().ok());
            match id {
                Some(id) => {
                    if let Some(previous) = by_key.insert(id, name.clone()) {
                        warn!(
                            "Files {} and {} share id {}, using {}",
                            previous, name, id, name
                        );
                    }
                }
                None => info!("File {} does not match the file id pattern, skipping", name),
            }
        }

        if skip_last {
            if let Some((id, name)) = by_key.pop_last() {
                info!("Skipping last file {} (id {})", name, id);
            }
        }

        debug!("Found {} importable files in {}", by_key.len(), dir.display());
        let units = by_key
            .into_iter()
            .map(|(id, name)| SourceUnit {
                key: UnitKey::Numeric(id),
                locator: Locator::File(dir.join(name)),
            })
            .collect();
        Ok(Self { units })
    }

    pub fn next_unit(&mut self) -> Option<SourceUnit> {
        self.units.pop_front()
    }

    pub fn has_more(&self) -> bool {
        !self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Compile a file id pattern, requiring at least one capture group
pub fn compile_file_pattern(pattern: &str) -> Result<Regex> {
    let regex = Regex::new(pattern).map_err(|e| ImportError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    if regex.captures_len() < 2 {
        return Err(ImportError::InvalidPattern {
            pattern: pattern.to_string(),
            message: "pattern needs a capture group for the file id".to_string(),
        });
    }
    Ok(regex)
}

/// Derives each unit's window from the previous unit's end time
///
/// The first unit only seeds the tracker: it has no start, so no window.
#[derive(Debug, Clone, Default)]
pub struct WindowTracker {
    previous_end: Option<DateTime<Utc>>,
}

impl WindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_end(&self) -> Option<DateTime<Utc>> {
        self.previous_end
    }

    pub fn advance(&mut self, end: DateTime<Utc>) -> Option<TimeWindow> {
        let start = self.previous_end.replace(end)?;
        Some(TimeWindow { start, end })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "x").unwrap();
    }

    fn keys(seq: &mut SourceSequence) -> Vec<UnitKey> {
        std::iter::from_fn(|| seq.next_unit()).map(|u| u.key).collect()
    }

    #[test]
    fn test_directory_units_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["data_10.csv", "data_3.csv", "data_1.csv", "readme.txt"] {
            touch(dir.path(), name);
        }
        let pattern = compile_file_pattern(r"data_([0-9]+)\.csv").unwrap();

        let mut seq = SourceSequence::from_directory(dir.path(), &pattern, false).unwrap();
        assert_eq!(
            keys(&mut seq),
            vec![UnitKey::Numeric(1), UnitKey::Numeric(3), UnitKey::Numeric(10)]
        );

        let mut seq = SourceSequence::from_directory(dir.path(), &pattern, true).unwrap();
        assert_eq!(keys(&mut seq), vec![UnitKey::Numeric(1), UnitKey::Numeric(3)]);
    }

    #[test]
    fn test_directory_unit_locators() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "data_7.csv");
        let pattern = compile_file_pattern(r"data_([0-9]+)\.csv").unwrap();

        let mut seq = SourceSequence::from_directory(dir.path(), &pattern, false).unwrap();
        let unit = seq.next_unit().unwrap();
        assert_eq!(unit.locator, Locator::File(dir.path().join("data_7.csv")));
        assert!(!seq.has_more());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let pattern = compile_file_pattern(r"([0-9]+)").unwrap();
        assert!(matches!(
            SourceSequence::from_directory(&missing, &pattern, false),
            Err(ImportError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_pattern_needs_capture_group() {
        assert!(compile_file_pattern(r"data_[0-9]+").is_err());
        assert!(compile_file_pattern(r"data_([0-9]+").is_err());
        assert!(compile_file_pattern(r"data_([0-9]+)").is_ok());
    }

    #[test]
    fn test_locator_units_keep_order() {
        let mut seq = SourceSequence::from_locators(vec![
            Locator::parse("http://example.org/b.csv"),
            Locator::parse("http://example.org/a.csv"),
        ]);
        assert_eq!(seq.len(), 2);
        let first = seq.next_unit().unwrap();
        assert_eq!(first.key, UnitKey::Numeric(0));
        assert_eq!(first.locator, Locator::parse("http://example.org/b.csv"));
    }

    #[test]
    fn test_window_tracker() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

        let mut tracker = WindowTracker::new();
        assert_eq!(tracker.advance(t1), None);
        assert_eq!(tracker.advance(t2), Some(TimeWindow { start: t1, end: t2 }));
        assert_eq!(tracker.advance(t3), Some(TimeWindow { start: t2, end: t3 }));
        assert_eq!(tracker.previous_end(), Some(t3));
    }

    #[test]
    fn test_unit_key_literals() {
        assert_eq!(UnitKey::Numeric(12).to_literal(), "12");
        assert_eq!(UnitKey::Text("a'b".into()).to_literal(), "'a''b'");
    }
}
