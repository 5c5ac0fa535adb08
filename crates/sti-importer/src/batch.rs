//! Record-oriented batch importer
//!
//! [`BatchImporter`] walks a [`SourceSequence`] one record at a time. Each
//! call to `next_batch` reads at most one record of the current unit and
//! returns the observations its converters produce.
//!
//! Row windows are per unit: `row_skip` leading records are read and
//! dropped, and once `row_limit` records (skipped ones included) have been
//! read every further record of that unit yields an empty batch. A limit
//! of 0 means no limit.

use crate::dedup::UnitGuard;
use crate::error::{ConvertError, Result};
use crate::fetch::ContentFetcher;
use crate::model::Observation;
use crate::sequencer::{SourceSequence, SourceUnit};
use crate::source::ObservationSource;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::{debug, error, info};

/// Splits fetched content into records
pub trait RecordReader: Send + Sync {
    type Record: Send + Sync + 'static;

    fn read(&self, content: &str) -> Result<Vec<Self::Record>>;
}

/// Turns one record into at most one observation
pub trait RecordConverter<R>: Send + Sync {
    /// `Ok(None)` means the record holds no value for this converter
    fn convert(&self, record: &R) -> std::result::Result<Option<Observation>, ConvertError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowWindow {
    pub skip: usize,
    /// 0 means unlimited
    pub limit: usize,
}

impl RowWindow {
    pub fn new(skip: usize, limit: usize) -> Self {
        Self { skip, limit }
    }

    fn past_limit(&self, rows_read: usize) -> bool {
        self.limit > 0 && rows_read > self.limit
    }
}

struct CurrentUnit<T> {
    unit: SourceUnit,
    records: VecDeque<T>,
    total: usize,
    rows_read: usize,
    rows_converted: usize,
}

pub struct BatchImporter<F, R: RecordReader> {
    fetcher: F,
    reader: R,
    converters: Vec<Box<dyn RecordConverter<R::Record>>>,
    units: SourceSequence,
    window: RowWindow,
    guard: Option<Box<dyn UnitGuard>>,
    current: Option<CurrentUnit<R::Record>>,
}

impl<F: ContentFetcher, R: RecordReader> BatchImporter<F, R> {
    pub fn new(fetcher: F, reader: R, units: SourceSequence) -> Self {
        Self {
            fetcher,
            reader,
            converters: Vec::new(),
            units,
            window: RowWindow::default(),
            guard: None,
            current: None,
        }
    }

    pub fn with_converter(mut self, converter: Box<dyn RecordConverter<R::Record>>) -> Self {
        self.converters.push(converter);
        self
    }

    pub fn with_window(mut self, window: RowWindow) -> Self {
        self.window = window;
        self
    }

    /// Skip units the guard reports as already imported
    pub fn with_guard(mut self, guard: Box<dyn UnitGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    fn current_has_records(&self) -> bool {
        self.current
            .as_ref()
            .map_or(false, |c| !c.records.is_empty())
    }

    /// Move to the next unit that is not already imported and load its records
    ///
    /// Returns `false` when no unit is left.
    async fn open_next_unit(&mut self) -> Result<bool> {
        while let Some(unit) = self.units.next_unit() {
            if let Some(ref guard) = self.guard {
                if guard.already_imported(&unit.key).await? {
                    info!(unit = %unit.key, "Skipping unit, already imported");
                    continue;
                }
            }

            info!("Fetching {}", unit.locator);
            let content = self.fetcher.fetch(&unit.locator).await?;
            let records = self.reader.read(&content)?;
            debug!(unit = %unit.key, records = records.len(), "Read unit");

            self.current = Some(CurrentUnit {
                unit,
                total: records.len(),
                records: records.into(),
                rows_read: 0,
                rows_converted: 0,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn convert(&self, record: &R::Record, unit: &SourceUnit, row: usize) -> Vec<Observation> {
        let mut batch = Vec::new();
        for converter in &self.converters {
            match converter.convert(record) {
                Ok(Some(observation)) => batch.push(observation),
                Ok(None) => {}
                Err(e) => error!(error = %e, unit = %unit.key, row, "Failed to convert record"),
            }
        }
        batch
    }
}

fn log_finished<T>(current: &CurrentUnit<T>) {
    info!(
        "Parsed {} rows of {} from {}.",
        current.rows_converted, current.total, current.unit.locator
    );
}

#[async_trait]
impl<F: ContentFetcher, R: RecordReader> ObservationSource for BatchImporter<F, R> {
    fn has_next(&self) -> bool {
        self.current_has_records() || self.units.has_more()
    }

    async fn next_batch(&mut self) -> Result<Vec<Observation>> {
        if !self.current_has_records() && !self.open_next_unit().await? {
            return Ok(Vec::new());
        }

        loop {
            let Some(current) = self.current.as_mut() else {
                return Ok(Vec::new());
            };
            let Some(record) = current.records.pop_front() else {
                log_finished(current);
                return Ok(Vec::new());
            };
            current.rows_read += 1;
            let row = current.rows_read;
            let exhausted = current.records.is_empty();

            if row <= self.window.skip {
                if exhausted {
                    log_finished(current);
                    return Ok(Vec::new());
                }
                continue;
            }

            if self.window.past_limit(row) {
                if exhausted {
                    log_finished(current);
                }
                return Ok(Vec::new());
            }

            current.rows_converted += 1;
            let unit = current.unit.clone();
            let batch = self.convert(&record, &unit, row);

            if exhausted {
                if let Some(ref current) = self.current {
                    log_finished(current);
                }
            }
            return Ok(batch);
        }
    }
}
