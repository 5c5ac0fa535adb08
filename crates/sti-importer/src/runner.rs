//! Wiring a validated configuration into a runnable importer

use crate::aqd::AqdImporter;
use crate::batch::{BatchImporter, RowWindow};
use crate::config::{ImporterConfig, ImporterKind, ServiceConfig};
use crate::dedup::DedupGuard;
use crate::delimited::CsvReader;
use crate::documents::DocumentImporter;
use crate::error::{ImportError, Result};
use crate::fetch::{ContentFetcher, Locator, RemoteFetcher};
use crate::sequencer::{compile_file_pattern, SourceSequence};
use crate::service::{EntityService, FrostClient};
use crate::source::ObservationSource;
use std::sync::Arc;
use tracing::info;

/// SensorThings client for the configured service
pub fn frost_client(config: &ServiceConfig) -> Result<FrostClient> {
    let client = FrostClient::new(&config.base_url, config.timeout())?.with_dry_run(config.dry_run);
    if config.dry_run {
        info!(url = %config.base_url, "Dry run, creates and updates are only logged");
    }
    Ok(client)
}

/// Fetcher for remote units, honouring the csv charset setting
pub fn remote_fetcher(config: &ImporterConfig) -> Result<RemoteFetcher> {
    let fetcher = RemoteFetcher::with_timeout(config.service.timeout())?;
    Ok(match config.importer {
        ImporterKind::Csv(ref csv) => fetcher.charset(csv.charset.as_str()),
        _ => fetcher,
    })
}

/// Build the observation source the configuration selects
///
/// The air quality importer does its cache preload and, when configured,
/// the full network reconciliation here, before the first batch.
pub async fn build_source<S, F>(
    config: &ImporterConfig,
    service: Arc<S>,
    fetcher: F,
) -> Result<Box<dyn ObservationSource>>
where
    S: EntityService + 'static,
    F: ContentFetcher + 'static,
{
    match config.importer {
        ImporterKind::Csv(ref csv) => {
            let delimiter = csv.delimiter_byte().map_err(|e| ImportError::config(e.to_string()))?;
            let units = SourceSequence::from_locators(csv.urls.iter().map(|u| Locator::parse(u)));
            info!(units = units.len(), "Importing delimited text");

            let mut importer = BatchImporter::new(fetcher, CsvReader::new(delimiter, csv.has_header), units)
                .with_window(RowWindow::new(csv.row_skip, csv.row_limit));
            for converter in &csv.converters {
                importer = importer.with_converter(Box::new(converter.clone()));
            }
            Ok(Box::new(importer))
        }
        ImporterKind::Documents(ref documents) => {
            let pattern = compile_file_pattern(&documents.file_id_regex)?;
            let units = SourceSequence::from_directory(&documents.data_path, &pattern, documents.skip_last)?;
            info!(
                units = units.len(),
                path = %documents.data_path.display(),
                "Importing documents"
            );

            let mut importer =
                DocumentImporter::new(units, documents.parser.clone()).with_sleep(documents.sleep());
            if let Some(ref datastream) = documents.check_datastream_id {
                importer = importer.with_guard(Box::new(DedupGuard::new(service, datastream.clone())));
            }
            Ok(Box::new(importer))
        }
        ImporterKind::Aqd(ref aqd) => {
            let source = AqdImporter::new(aqd.clone(), service, fetcher)?
                .with_page_size(config.service.page_size)
                .prepare()
                .await?;
            Ok(Box::new(source))
        }
    }
}
