//! STI Importer Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Imports observations from external data sources into a SensorThings API
//! service.
//!
//! # Importers
//!
//! - **Delimited text** ([`batch`], [`delimited`]): rows of CSV files from
//!   http(s), ftp or disk, one record per batch, with per-source row windows
//! - **Documents** ([`documents`]): one file per batch from a directory,
//!   windowed by modification time and deduplicated by file id
//! - **Air quality** ([`aqd`]): station network from WFS feeds reconciled
//!   into entities, observations per datastream from SOS
//!
//! Every importer is an [`ObservationSource`]. Entities are resolved through
//! an [`EntityCache`] so that re-running an import never duplicates them.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use sti_importer::config::ImporterConfig;
//! use sti_importer::runner::{build_source, frost_client, remote_fetcher};
//! use sti_importer::sink::{run_import, ServiceSink};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ImporterConfig::from_file(Path::new("import.toml"))?;
//!     let service = Arc::new(frost_client(&config.service)?);
//!     let mut source = build_source(&config, service.clone(), remote_fetcher(&config)?).await?;
//!     let summary = run_import(&mut source, &mut ServiceSink::new(service)).await?;
//!     println!("{} observations", summary.created);
//!     Ok(())
//! }
//! ```

pub mod aqd;
pub mod batch;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod delimited;
pub mod documents;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod model;
pub mod runner;
pub mod sequencer;
pub mod service;
pub mod sink;
pub mod source;
pub mod swe;
pub mod translate;
pub mod xml;

pub use cache::{EntityCache, Reconciled};
pub use error::{ConvertError, ImportError, Result};
pub use service::{EntityService, FrostClient, InMemoryService, ServiceError};
pub use sink::{run_import, ObservationSink, RunSummary, ServiceSink};
pub use source::ObservationSource;
