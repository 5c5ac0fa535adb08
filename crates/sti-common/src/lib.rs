//! STI Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the SensorThings importer workspace.
//!
//! - **Error Handling**: [`StiError`] and the [`Result`] alias used by
//!   configuration and bootstrap code
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use sti_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("importer starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{Result, StiError};
