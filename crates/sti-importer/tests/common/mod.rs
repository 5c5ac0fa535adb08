//! Shared helpers for the integration tests

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::json;
use sti_importer::model::{Observation, TimeObject};
use wiremock::MockServer;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sti_importer=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Service root under a mock server, as the importer is configured with it
pub fn service_root(server: &MockServer) -> String {
    format!("{}/v1.1", server.uri())
}

/// A SensorThings list response
pub fn list_body(values: serde_json::Value, next_link: Option<String>) -> serde_json::Value {
    match next_link {
        Some(link) => json!({ "value": values, "@iot.nextLink": link }),
        None => json!({ "value": values }),
    }
}

pub fn instant(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("valid RFC 3339 instant")
}

pub fn results(observations: &[Observation]) -> Vec<serde_json::Value> {
    observations.iter().map(|o| o.result.clone()).collect()
}

pub fn phenomenon_instant(observation: &Observation) -> Option<DateTime<Utc>> {
    match observation.phenomenon_time {
        Some(TimeObject::Instant(t)) => Some(t),
        _ => None,
    }
}
