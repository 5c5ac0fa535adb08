//! Where observation batches go, and the loop that drives a source into it

use crate::error::Result;
use crate::model::Observation;
use crate::service::EntityService;
use crate::source::ObservationSource;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of pushing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub created: usize,
    pub failed: usize,
}

impl SinkStats {
    fn add(&mut self, other: SinkStats) {
        self.created += other.created;
        self.failed += other.failed;
    }
}

/// Receives the batches an observation source produces
#[async_trait]
pub trait ObservationSink: Send {
    async fn push(&mut self, batch: Vec<Observation>) -> Result<SinkStats>;
}

/// Creates every observation through the entity service
///
/// A failed create is logged and counted; it never ends the run.
pub struct ServiceSink<S> {
    service: Arc<S>,
}

impl<S: EntityService> ServiceSink<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: EntityService> ObservationSink for ServiceSink<S> {
    async fn push(&mut self, batch: Vec<Observation>) -> Result<SinkStats> {
        let mut stats = SinkStats::default();
        for observation in &batch {
            match self.service.create(observation).await {
                Ok(_) => stats.created += 1,
                Err(e) => {
                    error!(error = %e, "Failed to create observation");
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// Counters of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub empty_batches: usize,
    pub observations: usize,
    pub created: usize,
    pub failures: usize,
}

/// Pull batches until the source is exhausted and push each non-empty one
///
/// Stops at the first error the source or the sink returns.
pub async fn run_import<Src, Snk>(source: &mut Src, sink: &mut Snk) -> Result<RunSummary>
where
    Src: ObservationSource + ?Sized,
    Snk: ObservationSink + ?Sized,
{
    let mut summary = RunSummary::default();
    let mut totals = SinkStats::default();

    while source.has_next() {
        let batch = source.next_batch().await?;
        summary.batches += 1;
        if batch.is_empty() {
            summary.empty_batches += 1;
            continue;
        }

        summary.observations += batch.len();
        debug!(batch = summary.batches, size = batch.len(), "Pushing batch");
        totals.add(sink.push(batch).await?);
    }

    summary.created = totals.created;
    summary.failures = totals.failed;
    info!(
        batches = summary.batches,
        empty_batches = summary.empty_batches,
        observations = summary.observations,
        created = summary.created,
        failures = summary.failures,
        "Import finished"
    );
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{EntityId, TimeObject};
    use crate::service::InMemoryService;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Vec<Observation>>);

    #[async_trait]
    impl ObservationSource for Scripted {
        fn has_next(&self) -> bool {
            !self.0.is_empty()
        }

        async fn next_batch(&mut self) -> Result<Vec<Observation>> {
            Ok(self.0.pop_front().unwrap_or_default())
        }
    }

    fn observation(value: i64) -> Observation {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        Observation::new(TimeObject::Instant(t), json!(value), EntityId::Number(1))
    }

    #[tokio::test]
    async fn test_run_counts_batches_and_creates() {
        let service = Arc::new(InMemoryService::new());
        let mut source = Scripted(
            vec![vec![observation(1), observation(2)], vec![], vec![observation(3)]].into(),
        );
        let mut sink = ServiceSink::new(service.clone());

        let summary = run_import(&mut source, &mut sink).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                batches: 3,
                empty_batches: 1,
                observations: 3,
                created: 3,
                failures: 0,
            }
        );
        assert_eq!(service.create_count("Observations"), 3);
    }

    #[tokio::test]
    async fn test_boxed_source_and_sink() {
        let service = Arc::new(InMemoryService::new());
        let mut source: Box<dyn ObservationSource> = Box::new(Scripted(vec![vec![observation(1)]].into()));
        let mut sink: Box<dyn ObservationSink> = Box::new(ServiceSink::new(service));

        let summary = run_import(source.as_mut(), sink.as_mut()).await.unwrap();
        assert_eq!(summary.created, 1);
        assert!(!source.has_next());
    }
}
