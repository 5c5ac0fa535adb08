//! The pull interface every importer implements

use crate::error::Result;
use crate::model::Observation;
use async_trait::async_trait;

/// Lazy producer of observation batches
///
/// Callers loop `while source.has_next() { source.next_batch().await? }`.
/// An empty batch is a normal result (a skipped row, a deduplicated unit,
/// a record that produced nothing) and does not mean the source is done.
/// An `Err` ends the run.
#[async_trait]
pub trait ObservationSource: Send {
    fn has_next(&self) -> bool;

    async fn next_batch(&mut self) -> Result<Vec<Observation>>;
}

#[async_trait]
impl<T: ObservationSource + ?Sized> ObservationSource for Box<T> {
    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    async fn next_batch(&mut self) -> Result<Vec<Observation>> {
        (**self).next_batch().await
    }
}
