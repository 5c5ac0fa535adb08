//! Skipping source units that were imported before
//!
//! Every observation produced from a unit carries the unit key in its
//! `importFileId` parameter. Before a unit is fetched, the guard asks the
//! service whether the check datastream already holds such an observation.

use crate::model::{EntityId, Observation};
use crate::sequencer::UnitKey;
use crate::service::{EntityService, FilterLiteral, Query, ServiceError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Observation parameter holding the key of the unit it came from
pub const IMPORT_KEY_PARAMETER: &str = "importFileId";

/// Observation parameter holding the number of results parsed from the unit
pub const RESULT_COUNT_PARAMETER: &str = "resultCount";

#[async_trait]
pub trait UnitGuard: Send + Sync {
    /// Whether observations of this unit already exist remotely
    async fn already_imported(&self, key: &UnitKey) -> Result<bool, ServiceError>;
}

/// Looks for an observation with the unit key in one datastream
pub struct DedupGuard<S> {
    service: Arc<S>,
    datastream: EntityId,
}

impl<S: EntityService> DedupGuard<S> {
    pub fn new(service: Arc<S>, datastream: EntityId) -> Self {
        Self {
            service,
            datastream,
        }
    }

    pub fn datastream(&self) -> &EntityId {
        &self.datastream
    }

    fn query(&self, key: &UnitKey) -> Query {
        Query::related::<Observation>("Datastreams", &self.datastream)
            .filter(format!("parameters/{} eq {}", IMPORT_KEY_PARAMETER, key.to_literal()))
            .select("@iot.id")
            .top(1)
    }
}

#[async_trait]
impl<S: EntityService> UnitGuard for DedupGuard<S> {
    async fn already_imported(&self, key: &UnitKey) -> Result<bool, ServiceError> {
        let page = self.service.query::<Observation>(&self.query(key)).await?;
        let found = !page.values.is_empty();
        debug!(unit = %key, datastream = %self.datastream, found, "Checked for earlier import");
        Ok(found)
    }
}
