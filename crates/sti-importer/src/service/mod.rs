//! Access to the SensorThings entity service
//!
//! [`EntityService`] is the seam between the importers and the remote API.
//! [`FrostClient`] talks HTTP to a real server, [`InMemoryService`] keeps
//! entities in process for dry runs and tests.

pub mod frost;
pub mod memory;

pub use frost::FrostClient;
pub use memory::InMemoryService;

use crate::model::{quote_literal, Entity, EntityId, LOCAL_ID, OWNER};
use async_trait::async_trait;
use thiserror::Error;

/// Page size used when draining an entity set
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Failures talking to the entity service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{method} {url} returned HTTP {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Created {0} but the server did not report its id")]
    MissingId(&'static str),

    #[error("Cannot update {0} without an id")]
    NoIdForUpdate(&'static str),
}

/// A list request against an entity set or a related set
///
/// ```
/// use sti_importer::service::Query;
/// use sti_importer::model::{EntityId, Observation};
///
/// let query = Query::related::<Observation>("Datastreams", &EntityId::Number(7))
///     .filter("parameters/importFileId eq 12")
///     .select("@iot.id")
///     .top(1);
/// assert_eq!(query.path(), "Datastreams(7)/Observations");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    path: String,
    pub filter: Option<String>,
    pub select: Option<String>,
    pub expand: Option<String>,
    pub order_by: Option<String>,
    pub top: Option<usize>,
}

impl Query {
    /// Query the entity set of `E`
    pub fn entities<E: Entity>() -> Self {
        Self::at(E::ENTITY_SET)
    }

    /// Query the `E` entities related to one parent, e.g. `Datastreams(7)/Observations`
    pub fn related<E: Entity>(parent_set: &str, parent_id: &EntityId) -> Self {
        Self::at(format!("{}({})/{}", parent_set, parent_id.literal(), E::ENTITY_SET))
    }

    fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filter: None,
            select: None,
            expand: None,
            order_by: None,
            top: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    /// The query options as `(name, value)` pairs, unencoded
    pub fn options(&self) -> Vec<(&'static str, String)> {
        let mut options = Vec::new();
        if let Some(ref filter) = self.filter {
            options.push(("$filter", filter.clone()));
        }
        if let Some(ref select) = self.select {
            options.push(("$select", select.clone()));
        }
        if let Some(ref expand) = self.expand {
            options.push(("$expand", expand.clone()));
        }
        if let Some(ref order_by) = self.order_by {
            options.push(("$orderby", order_by.clone()));
        }
        if let Some(top) = self.top {
            options.push(("$top", top.to_string()));
        }
        options
    }
}

/// Values that can appear on the right-hand side of a filter comparison
pub trait FilterLiteral {
    fn to_literal(&self) -> String;
}

impl FilterLiteral for str {
    fn to_literal(&self) -> String {
        quote_literal(self)
    }
}

impl FilterLiteral for String {
    fn to_literal(&self) -> String {
        quote_literal(self)
    }
}

impl FilterLiteral for i64 {
    fn to_literal(&self) -> String {
        self.to_string()
    }
}

impl FilterLiteral for EntityId {
    fn to_literal(&self) -> String {
        self.literal()
    }
}

/// `properties/localId eq <value>`
pub fn local_id_filter<L: FilterLiteral + ?Sized>(local_id: &L) -> String {
    format!("properties/{} eq {}", LOCAL_ID, local_id.to_literal())
}

/// `properties/owner eq '<owner>'`
pub fn owner_filter(owner: &str) -> String {
    format!("properties/{} eq {}", OWNER, quote_literal(owner))
}

/// One page of a list response
#[derive(Debug, Clone)]
pub struct Page<E> {
    pub values: Vec<E>,
    pub next_link: Option<String>,
}

#[async_trait]
pub trait EntityService: Send + Sync {
    /// Fetch the first page of a query
    async fn query<E: Entity>(&self, query: &Query) -> Result<Page<E>, ServiceError>;

    /// Follow an `@iot.nextLink`
    async fn next_page<E: Entity>(&self, next_link: &str) -> Result<Page<E>, ServiceError>;

    /// Create an entity and return it with its server assigned id
    async fn create<E: Entity>(&self, entity: &E) -> Result<E, ServiceError>;

    /// Push the full state of an existing entity
    async fn update<E: Entity>(&self, entity: &E) -> Result<(), ServiceError>;
}

/// Run a query and follow next links until the result set is exhausted
pub async fn query_all<S, E>(service: &S, query: &Query) -> Result<Vec<E>, ServiceError>
where
    S: EntityService + ?Sized,
    E: Entity,
{
    let mut page = service.query::<E>(query).await?;
    let mut values = std::mem::take(&mut page.values);

    while let Some(link) = page.next_link.take() {
        page = service.next_page::<E>(&link).await?;
        values.append(&mut page.values);
    }

    Ok(values)
}

/// First entity matching a query, if any
pub async fn query_first<S, E>(service: &S, query: &Query) -> Result<Option<E>, ServiceError>
where
    S: EntityService + ?Sized,
    E: Entity,
{
    let page = service.query::<E>(query).await?;
    Ok(page.values.into_iter().next())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Observation, Thing};

    #[test]
    fn test_query_options_in_order() {
        let query = Query::entities::<Thing>()
            .filter("properties/owner eq 'aqd'")
            .select("id,properties")
            .expand("Locations($select=id)")
            .top(1000);

        assert_eq!(query.path(), "Things");
        assert_eq!(
            query.options(),
            vec![
                ("$filter", "properties/owner eq 'aqd'".to_string()),
                ("$select", "id,properties".to_string()),
                ("$expand", "Locations($select=id)".to_string()),
                ("$top", "1000".to_string()),
            ]
        );
    }

    #[test]
    fn test_filter_helpers() {
        assert_eq!(local_id_filter("STA.09.0101"), "properties/localId eq 'STA.09.0101'");
        assert_eq!(local_id_filter(&5_i64), "properties/localId eq 5");
        assert_eq!(owner_filter("o'neil"), "properties/owner eq 'o''neil'");
    }

    #[test]
    fn test_related_path_quotes_text_ids() {
        let query = Query::related::<Observation>("Datastreams", &EntityId::from("ds-1"));
        assert_eq!(query.path(), "Datastreams('ds-1')/Observations");
    }
}
