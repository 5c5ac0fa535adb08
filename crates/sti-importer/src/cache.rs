//! Entity reconciliation cache
//!
//! Maps a source-side key (usually the `localId` property) to the last known
//! server-side state of an entity. Importers preload a cache once, then use
//! [`EntityCache::find_or_create`] so that running the same import twice
//! never creates a duplicate entity.

use crate::model::Entity;
use crate::service::{query_all, query_first, EntityService, Query, ServiceError, DEFAULT_PAGE_SIZE};
use indexmap::IndexMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use tracing::{debug, info, warn};

/// Where a reconciled entity came from
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled<E> {
    /// Already cached, no remote call made
    Cached(E),
    /// Found by a remote filter query
    Found(E),
    /// Newly created
    Created(E),
}

impl<E> Reconciled<E> {
    pub fn entity(&self) -> &E {
        match self {
            Reconciled::Cached(e) | Reconciled::Found(e) | Reconciled::Created(e) => e,
        }
    }

    pub fn into_entity(self) -> E {
        match self {
            Reconciled::Cached(e) | Reconciled::Found(e) | Reconciled::Created(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Reconciled::Created(_))
    }
}

/// Keyed cache of one entity type, in load/insertion order
#[derive(Debug, Clone)]
pub struct EntityCache<K, E> {
    entries: IndexMap<K, E>,
    page_size: usize,
}

impl<K, E> Default for EntityCache<K, E> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl<K, E> EntityCache<K, E>
where
    K: Hash + Eq + Clone + Display + Debug + Send + Sync,
    E: Entity,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// `$top` used by [`EntityCache::load`]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fill the cache from every entity matching `filter`
    ///
    /// Pages are requested with the cache's page size and all of them are
    /// drained. Entities for which `key_of` returns `None`
    /// are dropped. Returns the number of cached entries.
    pub async fn load<S, F>(
        &mut self,
        service: &S,
        filter: &str,
        select: Option<&str>,
        expand: Option<&str>,
        key_of: F,
    ) -> Result<usize, ServiceError>
    where
        S: EntityService + ?Sized,
        F: Fn(&E) -> Option<K> + Send,
    {
        let mut query = Query::entities::<E>().filter(filter).top(self.page_size);
        if let Some(select) = select {
            query = query.select(select);
        }
        if let Some(expand) = expand {
            query = query.expand(expand);
        }

        let entities: Vec<E> = query_all(service, &query).await?;
        let fetched = entities.len();
        for entity in entities {
            match key_of(&entity) {
                Some(key) => {
                    self.entries.insert(key, entity);
                }
                None => debug!(entity_set = E::ENTITY_SET, "Dropping entity without key"),
            }
        }

        info!(
            entity_set = E::ENTITY_SET,
            fetched,
            cached = self.entries.len(),
            "Loaded entity cache"
        );
        Ok(self.entries.len())
    }

    pub fn get(&self, key: &K) -> Option<&E> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn put(&mut self, key: K, entity: E) -> Option<E> {
        self.entries.insert(key, entity)
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `key` to an existing entity or create `desired`
    ///
    /// Order of resolution: the cache, then a remote query with `filter`,
    /// then a create. Whatever is resolved is written back under `key`.
    pub async fn find_or_create<S>(
        &mut self,
        service: &S,
        key: K,
        filter: &str,
        desired: E,
    ) -> Result<Reconciled<E>, ServiceError>
    where
        S: EntityService + ?Sized,
    {
        if let Some(cached) = self.entries.get(&key) {
            return Ok(Reconciled::Cached(cached.clone()));
        }

        let query = Query::entities::<E>().filter(filter).top(2);
        let page = service.query::<E>(&query).await?;
        if page.values.len() > 1 {
            warn!(entity_set = E::ENTITY_SET, key = %key, "More than one entity matches, using the first");
        }

        let reconciled = match page.values.into_iter().next() {
            Some(found) => {
                debug!(entity_set = E::ENTITY_SET, key = %key, "Found existing entity");
                Reconciled::Found(found)
            }
            None => {
                let created = service.create(&desired).await?;
                info!(entity_set = E::ENTITY_SET, key = %key, "Created entity");
                Reconciled::Created(created)
            }
        };

        self.entries.insert(key, reconciled.entity().clone());
        Ok(reconciled)
    }

    /// Apply `change` to the cached entity and push it when anything changed
    ///
    /// `change` returns whether it modified the entity. Returns `Ok(false)`
    /// when the key is not cached or nothing changed.
    pub async fn update_if_changed<S, F>(
        &mut self,
        service: &S,
        key: &K,
        change: F,
    ) -> Result<bool, ServiceError>
    where
        S: EntityService + ?Sized,
        F: FnOnce(&mut E) -> bool + Send,
    {
        let Some(entity) = self.entries.get_mut(key) else {
            return Ok(false);
        };

        let mut candidate = entity.clone();
        if !change(&mut candidate) {
            return Ok(false);
        }

        service.update(&candidate).await?;
        debug!(entity_set = E::ENTITY_SET, key = %key, "Updated entity");
        *entity = candidate;
        Ok(true)
    }

    /// Re-read a single entity by filter and replace the cached copy
    pub async fn refresh<S>(&mut self, service: &S, key: K, filter: &str) -> Result<bool, ServiceError>
    where
        S: EntityService + ?Sized,
    {
        let query = Query::entities::<E>().filter(filter).top(1);
        match query_first::<S, E>(service, &query).await? {
            Some(entity) => {
                self.entries.insert(key, entity);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{EntityId, ObservedProperty, Thing};
    use crate::service::{local_id_filter, InMemoryService};
    use serde_json::json;

    fn thing(local_id: &str) -> Thing {
        let mut t = Thing {
            name: format!("Station {}", local_id),
            ..Default::default()
        };
        t.properties.insert("localId".into(), json!(local_id));
        t.properties.insert("owner".into(), json!("aqd"));
        t
    }

    #[tokio::test]
    async fn test_load_drains_pages_and_drops_unkeyed() {
        let service = InMemoryService::new();
        for i in 0..3 {
            service.seed(&thing(&format!("STA.{}", i)));
        }
        service.seed(&Thing {
            name: "no local id".into(),
            properties: [("owner".to_string(), json!("aqd"))].into_iter().collect(),
            ..Default::default()
        });

        let mut cache: EntityCache<String, Thing> = EntityCache::new().with_page_size(2);
        let count = cache
            .load(&service, "properties/owner eq 'aqd'", None, None, |t| t.local_id())
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert!(cache.contains_key(&"STA.1".to_string()));
        let keys: Vec<_> = cache.keys().cloned().collect();
        assert_eq!(keys, vec!["STA.0", "STA.1", "STA.2"]);
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let service = InMemoryService::new();
        let mut cache: EntityCache<String, Thing> = EntityCache::new();
        let key = "STA.09.0101".to_string();
        let filter = local_id_filter(&key);

        let first = cache
            .find_or_create(&service, key.clone(), &filter, thing(&key))
            .await
            .unwrap();
        assert!(first.is_created());

        let second = cache
            .find_or_create(&service, key.clone(), &filter, thing(&key))
            .await
            .unwrap();
        assert!(matches!(second, Reconciled::Cached(_)));
        assert_eq!(second.entity().id, first.entity().id);

        // A fresh cache still resolves remotely instead of creating again.
        let mut fresh: EntityCache<String, Thing> = EntityCache::new();
        let reads_before = service.query_count("Things");
        let third = fresh
            .find_or_create(&service, key.clone(), &filter, thing(&key))
            .await
            .unwrap();
        assert!(matches!(third, Reconciled::Found(_)));
        assert_eq!(service.query_count("Things") - reads_before, 1);
        assert_eq!(third.entity().local_id(), first.entity().local_id());
        assert_eq!(third.entity().id, first.entity().id);
        assert_eq!(service.create_count("Things"), 1);
    }

    #[tokio::test]
    async fn test_update_if_changed_skips_unchanged() {
        let service = InMemoryService::new();
        let mut cache: EntityCache<i64, ObservedProperty> = EntityCache::new();
        let op = ObservedProperty {
            name: "PM10".into(),
            ..Default::default()
        };
        let created = service.create(&op).await.unwrap();
        cache.put(5, created);

        let changed = cache
            .update_if_changed(&service, &5, |op| {
                if op.name == "PM10" {
                    return false;
                }
                op.name = "PM10".into();
                true
            })
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(service.update_count("ObservedProperties"), 0);

        let changed = cache
            .update_if_changed(&service, &5, |op| {
                op.description = "Particulate matter < 10 µm".into();
                true
            })
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(service.update_count("ObservedProperties"), 1);
        assert_eq!(cache.get(&5).unwrap().description, "Particulate matter < 10 µm");
        assert_eq!(cache.get(&5).unwrap().id, Some(EntityId::Number(1)));
    }

    #[tokio::test]
    async fn test_refresh_replaces_cached_copy() {
        let service = InMemoryService::new();
        let mut stored = service.seed(&thing("A"));
        stored.description = "remote edit".into();
        service.update(&stored).await.unwrap();

        let mut cache: EntityCache<String, Thing> = EntityCache::new();
        cache.put("A".into(), thing("A"));
        assert!(cache
            .refresh(&service, "A".into(), &local_id_filter("A"))
            .await
            .unwrap());
        assert_eq!(cache.get(&"A".to_string()).unwrap().description, "remote edit");
    }
}
