//! In-process entity service
//!
//! Stores entities as JSON per entity set. Supports the subset of OData the
//! importers use: `eq` comparisons joined by `and`, related-set paths such as
//! `Datastreams(7)/Observations`, `$orderby` on one field and `$top` paging
//! with next links.

use super::{EntityService, Page, Query, ServiceError};
use crate::model::{Entity, EntityId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

const NEXT_LINK_PREFIX: &str = "memory:next/";

#[derive(Debug, Default)]
struct State {
    sets: HashMap<String, Vec<Value>>,
    pending_pages: HashMap<String, (Vec<Value>, usize)>,
    next_id: i64,
    next_link_seq: u64,
    counts: HashMap<(&'static str, String), usize>,
}

impl State {
    fn bump(&mut self, op: &'static str, set: &str) {
        *self.counts.entry((op, set.to_string())).or_default() += 1;
    }

    fn page(&mut self, mut values: Vec<Value>, top: usize) -> Page<Value> {
        if values.len() <= top {
            return Page {
                values,
                next_link: None,
            };
        }
        let rest = values.split_off(top);
        self.next_link_seq += 1;
        let link = format!("{}{}", NEXT_LINK_PREFIX, self.next_link_seq);
        self.pending_pages.insert(link.clone(), (rest, top));
        Page {
            values,
            next_link: Some(link),
        }
    }
}

/// Entity service backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryService {
    state: Mutex<State>,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `query` calls made against an entity set (next pages excluded)
    pub fn query_count(&self, entity_set: &str) -> usize {
        self.count("query", entity_set)
    }

    pub fn create_count(&self, entity_set: &str) -> usize {
        self.count("create", entity_set)
    }

    pub fn update_count(&self, entity_set: &str) -> usize {
        self.count("update", entity_set)
    }

    fn count(&self, op: &'static str, entity_set: &str) -> usize {
        self.lock()
            .counts
            .get(&(op, entity_set.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// All stored entities of a type, in creation order
    pub fn entities<E: Entity>(&self) -> Vec<E> {
        self.lock()
            .sets
            .get(E::ENTITY_SET)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store an entity without counting it as a create
    pub fn seed<E: Entity>(&self, entity: &E) -> E {
        let mut state = self.lock();
        insert(&mut state, entity).unwrap_or_else(|_| entity.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn insert<E: Entity>(state: &mut State, entity: &E) -> Result<E, ServiceError> {
    let mut value = serde_json::to_value(entity).map_err(|e| decode_error(E::ENTITY_SET, e))?;
    state.next_id += 1;
    let id = EntityId::Number(state.next_id);
    if let Value::Object(ref mut map) = value {
        map.insert("@iot.id".to_string(), Value::from(state.next_id));
    }
    state
        .sets
        .entry(E::ENTITY_SET.to_string())
        .or_default()
        .push(value);

    let mut created = entity.clone();
    created.set_id(id);
    Ok(created)
}

fn decode_error(url: &str, err: impl std::fmt::Display) -> ServiceError {
    ServiceError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn decode_page<E: Entity>(url: &str, page: Page<Value>) -> Result<Page<E>, ServiceError> {
    let values = page
        .values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| decode_error(url, e)))
        .collect::<Result<Vec<E>, _>>()?;
    Ok(Page {
        values,
        next_link: page.next_link,
    })
}

/// Split `Datastreams(7)/Observations` into the child set and a parent constraint
fn parse_path(path: &str) -> (String, Option<(String, Value)>) {
    let Some((parent, child)) = path.split_once('/') else {
        return (path.to_string(), None);
    };
    let parent_id = EntityId::from_self_link(parent).map(|id| match id {
        EntityId::Number(n) => Value::from(n),
        EntityId::Text(s) => Value::from(s),
    });
    let parent_set = parent.split('(').next().unwrap_or(parent);
    let nav = parent_set.strip_suffix('s').unwrap_or(parent_set).to_string();
    (child.to_string(), parent_id.map(|id| (nav, id)))
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .try_fold(value, |current, segment| current.get(segment))
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Value::from(inner.replace("''", "'"));
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    raw.parse::<serde_json::Number>()
        .map(Value::Number)
        .unwrap_or_else(|_| Value::from(raw))
}

fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
        (None, _) => false,
    }
}

/// Evaluate `a/b eq 'x' and c eq 5`
fn matches_filter(value: &Value, filter: &str) -> bool {
    filter.split(" and ").all(|clause| {
        match clause.split_once(" eq ") {
            Some((path, literal)) => {
                values_equal(lookup(value, path.trim()), &parse_literal(literal))
            }
            // Unsupported expression: match nothing rather than everything.
            None => false,
        }
    })
}

fn sort_key(value: &Value, field: &str) -> String {
    match lookup(value, field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl EntityService for InMemoryService {
    async fn query<E: Entity>(&self, query: &Query) -> Result<Page<E>, ServiceError> {
        let (set, parent) = parse_path(query.path());
        let mut state = self.lock();
        state.bump("query", &set);

        let mut matched: Vec<Value> = state
            .sets
            .get(&set)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| match &parent {
                        Some((nav, id)) => {
                            values_equal(lookup(v, &format!("{}/@iot.id", nav)), id)
                        }
                        None => true,
                    })
                    .filter(|v| query.filter.as_deref().map_or(true, |f| matches_filter(v, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(ref order_by) = query.order_by {
            let mut parts = order_by.split_whitespace();
            let field = parts.next().unwrap_or_default();
            let descending = parts.next() == Some("desc");
            matched.sort_by_key(|v| sort_key(v, field));
            if descending {
                matched.reverse();
            }
        }

        let top = query.top.unwrap_or(usize::MAX).max(1);
        let page = state.page(matched, top);
        drop(state);
        decode_page(query.path(), page)
    }

    async fn next_page<E: Entity>(&self, next_link: &str) -> Result<Page<E>, ServiceError> {
        let mut state = self.lock();
        let (rest, top) = state
            .pending_pages
            .remove(next_link)
            .ok_or_else(|| decode_error(next_link, "unknown next link"))?;
        let page = state.page(rest, top);
        drop(state);
        decode_page(next_link, page)
    }

    async fn create<E: Entity>(&self, entity: &E) -> Result<E, ServiceError> {
        let mut state = self.lock();
        state.bump("create", E::ENTITY_SET);
        insert(&mut state, entity)
    }

    async fn update<E: Entity>(&self, entity: &E) -> Result<(), ServiceError> {
        let id = entity
            .id()
            .cloned()
            .ok_or(ServiceError::NoIdForUpdate(E::ENTITY_SET))?;
        let value = serde_json::to_value(entity).map_err(|e| decode_error(E::ENTITY_SET, e))?;
        let id_value = serde_json::to_value(&id).map_err(|e| decode_error(E::ENTITY_SET, e))?;

        let mut state = self.lock();
        state.bump("update", E::ENTITY_SET);
        let stored = state
            .sets
            .get_mut(E::ENTITY_SET)
            .and_then(|values| values.iter_mut().find(|v| v.get("@iot.id") == Some(&id_value)))
            .ok_or_else(|| ServiceError::Status {
                method: "PATCH",
                url: format!("{}({})", E::ENTITY_SET, id.literal()),
                status: 404,
                body: "Nothing found.".to_string(),
            })?;

        if let (Value::Object(target), Value::Object(patch)) = (stored, value) {
            for (key, field) in patch {
                target.insert(key, field);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{EntityRef, Observation, Thing, TimeObject};
    use crate::service::query_all;
    use serde_json::json;

    fn thing(local_id: &str, owner: &str) -> Thing {
        let mut t = Thing {
            name: local_id.to_string(),
            ..Default::default()
        };
        t.properties.insert("localId".into(), json!(local_id));
        t.properties.insert("owner".into(), json!(owner));
        t
    }

    #[tokio::test]
    async fn test_filter_on_nested_properties() {
        let service = InMemoryService::new();
        service.create(&thing("A", "aqd")).await.unwrap();
        service.create(&thing("B", "aqd")).await.unwrap();
        service.create(&thing("C", "other")).await.unwrap();

        let query = Query::entities::<Thing>()
            .filter("properties/owner eq 'aqd' and properties/localId eq 'B'");
        let found: Vec<Thing> = query_all(&service, &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "B");
        assert_eq!(found[0].id, Some(EntityId::Number(2)));
    }

    #[tokio::test]
    async fn test_paging_follows_next_links() {
        let service = InMemoryService::new();
        for i in 0..5 {
            service.create(&thing(&i.to_string(), "aqd")).await.unwrap();
        }

        let first: Page<Thing> = service.query(&Query::entities::<Thing>().top(2)).await.unwrap();
        assert_eq!(first.values.len(), 2);
        assert!(first.next_link.is_some());

        let all: Vec<Thing> = query_all(&service, &Query::entities::<Thing>().top(2))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_related_path_restricts_to_parent() {
        let service = InMemoryService::new();
        let time: TimeObject = "2024-01-01T00:00:00Z".parse().unwrap();
        for ds in [1, 1, 2] {
            let mut obs = Observation::new(time, json!(1), EntityId::Number(ds));
            obs.parameters.insert("importFileId".into(), json!(12));
            service.create(&obs).await.unwrap();
        }

        let query = Query::related::<Observation>("Datastreams", &EntityId::Number(1))
            .filter("parameters/importFileId eq 12");
        let found: Vec<Observation> = query_all(&service, &query).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found
            .iter()
            .all(|o| o.datastream == Some(EntityRef::new(EntityId::Number(1)))));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let service = InMemoryService::new();
        let mut created = service.create(&thing("A", "aqd")).await.unwrap();
        created.description = "updated".into();
        service.update(&created).await.unwrap();

        let stored = service.entities::<Thing>();
        assert_eq!(stored[0].description, "updated");
        assert_eq!(service.update_count("Things"), 1);
        assert_eq!(service.create_count("Things"), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_entity_fails() {
        let service = InMemoryService::new();
        let mut ghost = thing("A", "aqd");
        ghost.id = Some(EntityId::Number(99));
        assert!(matches!(
            service.update(&ghost).await,
            Err(ServiceError::Status { status: 404, .. })
        ));
    }
}
