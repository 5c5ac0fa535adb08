//! SensorThings entity model
//!
//! Entities serialize to the JSON shapes the SensorThings API expects on
//! create and update. Navigation properties are written as `{"@iot.id": ..}`
//! references. Every non-id field defaults, so partially selected entities
//! (`$select=id,properties`) deserialize fine.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Property key holding an entity's identifier in the source system
pub const LOCAL_ID: &str = "localId";

/// Property key holding the importer that owns an entity
pub const OWNER: &str = "owner";

pub const ENCODING_GEO_JSON: &str = "application/vnd.geo+json";

pub const OBSERVATION_TYPE_MEASUREMENT: &str =
    "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement";

// ============================================================================
// Identifiers and references
// ============================================================================

/// Server assigned identifier, numeric or textual depending on the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(i64),
    Text(String),
}

impl EntityId {
    /// The id as it appears in URLs and filters: `5` or `'abc'`
    pub fn literal(&self) -> String {
        match self {
            EntityId::Number(n) => n.to_string(),
            EntityId::Text(s) => quote_literal(s),
        }
    }

    /// Parse the id out of an entity URL such as `.../Things(42)`
    pub fn from_self_link(link: &str) -> Option<Self> {
        let open = link.rfind('(')?;
        let close = link.rfind(')')?;
        if close <= open + 1 {
            return None;
        }
        let inner = &link[open + 1..close];
        if let Ok(n) = inner.parse::<i64>() {
            return Some(EntityId::Number(n));
        }
        let text = inner.strip_prefix('\'')?.strip_suffix('\'')?;
        Some(EntityId::Text(text.replace("''", "'")))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Number(n) => write!(f, "{}", n),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        EntityId::Number(n)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Text(s.to_string())
    }
}

/// Quote a string for use inside an OData filter or key predicate
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reference to another entity by id only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(id: EntityId) -> Self {
        Self { id }
    }
}

// ============================================================================
// Time
// ============================================================================

/// Time interval, serialized as `start/end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", format_time(&self.start), format_time(&self.end))
    }
}

/// A phenomenon or result time: an instant or an interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeObject {
    Instant(DateTime<Utc>),
    Interval(TimeInterval),
}

impl TimeObject {
    /// The latest point in time covered
    pub fn end(&self) -> DateTime<Utc> {
        match self {
            TimeObject::Instant(t) => *t,
            TimeObject::Interval(i) => i.end,
        }
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl fmt::Display for TimeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeObject::Instant(t) => f.write_str(&format_time(t)),
            TimeObject::Interval(i) => i.fmt(f),
        }
    }
}

impl FromStr for TimeObject {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| DateTime::parse_from_rfc3339(v.trim()).map(|t| t.with_timezone(&Utc));
        match s.split_once('/') {
            Some((start, end)) => Ok(TimeObject::Interval(TimeInterval::new(
                parse(start)?,
                parse(end)?,
            ))),
            None => Ok(TimeObject::Instant(parse(s)?)),
        }
    }
}

impl Serialize for TimeObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Common surface of every SensorThings entity type
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the entity set, e.g. `Things`
    const ENTITY_SET: &'static str;

    fn id(&self) -> Option<&EntityId>;

    fn set_id(&mut self, id: EntityId);

    fn properties(&self) -> Option<&Map<String, Value>>;

    /// Identifier of the entity in the source system
    fn local_id(&self) -> Option<String> {
        match self.properties()?.get(LOCAL_ID)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Reference to this entity, once it has an id
    fn as_ref_only(&self) -> Option<EntityRef> {
        self.id().cloned().map(EntityRef::new)
    }
}

macro_rules! impl_entity {
    ($ty:ty, $set:literal) => {
        impl Entity for $ty {
            const ENTITY_SET: &'static str = $set;

            fn id(&self) -> Option<&EntityId> {
                self.id.as_ref()
            }

            fn set_id(&mut self, id: EntityId) {
                self.id = Some(id);
            }

            fn properties(&self) -> Option<&Map<String, Value>> {
                Some(&self.properties)
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Location {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub description: String,
    pub encoding_type: String,
    pub location: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Thing {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(rename = "Locations", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<EntityRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Sensor {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub description: String,
    pub encoding_type: String,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservedProperty {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub definition: String,
    pub description: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureOfInterest {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub description: String,
    pub encoding_type: String,
    pub feature: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

/// Unit of a datastream; all fields absent means "not known yet"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfMeasurement {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub definition: Option<String>,
}

impl UnitOfMeasurement {
    /// Placeholder unit for datastreams whose unit is learned from data
    pub const NULL_UNIT: UnitOfMeasurement = UnitOfMeasurement {
        name: None,
        symbol: None,
        definition: None,
    };

    pub fn new(name: &str, symbol: &str, definition: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            symbol: Some(symbol.to_string()),
            definition: Some(definition.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL_UNIT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Datastream {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub name: String,
    pub description: String,
    pub observation_type: String,
    pub unit_of_measurement: UnitOfMeasurement,
    #[serde(skip_serializing)]
    pub phenomenon_time: Option<TimeObject>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(rename = "Thing", skip_serializing_if = "Option::is_none")]
    pub thing: Option<EntityRef>,
    #[serde(rename = "Sensor", skip_serializing_if = "Option::is_none")]
    pub sensor: Option<EntityRef>,
    #[serde(rename = "ObservedProperty", skip_serializing_if = "Option::is_none")]
    pub observed_property: Option<EntityRef>,
}

/// One measured value, the unit of output of every importer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Observation {
    #[serde(rename = "@iot.id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenomenon_time: Option<TimeObject>,
    pub result: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(rename = "Datastream", skip_serializing_if = "Option::is_none")]
    pub datastream: Option<EntityRef>,
    #[serde(rename = "FeatureOfInterest", skip_serializing_if = "Option::is_none")]
    pub feature_of_interest: Option<EntityRef>,
}

impl Observation {
    pub fn new(phenomenon_time: TimeObject, result: Value, datastream: EntityId) -> Self {
        Self {
            phenomenon_time: Some(phenomenon_time),
            result,
            datastream: Some(EntityRef::new(datastream)),
            ..Default::default()
        }
    }
}

impl_entity!(Location, "Locations");
impl_entity!(Thing, "Things");
impl_entity!(Sensor, "Sensors");
impl_entity!(ObservedProperty, "ObservedProperties");
impl_entity!(FeatureOfInterest, "FeaturesOfInterest");
impl_entity!(Datastream, "Datastreams");

impl Entity for Observation {
    const ENTITY_SET: &'static str = "Observations";

    fn id(&self) -> Option<&EntityId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_entity_id_literal() {
        assert_eq!(EntityId::Number(5).literal(), "5");
        assert_eq!(EntityId::from("STA.09.0101").literal(), "'STA.09.0101'");
        assert_eq!(EntityId::from("O'Brien").literal(), "'O''Brien'");
    }

    #[test]
    fn test_entity_id_from_self_link() {
        assert_eq!(
            EntityId::from_self_link("http://localhost/v1.1/Things(42)"),
            Some(EntityId::Number(42))
        );
        assert_eq!(
            EntityId::from_self_link("http://localhost/v1.1/Things('a''b')"),
            Some(EntityId::from("a'b"))
        );
        assert_eq!(EntityId::from_self_link("http://localhost/v1.1/Things"), None);
    }

    #[test]
    fn test_time_object_round_trip_through_string() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let interval = TimeObject::Interval(TimeInterval::new(start, end));

        let text = interval.to_string();
        assert_eq!(text, "2024-03-01T10:00:00Z/2024-03-01T10:30:00Z");
        assert_eq!(text.parse::<TimeObject>().unwrap(), interval);
        assert_eq!(interval.end(), end);
    }

    #[test]
    fn test_observation_serializes_references() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let obs = Observation::new(TimeObject::Instant(start), json!(12.5), EntityId::Number(7));

        let value = serde_json::to_value(&obs).unwrap();
        assert_eq!(
            value,
            json!({
                "phenomenonTime": "2024-03-01T10:00:00Z",
                "result": 12.5,
                "Datastream": {"@iot.id": 7}
            })
        );
    }

    #[test]
    fn test_partial_entity_deserializes() {
        let thing: Thing = serde_json::from_value(json!({
            "@iot.id": 3,
            "properties": {"localId": "STA.09.0101", "owner": "aqd"},
            "Locations": [{"@iot.id": 9, "name": "ignored"}]
        }))
        .unwrap();

        assert_eq!(thing.id, Some(EntityId::Number(3)));
        assert_eq!(thing.local_id().as_deref(), Some("STA.09.0101"));
        assert_eq!(thing.locations, vec![EntityRef::new(EntityId::Number(9))]);
        assert!(thing.name.is_empty());
    }

    #[test]
    fn test_null_unit_serializes_as_nulls() {
        let value = serde_json::to_value(UnitOfMeasurement::NULL_UNIT).unwrap();
        assert_eq!(value, json!({"name": null, "symbol": null, "definition": null}));
        assert!(UnitOfMeasurement::default().is_null());
    }
}
