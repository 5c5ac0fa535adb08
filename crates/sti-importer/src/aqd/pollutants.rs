//! Pollutants reported by the air quality feed

use crate::model::{ObservedProperty, LOCAL_ID, OWNER};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pollutant {
    /// Code in the EEA pollutant vocabulary, also the observed property's local id
    pub local_id: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub recommended_unit: &'static str,
    pub definition: &'static str,
}

const fn pollutant(
    local_id: i64,
    name: &'static str,
    recommended_unit: &'static str,
    definition: &'static str,
) -> Pollutant {
    Pollutant {
        local_id,
        name,
        description: name,
        recommended_unit,
        definition,
    }
}

pub const POLLUTANTS: &[Pollutant] = &[
    pollutant(1, "SO2", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/1"),
    pollutant(5, "PM10", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/5"),
    pollutant(7, "O3", "µg/m3", "http://dd.eionet.europa.eu/vocabularyconcept/aq/pollutant/7"),
    pollutant(8, "NO2", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/8"),
    pollutant(9, "NOX as NO2", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/9"),
    pollutant(10, "CO", "mg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/10"),
    pollutant(38, "NO", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/38"),
    pollutant(71, "CO2", "ppmv", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/71"),
    pollutant(6001, "PM2.5", "µg/m3", "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/6001"),
];

pub fn lookup(local_id: i64) -> Option<&'static Pollutant> {
    POLLUTANTS.iter().find(|p| p.local_id == local_id)
}

impl Pollutant {
    pub fn observed_property(&self, owner: &str) -> ObservedProperty {
        let mut properties = serde_json::Map::new();
        properties.insert(LOCAL_ID.to_string(), Value::from(self.local_id));
        properties.insert(OWNER.to_string(), Value::from(owner));
        properties.insert("recommendedUnit".to_string(), Value::from(self.recommended_unit));

        ObservedProperty {
            id: None,
            name: self.name.to_string(),
            definition: self.definition.to_string(),
            description: self.description.to_string(),
            properties,
        }
    }
}
