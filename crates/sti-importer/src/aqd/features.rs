//! Feature extraction from the WFS feature collections
//!
//! Everything here is pure: elements in, plain structs and unsaved
//! entities out. Reconciliation against the service happens in the parent
//! module.

use crate::model::{
    Datastream, EntityRef, FeatureOfInterest, Location, Sensor, Thing, UnitOfMeasurement,
    ENCODING_GEO_JSON, LOCAL_ID, OBSERVATION_TYPE_MEASUREMENT, OWNER,
};
use crate::xml::{href_tail, Element};
use regex::Regex;
use serde_json::{Map, Value};

/// Sampling point process ids: `SPP.<n>.<station>.<n>.<pollutant>.<instance>.<n>`
///
/// Group 1 is the process key shared by all instances, group 2 the
/// pollutant code and group 3 the instance number.
pub const PROCESS_ID_PATTERN: &str =
    r"^(SPP\.[0-9]+\.[0-9A-Za-z]+\.[0-9]+\.([0-9]+))\.([0-9]+)\.([0-9]+)$";

const ACTIVITY_END: &str =
    "operationalActivityPeriod/OperationalActivityPeriod/activityTime/TimePeriod/endPosition";
const ACTIVITY_BEGIN: &str =
    "operationalActivityPeriod/OperationalActivityPeriod/activityTime/TimePeriod/beginPosition";

const NAMESPACE: &str = "namespace";
const METADATA: &str = "metadata";

const MEDIA_AIR: &str = "http://inspire.ec.europa.eu/codeList/MediaValue/air";
const REGIME_CONTINUOUS: &str =
    "http://inspire.ec.europa.eu/codeList/MeasurementRegimeValue/continuousDataCollection";
const PROCESS_TYPE: &str = "http://inspire.ec.europa.eu/codeList/ProcessTypeValue/process";
const RESULT_NATURE: &str = "http://inspire.ec.europa.eu/codeList/ResultNatureValue/primary";

const RELATED_PARTY: &str = "responsibleParty/RelatedParty";
const CONTACT: &str = "responsibleParty/RelatedParty/contact/Contact";
const ADDRESS: &str = "responsibleParty/RelatedParty/contact/Contact/address/AddressRepresentation";

/// Whether an activity period is still open (end position "unknown")
fn is_active(feature: &Element) -> bool {
    feature
        .find_all(ACTIVITY_END)
        .iter()
        .any(|end| end.attr("indeterminatePosition") == Some("unknown"))
}

fn base_properties(owner: &str, local_id: &str, namespace: &str, metadata: &str) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert(OWNER.to_string(), Value::from(owner));
    properties.insert(LOCAL_ID.to_string(), Value::from(local_id));
    properties.insert(NAMESPACE.to_string(), Value::from(namespace));
    properties.insert(METADATA.to_string(), Value::from(metadata));
    properties
}

// ============================================================================
// Stations
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub begin_time: String,
    pub end_time: String,
    pub srs_name: String,
    pub pos: String,
}

impl Station {
    pub fn from_element(station: &Element) -> Self {
        Self {
            id: station.attr("id").unwrap_or_default().to_string(),
            namespace: station.value("inspireId/Identifier/namespace"),
            name: station.value("name").trim().to_string(),
            begin_time: station.value(ACTIVITY_BEGIN).trim().to_string(),
            end_time: station.value(ACTIVITY_END).trim().to_string(),
            srs_name: station.value("geometry/Point/@srsName"),
            pos: station.value("geometry/Point/pos"),
        }
    }

    pub fn location(&self, owner: &str, metadata: &str, geometry: Value) -> Location {
        Location {
            id: None,
            name: self.name.clone(),
            description: format!("Location of air quality station {}", self.name),
            encoding_type: ENCODING_GEO_JSON.to_string(),
            location: geometry,
            properties: base_properties(owner, &self.id, &self.namespace, metadata),
        }
    }

    pub fn thing(&self, owner: &str, metadata: &str) -> Thing {
        let mut properties = base_properties(owner, &self.id, &self.namespace, metadata);
        properties.insert("mediaMonitored".to_string(), Value::from(MEDIA_AIR));
        properties.insert("measurementRegime".to_string(), Value::from(REGIME_CONTINUOUS));
        properties.insert("mobile".to_string(), Value::Bool(false));
        properties.insert("beginTime".to_string(), Value::from(self.begin_time.as_str()));
        if !self.end_time.is_empty() {
            properties.insert("endTime".to_string(), Value::from(self.end_time.as_str()));
        }

        Thing {
            id: None,
            name: self.name.clone(),
            description: format!("Air quality station {}", self.name),
            properties,
            locations: Vec::new(),
        }
    }
}

/// Stations with an open activity period
pub fn active_stations(collection: &Element) -> Vec<Station> {
    collection
        .find_all("member/AQD_Station")
        .into_iter()
        .filter(|s| is_active(s))
        .map(Station::from_element)
        .collect()
}

// ============================================================================
// Sampling point processes
// ============================================================================

/// The parts of a sampling point process id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessId {
    pub key: String,
    pub pollutant: i64,
    pub instance: i64,
}

pub fn parse_process_id(pattern: &Regex, raw: &str) -> Option<ProcessId> {
    let captures = pattern.captures(raw)?;
    Some(ProcessId {
        key: captures.get(1)?.as_str().to_string(),
        pollutant: captures.get(2)?.as_str().parse().ok()?,
        instance: captures.get(3)?.as_str().parse().ok()?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    pub raw_id: String,
    pub namespace: String,
    pub measurement_equipment: String,
    pub sampling_equipment: String,
    pub other_equipment: String,
    pub measurement_type: String,
    pub method: String,
    pub demonstration_report: String,
    pub responsible_party: Map<String, Value>,
}

impl Process {
    pub fn from_element(process: &Element) -> Self {
        let party_fields = [
            ("individualName", format!("{}/individualName/LocalisedCharacterString", RELATED_PARTY)),
            ("organisationName", format!("{}/organisationName/LocalisedCharacterString", RELATED_PARTY)),
            (
                "adminUnit",
                format!("{}/adminUnit/GeographicalName/spelling/SpellingOfName/text", ADDRESS),
            ),
            ("locatorDesignator", format!("{}/locatorDesignator", ADDRESS)),
            ("postCode", format!("{}/postCode", ADDRESS)),
            ("electronicMailAddress", format!("{}/electronicMailAddress", CONTACT)),
            ("telephoneVoice", format!("{}/telephoneVoice", CONTACT)),
            ("website", format!("{}/website", CONTACT)),
        ];

        let mut responsible_party = Map::new();
        for (key, path) in party_fields {
            let value = process.value(&path);
            let value = value.trim();
            if !value.is_empty() {
                responsible_party.insert(key.to_string(), Value::from(value));
            }
        }

        Self {
            raw_id: process.attr("id").unwrap_or_default().to_string(),
            namespace: process.value("inspireId/Identifier/namespace"),
            measurement_equipment: process
                .value("measurementEquipment/MeasurementEquipment/equipment/@href"),
            sampling_equipment: process.value("samplingEquipment/SamplingEquipment/equipment/@href"),
            other_equipment: process
                .value("samplingEquipment/SamplingEquipment/otherEquipment")
                .trim()
                .to_string(),
            measurement_type: process.value("measurementType/@href"),
            method: process.value("measurementMethod/MeasurementMethod/measurementMethod/@href"),
            demonstration_report: process
                .value("equivalenceDemonstration/EquivalenceDemonstration/demonstrationReport")
                .trim()
                .to_string(),
            responsible_party,
        }
    }

    /// Sensor name and description, from the most specific equipment given
    pub fn name_and_description(&self) -> (String, String) {
        if !self.measurement_equipment.is_empty() {
            (
                href_tail(&self.measurement_equipment).to_string(),
                self.measurement_equipment.clone(),
            )
        } else if !self.other_equipment.is_empty() {
            (self.other_equipment.clone(), self.sampling_equipment.clone())
        } else {
            (
                href_tail(&self.sampling_equipment).to_string(),
                self.sampling_equipment.clone(),
            )
        }
    }

    pub fn sensor(&self, key: &str, owner: &str, metadata: &str) -> Sensor {
        let (name, description) = self.name_and_description();
        let mut properties = base_properties(owner, key, &self.namespace, metadata);
        properties.insert("measurementtype".to_string(), Value::from(self.measurement_type.as_str()));
        properties.insert("method".to_string(), Value::from(self.method.as_str()));
        if !self.responsible_party.is_empty() {
            properties.insert(
                "responsibleParty".to_string(),
                Value::Object(self.responsible_party.clone()),
            );
        }

        Sensor {
            id: None,
            name,
            description,
            encoding_type: "application/pdf".to_string(),
            metadata: Value::from(self.demonstration_report.as_str()),
            properties,
        }
    }
}

pub fn processes(collection: &Element) -> Vec<Process> {
    collection
        .find_all("member/AQD_SamplingPointProcess")
        .into_iter()
        .map(Process::from_element)
        .collect()
}

// ============================================================================
// Samples
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: String,
    pub namespace: String,
    pub srs_name: String,
    pub pos: String,
}

impl Sample {
    pub fn from_element(sample: &Element) -> Self {
        Self {
            id: sample.attr("id").unwrap_or_default().to_string(),
            namespace: sample.value("inspireId/Identifier/namespace"),
            srs_name: sample.value("shape/Point/@srsName"),
            pos: sample.value("shape/Point/pos"),
        }
    }

    pub fn feature(&self, owner: &str, metadata: &str, geometry: Value) -> FeatureOfInterest {
        FeatureOfInterest {
            id: None,
            name: self.id.clone(),
            description: format!("Air quality sample {}", self.id),
            encoding_type: ENCODING_GEO_JSON.to_string(),
            feature: geometry,
            properties: base_properties(owner, &self.id, &self.namespace, metadata),
        }
    }
}

pub fn samples(collection: &Element) -> Vec<Sample> {
    collection
        .find_all("member/AQD_Sample")
        .into_iter()
        .map(Sample::from_element)
        .collect()
}

// ============================================================================
// Sampling points
// ============================================================================

/// A sampling point and the local ids of everything it references
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPoint {
    pub id: String,
    pub namespace: String,
    pub feature_of_interest: String,
    pub observed_property: String,
    pub procedure: String,
    pub thing: String,
}

impl SamplingPoint {
    pub fn from_element(point: &Element) -> Self {
        let capability = |name: &str| {
            let href = point.value(&format!(
                "observingCapability/ObservingCapability/{}/@href",
                name
            ));
            href_tail(&href).to_string()
        };

        Self {
            id: point.attr("id").unwrap_or_default().to_string(),
            namespace: point.value("inspireId/Identifier/namespace"),
            feature_of_interest: capability("featureOfInterest"),
            observed_property: capability("observedProperty"),
            procedure: capability("procedure"),
            thing: href_tail(&point.value("broader/@href")).to_string(),
        }
    }

    /// The datastream this sampling point describes, linked to resolved entities
    pub fn datastream(
        &self,
        owner: &str,
        metadata: &str,
        description: String,
        unit: UnitOfMeasurement,
        links: DatastreamLinks,
    ) -> Datastream {
        let mut properties = base_properties(owner, &self.id, &self.namespace, metadata);
        properties.insert("processType".to_string(), Value::from(PROCESS_TYPE));
        properties.insert("resultNature".to_string(), Value::from(RESULT_NATURE));
        properties.insert(
            "featureOfInterestLocalId".to_string(),
            Value::from(self.feature_of_interest.as_str()),
        );

        Datastream {
            id: None,
            name: self.id.clone(),
            description,
            observation_type: OBSERVATION_TYPE_MEASUREMENT.to_string(),
            unit_of_measurement: unit,
            phenomenon_time: None,
            properties,
            thing: links.thing,
            sensor: links.sensor,
            observed_property: links.observed_property,
        }
    }
}

/// References a new datastream is created with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatastreamLinks {
    pub thing: Option<EntityRef>,
    pub sensor: Option<EntityRef>,
    pub observed_property: Option<EntityRef>,
}

/// Sampling points with an open activity period
pub fn active_sampling_points(collection: &Element) -> Vec<SamplingPoint> {
    collection
        .find_all("member/AQD_SamplingPoint")
        .into_iter()
        .filter(|p| is_active(p))
        .map(SamplingPoint::from_element)
        .collect()
}
