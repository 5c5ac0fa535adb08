//! Observation retrieval from the SOS endpoint, one datastream per batch

use crate::cache::EntityCache;
use crate::config::{AqdConfig, StartTimeConfig};
use crate::error::{ConvertError, ImportError, Result};
use crate::fetch::{ContentFetcher, Locator};
use crate::model::{
    Datastream, EntityId, EntityRef, FeatureOfInterest, Observation, TimeInterval, TimeObject,
    UnitOfMeasurement,
};
use crate::service::{EntityService, ServiceError};
use crate::source::ObservationSource;
use crate::swe::{DataArray, DecodedRecord, FieldSpec, SweDecoder};
use crate::translate::Translator;
use crate::xml::{href_tail, Element};
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SAMPLING_POINT_PARAMETER: &str = "processparameter/SamplingPoint";

/// Names of the data array fields holding the interval and the value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames {
    pub start_time: String,
    pub end_time: String,
    pub value: String,
}

impl FieldNames {
    fn specs(&self) -> [FieldSpec; 3] {
        [
            FieldSpec::text(&self.start_time),
            FieldSpec::text(&self.end_time),
            FieldSpec::numeric(&self.value),
        ]
    }
}

pub struct AqdObservationSource<S, F> {
    service: Arc<S>,
    fetcher: F,
    features: EntityCache<String, FeatureOfInterest>,
    datastreams: EntityCache<String, Datastream>,
    pending: VecDeque<String>,
    observations_url: String,
    fields: FieldNames,
    start_time: StartTimeConfig,
    now: Option<DateTime<Utc>>,
}

impl<S: EntityService, F: ContentFetcher> AqdObservationSource<S, F> {
    pub fn new(
        service: Arc<S>,
        fetcher: F,
        features: EntityCache<String, FeatureOfInterest>,
        datastreams: EntityCache<String, Datastream>,
        config: &AqdConfig,
    ) -> Self {
        let pending = datastreams.keys().cloned().collect();
        Self {
            service,
            fetcher,
            features,
            datastreams,
            pending,
            observations_url: config.observations_url.clone(),
            fields: FieldNames {
                start_time: config.field_start_time.clone(),
                end_time: config.field_end_time.clone(),
                value: config.field_value.clone(),
            },
            start_time: config.start_time.clone(),
            now: None,
        }
    }

    /// Use a fixed "now" for the end of every observation window
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Datastreams not yet imported
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    fn window(&self, datastream: &Datastream) -> TimeInterval {
        let now = self.now.unwrap_or_else(Utc::now);
        let start = self.start_time.start_for(datastream, now);
        TimeInterval::new(truncate_to_minute(start), truncate_to_minute(now))
    }

    fn observations_url(&self, local_id: &str, window: &TimeInterval) -> String {
        let mut translator = Translator::new();
        translator
            .put("datastreamLocalId", local_id)
            .put("phenomenonTimeInterval", window.to_string());
        translator.replace_in(&self.observations_url, false)
    }

    async fn import_datastream(&mut self, local_id: &str) -> Result<Vec<Observation>> {
        let datastream = self
            .datastreams
            .get(&local_id.to_string())
            .cloned()
            .ok_or_else(|| ImportError::format(format!("Datastream {} is not cached", local_id)))?;
        let datastream_id = datastream
            .id
            .clone()
            .ok_or(ImportError::Service(ServiceError::MissingId("Datastreams")))?;

        let window = self.window(&datastream);
        let url = self.observations_url(local_id, &window);
        debug!(datastream = local_id, url = %url, "Fetching observations");
        let content = self.fetcher.fetch(&Locator::parse(&url)).await?;
        let root = Element::parse(&content)?;

        let observation = root
            .find("observationData/OM_Observation")
            .ok_or_else(|| ImportError::format("Response holds no OM_Observation"))?;

        let sampling_point = sampling_point_of(observation);
        if !sampling_point.ends_with(local_id) {
            error!(
                "Returned data has sampling point {}, but expected data for {}",
                sampling_point, local_id
            );
        }

        let feature_href = observation.value("featureOfInterest/@href");
        let Some(feature_id) = self
            .features
            .get(&href_tail(&feature_href).to_string())
            .and_then(|f| f.id.clone())
        else {
            error!("Could not find feature of interest for {}", feature_href);
            return Ok(Vec::new());
        };

        let array = observation
            .find("result/DataArray")
            .ok_or_else(|| ImportError::format("Observation result holds no DataArray"))?;
        let mut decoder = SweDecoder::new(DataArray::from_element(array)?);
        decoder.configure(&self.fields.specs());
        decoder.parse()?;
        info!("Parsing {} observations for {}", decoder.element_count(), local_id);

        if datastream.unit_of_measurement.is_null() && decoder.has_next() {
            self.learn_unit(local_id, &mut decoder).await?;
        }

        let mut observations = Vec::with_capacity(decoder.block_count());
        while let Some(record) = decoder.next_record() {
            match to_observation(&record, &self.fields, &datastream_id, &feature_id) {
                Ok(o) => observations.push(o),
                Err(e) => warn!(datastream = local_id, error = %e, "Skipping observation"),
            }
        }
        Ok(observations)
    }

    /// Replace a placeholder unit with the one the value field declares
    ///
    /// Reads the first record and rewinds the decoder afterwards.
    async fn learn_unit(&mut self, local_id: &str, decoder: &mut SweDecoder) -> Result<()> {
        decoder.next_record();
        let uom = decoder
            .array()
            .field(&self.fields.value)
            .and_then(|f| f.uom.clone());
        decoder.reset();

        let Some(uom) = uom else {
            debug!(datastream = local_id, "Value field declares no unit");
            return Ok(());
        };
        let name = href_tail(&uom).to_string();
        let unit = UnitOfMeasurement::new(&name, &name, &uom);

        let updated = self
            .datastreams
            .update_if_changed(self.service.as_ref(), &local_id.to_string(), |ds| {
                if ds.unit_of_measurement == unit {
                    return false;
                }
                ds.unit_of_measurement = unit;
                true
            })
            .await?;
        if updated {
            info!(datastream = local_id, unit = %name, "Set unit of measurement");
        }
        Ok(())
    }
}

/// `value/@href` of the named value whose name is the sampling point parameter
fn sampling_point_of(observation: &Element) -> String {
    observation
        .find_all("parameter/NamedValue")
        .into_iter()
        .find(|nv| nv.value("name/@href").ends_with(SAMPLING_POINT_PARAMETER))
        .map(|nv| nv.value("value/@href"))
        .unwrap_or_default()
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(t)
}

fn parse_instant(raw: &str) -> std::result::Result<DateTime<Utc>, ConvertError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConvertError::time(raw, e))
}

fn to_observation(
    record: &DecodedRecord<'_>,
    fields: &FieldNames,
    datastream: &EntityId,
    feature: &EntityId,
) -> std::result::Result<Observation, ConvertError> {
    let field = |name: &String| {
        record
            .get(name)
            .ok_or_else(|| ConvertError::MissingField(name.clone()))
    };

    let raw_value = field(&fields.value)?;
    let value = raw_value
        .trim()
        .parse::<serde_json::Number>()
        .map_err(|_| ConvertError::Number(raw_value.to_string()))?;
    let start = parse_instant(field(&fields.start_time)?)?;
    let end = parse_instant(field(&fields.end_time)?)?;

    let mut observation = Observation::new(
        TimeObject::Interval(TimeInterval::new(start, end)),
        Value::Number(value),
        datastream.clone(),
    );
    observation.feature_of_interest = Some(EntityRef::new(feature.clone()));
    Ok(observation)
}

#[async_trait]
impl<S, F> ObservationSource for AqdObservationSource<S, F>
where
    S: EntityService,
    F: ContentFetcher,
{
    fn has_next(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn next_batch(&mut self) -> Result<Vec<Observation>> {
        let Some(local_id) = self.pending.pop_front() else {
            return Ok(Vec::new());
        };

        match self.import_datastream(&local_id).await {
            Ok(observations) => Ok(observations),
            Err(e) => {
                error!(datastream = %local_id, error = %e, "Failed to import data for datastream");
                Ok(Vec::new())
            }
        }
    }
}
