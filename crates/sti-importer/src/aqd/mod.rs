//! Air quality e-reporting importer
//!
//! Mirrors the station network published through a WFS endpoint into the
//! SensorThings service and then pulls observations per datastream from the
//! matching SOS endpoint.
//!
//! Preparing the importer always preloads the entities owned by the
//! configured owner. With `full_import` the network itself is reconciled
//! first, stage by stage:
//!
//! | Stage                | Source document           | Entities                 |
//! |----------------------|---------------------------|--------------------------|
//! | `Stations`           | `AQD_Station`             | Location, Thing          |
//! | `ObservedProperties` | built-in pollutant list   | ObservedProperty         |
//! | `Sensors`            | `AQD_SamplingPointProcess`| Sensor                   |
//! | `FeaturesOfInterest` | `AQD_Sample`              | FeatureOfInterest        |
//! | `Datastreams`        | `AQD_SamplingPoint`       | Datastream               |
//!
//! A stage only reads what earlier stages put into the caches, so a failed
//! stage stops the pipeline.

pub mod features;
pub mod observations;
pub mod pollutants;

use crate::cache::EntityCache;
use crate::config::AqdConfig;
use crate::error::{ConvertError, ImportError, Result};
use crate::fetch::{ContentFetcher, Locator};
use crate::geo::{geo_json_point, CoordinateTransform, Wgs84Transform};
use crate::model::{
    Datastream, Entity, FeatureOfInterest, Location, ObservedProperty, Sensor, Thing,
    UnitOfMeasurement,
};
use crate::service::{local_id_filter, owner_filter, EntityService, DEFAULT_PAGE_SIZE};
use crate::xml::Element;
use features::{parse_process_id, DatastreamLinks, PROCESS_ID_PATTERN};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use observations::AqdObservationSource;

/// Reconciliation stages, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stations,
    ObservedProperties,
    Sensors,
    FeaturesOfInterest,
    Datastreams,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Stations,
        Stage::ObservedProperties,
        Stage::Sensors,
        Stage::FeaturesOfInterest,
        Stage::Datastreams,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Stations => "stations",
            Stage::ObservedProperties => "observed_properties",
            Stage::Sensors => "sensors",
            Stage::FeaturesOfInterest => "features_of_interest",
            Stage::Datastreams => "datastreams",
        };
        f.write_str(name)
    }
}

pub struct AqdImporter<S, F> {
    config: AqdConfig,
    service: Arc<S>,
    fetcher: F,
    transform: Box<dyn CoordinateTransform>,
    process_pattern: Regex,
    page_size: usize,
    locations: EntityCache<String, Location>,
    things: EntityCache<String, Thing>,
    observed_properties: EntityCache<i64, ObservedProperty>,
    sensors: EntityCache<String, Sensor>,
    features: EntityCache<String, FeatureOfInterest>,
    datastreams: EntityCache<String, Datastream>,
}

impl<S, F> AqdImporter<S, F>
where
    S: EntityService + 'static,
    F: ContentFetcher + 'static,
{
    pub fn new(config: AqdConfig, service: Arc<S>, fetcher: F) -> Result<Self> {
        let process_pattern = Regex::new(PROCESS_ID_PATTERN).map_err(|e| ImportError::InvalidPattern {
            pattern: PROCESS_ID_PATTERN.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            config,
            service,
            fetcher,
            transform: Box::new(Wgs84Transform),
            process_pattern,
            page_size: DEFAULT_PAGE_SIZE,
            locations: EntityCache::new(),
            things: EntityCache::new(),
            observed_properties: EntityCache::new(),
            sensors: EntityCache::new(),
            features: EntityCache::new(),
            datastreams: EntityCache::new(),
        })
    }

    pub fn with_transform(mut self, transform: Box<dyn CoordinateTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// `$top` used while preloading the caches
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Load the caches, reconcile the network if configured, and hand over
    /// to the observation source
    pub async fn prepare(mut self) -> Result<AqdObservationSource<S, F>> {
        self.load_caches().await?;
        if self.config.full_import {
            self.run_pipeline().await?;
        }

        info!(
            datastreams = self.datastreams.len(),
            features = self.features.len(),
            "Air quality importer ready"
        );
        Ok(AqdObservationSource::new(
            self.service,
            self.fetcher,
            self.features,
            self.datastreams,
            &self.config,
        ))
    }

    async fn load_caches(&mut self) -> Result<()> {
        let filter = owner_filter(&self.config.entity_owner);
        let service = self.service.as_ref();

        self.locations = EntityCache::new().with_page_size(self.page_size);
        self.locations
            .load(
                service,
                &filter,
                Some("id,name,description,properties,encodingType,location"),
                None,
                |e: &Location| e.local_id(),
            )
            .await?;

        self.things = EntityCache::new().with_page_size(self.page_size);
        self.things
            .load(
                service,
                &filter,
                Some("id,name,description,properties"),
                Some("Locations($select=id)"),
                |e: &Thing| e.local_id(),
            )
            .await?;

        self.observed_properties = EntityCache::new().with_page_size(self.page_size);
        self.observed_properties
            .load(
                service,
                &filter,
                Some("id,name,description,definition,properties"),
                None,
                |e: &ObservedProperty| e.local_id().and_then(|id| id.parse::<i64>().ok()),
            )
            .await?;

        self.sensors = EntityCache::new().with_page_size(self.page_size);
        self.sensors
            .load(
                service,
                &filter,
                Some("id,name,description,encodingType,metadata,properties"),
                None,
                |e: &Sensor| e.local_id(),
            )
            .await?;

        self.features = EntityCache::new().with_page_size(self.page_size);
        self.features
            .load(
                service,
                &filter,
                Some("id,name,description,encodingType,feature,properties"),
                None,
                |e: &FeatureOfInterest| e.local_id(),
            )
            .await?;

        self.datastreams = EntityCache::new().with_page_size(self.page_size);
        self.datastreams
            .load(
                service,
                &filter,
                Some("id,name,description,unitOfMeasurement,observationType,properties,phenomenonTime"),
                None,
                |e: &Datastream| e.local_id(),
            )
            .await?;

        Ok(())
    }

    async fn run_pipeline(&mut self) -> Result<()> {
        for (index, stage) in Stage::ORDER.iter().copied().enumerate() {
            info!(stage = %stage, "Starting reconciliation stage");
            if let Err(e) = self.run_stage(stage).await {
                let skipped: Vec<String> = Stage::ORDER[index + 1..]
                    .iter()
                    .map(Stage::to_string)
                    .collect();
                error!(
                    stage = %stage,
                    error = %e,
                    skipped = ?skipped,
                    "Reconciliation stage failed, skipping downstream stages"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Stations => self.import_stations().await,
            Stage::ObservedProperties => self.import_observed_properties().await,
            Stage::Sensors => self.import_sensors().await,
            Stage::FeaturesOfInterest => self.import_features().await,
            Stage::Datastreams => self.import_datastreams().await,
        }
    }

    async fn fetch_document(&self, what: &str, url: &str) -> Result<Element> {
        info!("Fetching {} from {}", what, url);
        let content = self.fetcher.fetch(&Locator::parse(url)).await?;
        info!("Fetched {} characters", content.len());
        Ok(Element::parse(&content)?)
    }

    /// GeoJSON point for a GML position, `None` when it cannot be converted
    fn geometry(&self, id: &str, pos: &str, srs_name: &str) -> Option<Value> {
        match self.transform.to_wgs84(pos, srs_name) {
            Ok((lon, lat)) => Some(geo_json_point(lon, lat)),
            Err(e) => {
                warn!(feature = id, error = %e, "Skipping feature without usable position");
                None
            }
        }
    }

    async fn import_stations(&mut self) -> Result<()> {
        let url = self.config.stations_url.clone();
        let root = self.fetch_document("stations", &url).await?;
        let stations = features::active_stations(&root);
        let owner = self.config.entity_owner.as_str();
        let service = self.service.as_ref();

        let mut created = 0;
        for station in &stations {
            let Some(geometry) = self.geometry(&station.id, &station.pos, &station.srs_name) else {
                continue;
            };
            let filter = local_id_filter(&station.id);

            let location = self
                .locations
                .find_or_create(service, station.id.clone(), &filter, station.location(owner, &url, geometry))
                .await?;

            let mut thing = station.thing(owner, &url);
            thing.locations.extend(location.entity().as_ref_only());
            let thing = self
                .things
                .find_or_create(service, station.id.clone(), &filter, thing)
                .await?;

            created += usize::from(location.is_created()) + usize::from(thing.is_created());
        }

        info!("Done with stations, {} active, {} entities created", stations.len(), created);
        Ok(())
    }

    async fn import_observed_properties(&mut self) -> Result<()> {
        let owner = self.config.entity_owner.as_str();
        let service = self.service.as_ref();

        for pollutant in pollutants::POLLUTANTS {
            self.observed_properties
                .find_or_create(
                    service,
                    pollutant.local_id,
                    &local_id_filter(&pollutant.local_id),
                    pollutant.observed_property(owner),
                )
                .await?;
        }

        info!("Done with observed properties, {} known", self.observed_properties.len());
        Ok(())
    }

    async fn import_sensors(&mut self) -> Result<()> {
        let url = self.config.processes_url.clone();
        let root = self.fetch_document("processes", &url).await?;
        let processes = features::processes(&root);
        let owner = self.config.entity_owner.as_str();
        let service = self.service.as_ref();

        let mut seen = HashSet::new();
        let mut imported = 0;
        for process in &processes {
            let Some(id) = parse_process_id(&self.process_pattern, &process.raw_id) else {
                error!("Process id {} does not match the expected pattern", process.raw_id);
                continue;
            };
            if id.instance > 1 {
                debug!(process = %process.raw_id, "Ignoring further instance of process");
                continue;
            }
            if !self.observed_properties.contains_key(&id.pollutant) {
                debug!(process = %process.raw_id, pollutant = id.pollutant, "Ignoring process for unknown pollutant");
                continue;
            }
            if !seen.insert(id.key.clone()) {
                debug!(process = %process.raw_id, "Ignoring duplicate process");
                continue;
            }

            self.sensors
                .find_or_create(
                    service,
                    id.key.clone(),
                    &local_id_filter(&id.key),
                    process.sensor(&id.key, owner, &url),
                )
                .await?;
            imported += 1;
        }

        info!("Done with processes, imported {} of {}", imported, processes.len());
        Ok(())
    }

    async fn import_features(&mut self) -> Result<()> {
        let url = self.config.samples_url.clone();
        let root = self.fetch_document("samples", &url).await?;
        let samples = features::samples(&root);
        let owner = self.config.entity_owner.as_str();
        let service = self.service.as_ref();

        for sample in &samples {
            let Some(geometry) = self.geometry(&sample.id, &sample.pos, &sample.srs_name) else {
                continue;
            };
            self.features
                .find_or_create(
                    service,
                    sample.id.clone(),
                    &local_id_filter(&sample.id),
                    sample.feature(owner, &url, geometry),
                )
                .await?;
        }

        info!("Done with samples, {} features of interest known", self.features.len());
        Ok(())
    }

    async fn import_datastreams(&mut self) -> Result<()> {
        let url = self.config.sampling_points_url.clone();
        let root = self.fetch_document("sampling points", &url).await?;
        let points = features::active_sampling_points(&root);
        let owner = self.config.entity_owner.as_str();
        let service = self.service.as_ref();

        let mut imported = 0;
        for point in &points {
            let Some(process) = parse_process_id(&self.process_pattern, &point.procedure) else {
                error!("Procedure {} of {} does not match the expected pattern", point.procedure, point.id);
                continue;
            };
            if !self.features.contains_key(&point.feature_of_interest) {
                error!("No feature of interest {} for {}", point.feature_of_interest, point.id);
            }

            let resolved = point
                .observed_property
                .parse::<i64>()
                .map_err(|_| ConvertError::MissingEntity {
                    kind: "ObservedProperty",
                    key: point.observed_property.clone(),
                })
                .and_then(|op| require(&self.observed_properties, &op, "ObservedProperty"))
                .and_then(|op| {
                    let sensor = require(&self.sensors, &process.key, "Sensor")?;
                    let thing = require(&self.things, &point.thing, "Thing")?;
                    Ok((op, sensor, thing))
                });
            let (op, sensor, thing) = match resolved {
                Ok(entities) => entities,
                Err(e) => {
                    debug!(sampling_point = %point.id, error = %e, "Skipping sampling point");
                    continue;
                }
            };

            let unit = self
                .datastreams
                .get(&point.id)
                .map(|ds| ds.unit_of_measurement.clone())
                .filter(|u| !u.is_null())
                .unwrap_or(UnitOfMeasurement::NULL_UNIT);
            let links = DatastreamLinks {
                thing: thing.as_ref_only(),
                sensor: sensor.as_ref_only(),
                observed_property: op.as_ref_only(),
            };
            let description = format!("{} at {}", op.name, thing.name);
            let datastream = point.datastream(owner, &url, description, unit, links);

            self.datastreams
                .find_or_create(service, point.id.clone(), &local_id_filter(&point.id), datastream)
                .await?;
            imported += 1;
        }

        info!("Done with sampling points, imported {} of {}", imported, points.len());
        Ok(())
    }
}

fn require<'a, K, E>(
    cache: &'a EntityCache<K, E>,
    key: &K,
    kind: &'static str,
) -> std::result::Result<&'a E, ConvertError>
where
    K: Hash + Eq + Clone + fmt::Display + fmt::Debug + Send + Sync,
    E: Entity,
{
    cache.get(key).ok_or_else(|| ConvertError::MissingEntity {
        kind,
        key: key.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::service::InMemoryService;
    use crate::source::ObservationSource;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const PERIOD_OPEN: &str = r#"<operationalActivityPeriod><OperationalActivityPeriod><activityTime><TimePeriod>
        <beginPosition>2001-01-01T00:00:00+01:00</beginPosition>
        <endPosition indeterminatePosition="unknown"/>
      </TimePeriod></activityTime></OperationalActivityPeriod></operationalActivityPeriod>"#;

    fn stations() -> String {
        format!(
            r#"<FeatureCollection xmlns:gml="g">
  <member><AQD_Station gml:id="STA.09.0101">
    <name>Taborstrasse</name>
    <geometry><Point srsName="urn:ogc:def:crs:EPSG::4326"><pos>48.2167 16.3817</pos></Point></geometry>
    {period}
  </AQD_Station></member>
  <member><AQD_Station gml:id="STA.09.0202">
    <name>Lambert projected</name>
    <geometry><Point srsName="EPSG:31287"><pos>480000 600000</pos></Point></geometry>
    {period}
  </AQD_Station></member>
</FeatureCollection>"#,
            period = PERIOD_OPEN
        )
    }

    const PROCESSES: &str = r#"<FeatureCollection xmlns:gml="g">
  <member><AQD_SamplingPointProcess gml:id="SPP.09.0101.1.8.1.1"/></member>
  <member><AQD_SamplingPointProcess gml:id="SPP.09.0101.1.8.2.1"/></member>
  <member><AQD_SamplingPointProcess gml:id="SPP.09.0101.1.8.1.1"/></member>
  <member><AQD_SamplingPointProcess gml:id="SPP.09.0101.1.99.1.1"/></member>
  <member><AQD_SamplingPointProcess gml:id="not-a-process"/></member>
</FeatureCollection>"#;

    const SAMPLES: &str = r#"<FeatureCollection xmlns:gml="g">
  <member><AQD_Sample gml:id="SAM.09.0101.8.1">
    <shape><Point srsName="urn:ogc:def:crs:EPSG::4326"><pos>48.2167 16.3817</pos></Point></shape>
  </AQD_Sample></member>
</FeatureCollection>"#;

    fn sampling_points() -> String {
        let point = |id: &str, pollutant: &str, process: &str| {
            format!(
                r#"<member><AQD_SamplingPoint xmlns:x="x" x:id="{id}">
    <broader x:href="http://example.org/STA.09.0101"/>
    <observingCapability><ObservingCapability>
      <featureOfInterest x:href="http://example.org/SAM.09.0101.8.1"/>
      <observedProperty x:href="http://dd.eionet.europa.eu/vocabulary/aq/pollutant/{pollutant}"/>
      <procedure x:href="http://example.org/{process}"/>
    </ObservingCapability></observingCapability>
    {period}
  </AQD_SamplingPoint></member>"#,
                id = id,
                pollutant = pollutant,
                process = process,
                period = PERIOD_OPEN
            )
        };
        format!(
            "<FeatureCollection>{}{}{}</FeatureCollection>",
            point("SPO.09.0101.8.1", "8", "SPP.09.0101.1.8.1.1"),
            point("SPO.09.0101.5.1", "5", "SPP.09.0101.1.5.1.1"),
            point("SPO.09.0101.bad", "8", "unparsable"),
        )
    }

    /// Serves documents by the last path segment of the requested URL
    struct Documents(HashMap<&'static str, String>);

    #[async_trait]
    impl ContentFetcher for Documents {
        async fn fetch(&self, locator: &Locator) -> Result<String> {
            let url = locator.to_string();
            self.0
                .iter()
                .find(|(name, _)| url.ends_with(*name))
                .map(|(_, body)| body.clone())
                .ok_or_else(|| ImportError::fetch(locator, "HTTP 404 Not Found"))
        }
    }

    fn documents() -> Documents {
        Documents(
            [
                ("stations", stations()),
                ("processes", PROCESSES.to_string()),
                ("samples", SAMPLES.to_string()),
                ("points", sampling_points()),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn config() -> AqdConfig {
        AqdConfig {
            full_import: true,
            stations_url: "http://wfs.test/stations".into(),
            processes_url: "http://wfs.test/processes".into(),
            samples_url: "http://wfs.test/samples".into(),
            sampling_points_url: "http://wfs.test/points".into(),
            entity_owner: "test-owner".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_import_reconciles_network() {
        let service = Arc::new(InMemoryService::new());
        let importer = AqdImporter::new(config(), service.clone(), documents()).unwrap();
        let source = importer.prepare().await.unwrap();

        // The projected station has no usable position.
        assert_eq!(service.create_count("Locations"), 1);
        assert_eq!(service.create_count("Things"), 1);
        assert_eq!(service.create_count("ObservedProperties"), pollutants::POLLUTANTS.len());
        // Second instance, duplicate, unknown pollutant and bad id are ignored.
        assert_eq!(service.create_count("Sensors"), 1);
        assert_eq!(service.create_count("FeaturesOfInterest"), 1);
        // The PM10 point has no sensor, the last one no parsable procedure.
        assert_eq!(service.create_count("Datastreams"), 1);
        assert_eq!(source.remaining(), 1);

        let things = service.entities::<Thing>();
        assert_eq!(things[0].locations.len(), 1);

        let datastream = &service.entities::<Datastream>()[0];
        assert_eq!(datastream.description, "NO2 at Taborstrasse");
        assert!(datastream.unit_of_measurement.is_null());
        assert_eq!(datastream.thing, things[0].as_ref_only());
        assert!(datastream.sensor.is_some());
        assert!(datastream.observed_property.is_some());
    }

    #[tokio::test]
    async fn test_second_import_creates_nothing() {
        let service = Arc::new(InMemoryService::new());
        AqdImporter::new(config(), service.clone(), documents())
            .unwrap()
            .prepare()
            .await
            .unwrap();
        let created: usize = ["Locations", "Things", "ObservedProperties", "Sensors", "FeaturesOfInterest", "Datastreams"]
            .iter()
            .map(|set| service.create_count(set))
            .sum();

        let source = AqdImporter::new(config(), service.clone(), documents())
            .unwrap()
            .prepare()
            .await
            .unwrap();
        let again: usize = ["Locations", "Things", "ObservedProperties", "Sensors", "FeaturesOfInterest", "Datastreams"]
            .iter()
            .map(|set| service.create_count(set))
            .sum();

        assert_eq!(created, again);
        assert!(source.has_next());
    }

    #[tokio::test]
    async fn test_failed_stage_stops_pipeline() {
        let service = Arc::new(InMemoryService::new());
        let mut docs = documents();
        docs.0.remove("processes");

        let result = AqdImporter::new(config(), service.clone(), docs)
            .unwrap()
            .prepare()
            .await;

        assert!(matches!(result, Err(ImportError::Fetch { .. })));
        assert_eq!(service.create_count("Things"), 1);
        assert_eq!(service.create_count("FeaturesOfInterest"), 0);
        assert_eq!(service.create_count("Datastreams"), 0);
    }

    #[tokio::test]
    async fn test_without_full_import_only_caches_are_loaded() {
        let service = Arc::new(InMemoryService::new());
        let config = AqdConfig {
            full_import: false,
            ..config()
        };
        let source = AqdImporter::new(config, service.clone(), Documents(HashMap::new()))
            .unwrap()
            .prepare()
            .await
            .unwrap();

        assert!(!source.has_next());
        assert_eq!(service.create_count("Things"), 0);
    }
}
