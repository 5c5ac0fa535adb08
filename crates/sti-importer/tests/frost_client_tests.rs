//! SensorThings client against a mock server

mod common;

use common::{init_tracing, list_body, service_root};
use serde_json::json;
use std::time::Duration;
use sti_importer::model::{Entity, EntityId, Thing};
use sti_importer::service::{local_id_filter, EntityService, Query};
use sti_importer::{EntityCache, FrostClient, Reconciled, ServiceError};
use wiremock::{
    matchers::{body_partial_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn client(server: &MockServer) -> FrostClient {
    FrostClient::new(&service_root(server), Duration::from_secs(5)).unwrap()
}

fn thing_json(id: i64, local_id: &str) -> serde_json::Value {
    json!({
        "@iot.id": id,
        "name": format!("Station {}", local_id),
        "description": "",
        "properties": {"localId": local_id, "owner": "aqd"}
    })
}

#[tokio::test]
async fn test_cache_load_follows_next_links() {
    init_tracing();
    let server = MockServer::start().await;
    let next = format!("{}/v1.1/Things?$skip=2", server.uri());

    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .and(query_param("$filter", "properties/owner eq 'aqd'"))
        .and(query_param("$top", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_body(
            json!([thing_json(1, "STA.1"), thing_json(2, "STA.2")]),
            Some(next),
        )))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .and(query_param("$skip", "2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(list_body(json!([thing_json(3, "STA.3")]), None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut cache: EntityCache<String, Thing> = EntityCache::new().with_page_size(2);
    let cached = cache
        .load(&client, "properties/owner eq 'aqd'", None, None, |t| t.local_id())
        .await
        .unwrap();

    assert_eq!(cached, 3);
    assert_eq!(
        cache.get(&"STA.3".to_string()).and_then(|t| t.id.clone()),
        Some(EntityId::Number(3))
    );
}

#[tokio::test]
async fn test_find_or_create_posts_once() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .and(query_param("$filter", "properties/localId eq 'STA.9'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_body(json!([]), None)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Things"))
        .and(body_partial_json(json!({"name": "Station STA.9"})))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", format!("{}/v1.1/Things(42)", server.uri()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut cache: EntityCache<String, Thing> = EntityCache::new();
    let desired = Thing {
        name: "Station STA.9".into(),
        ..Default::default()
    };
    let filter = local_id_filter("STA.9");

    let first = cache
        .find_or_create(&client, "STA.9".to_string(), &filter, desired.clone())
        .await
        .unwrap();
    assert!(first.is_created());
    assert_eq!(first.entity().id, Some(EntityId::Number(42)));

    let second = cache
        .find_or_create(&client, "STA.9".to_string(), &filter, desired)
        .await
        .unwrap();
    assert!(matches!(second, Reconciled::Cached(_)));
}

#[tokio::test]
async fn test_create_reads_id_from_body_without_location() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1.1/Things"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"@iot.id": "abc"})))
        .mount(&server)
        .await;

    let created = client(&server).create(&Thing::default()).await.unwrap();
    assert_eq!(created.id, Some(EntityId::from("abc")));
}

#[tokio::test]
async fn test_create_without_any_id_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1.1/Things"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let result = client(&server).create(&Thing::default()).await;
    assert!(matches!(result, Err(ServiceError::MissingId("Things"))));
}

#[tokio::test]
async fn test_update_patches_entity_url() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/v1.1/Things(42)"))
        .and(body_partial_json(json!({"description": "moved"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let thing = Thing {
        id: Some(EntityId::Number(42)),
        description: "moved".into(),
        ..Default::default()
    };
    client(&server).update(&thing).await.unwrap();
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .mount(&server)
        .await;

    let result = client(&server)
        .query::<Thing>(&Query::entities::<Thing>().top(1))
        .await;
    match result {
        Err(ServiceError::Status { status, body, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("expected status error, got {:?}", other.map(|p| p.values.len())),
    }
}

#[tokio::test]
async fn test_dry_run_sends_no_mutations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server).with_dry_run(true);
    let created = client.create(&Thing::default()).await.unwrap();
    assert_eq!(created.id, Some(EntityId::Number(-1)));
    client.update(&created).await.unwrap();
}
