//! Integration tests for the HTTP shape engine against a mock shape endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use url::Url;

use common::{document_ids, document_title, insert_document, manager_with, options};
use shapesync::db::{IdentityId, MemoryStorage, ReplicaDb};
use shapesync::remote::{
    load_position, save_position, HttpShapeSubscriber, RetryPolicy, ShapeClient, StreamPosition,
};
use shapesync::schema::SchemaRegistry;
use shapesync::shape::{
    ReadinessPhase, ShapeCoordinator, ShapeDescriptor, ShapeError, ShapeKey, ShapeSubscriber,
    SubscriptionCallbacks, SubscriptionConfig, TransportError,
};
use shapesync::{SyncClient, SyncError};

fn subscriber(server: &MockServer) -> HttpShapeSubscriber {
    let client = ShapeClient::new(
        Url::parse(&server.base_url()).unwrap(),
        Duration::from_secs(5),
    )
    .unwrap();
    HttpShapeSubscriber::new(
        client,
        RetryPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
        },
    )
}

fn client(server: &MockServer) -> SyncClient {
    SyncClient::new(
        manager_with(Arc::new(MemoryStorage::new())),
        ShapeCoordinator::new(
            Arc::new(subscriber(server)),
            options(
                Duration::from_secs(5),
                Duration::from_millis(20),
                Duration::from_millis(50),
            ),
        ),
    )
}

fn document(id: i64, search_space_id: i64, title: &str, operation: &str) -> serde_json::Value {
    json!({
        "key": format!("\"public\".\"documents\"/\"{id}\""),
        "value": {
            "id": id,
            "search_space_id": search_space_id,
            "title": title,
            "document_type": "FILE",
            "created_at": "2024-03-01T00:00:00Z"
        },
        "headers": {"operation": operation}
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 5s");
}

fn position(db: &ReplicaDb, key: &ShapeKey) -> Option<StreamPosition> {
    db.with_conn(|conn| load_position(conn, key.as_str())).unwrap()
}

#[tokio::test]
async fn test_snapshot_then_live_changes() {
    let server = MockServer::start_async().await;
    let snapshot = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/shape").query_param("offset", "-1");
            then.status(200)
                .header("electric-handle", "h1")
                .header("electric-offset", "0_2")
                .header("electric-up-to-date", "true")
                .json_body(json!([
                    document(1, 1, "first", "insert"),
                    document(2, 1, "second", "insert"),
                    {"headers": {"control": "up-to-date"}}
                ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/shape")
                .query_param("live", "true")
                .query_param("offset", "0_2");
            then.status(200)
                .header("electric-handle", "h1")
                .header("electric-offset", "0_3")
                .header("electric-up-to-date", "true")
                .json_body(json!([
                    {"key": "1", "value": {"id": 1, "title": "edited"}, "headers": {"operation": "update"}},
                    {"headers": {"control": "up-to-date"}}
                ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/shape")
                .query_param("live", "true")
                .query_param("offset", "0_3");
            then.status(200)
                .header("electric-handle", "h1")
                .header("electric-offset", "0_3")
                .header("electric-up-to-date", "true")
                .delay(Duration::from_millis(500))
                .json_body(json!([]));
        })
        .await;

    let client = client(&server);
    client.initialize("u1").await.unwrap();
    let handle = client
        .sync_shape(ShapeDescriptor::new("documents").filter("search_space_id = 1"))
        .await
        .unwrap();

    assert_eq!(handle.initial_sync().await.unwrap(), ReadinessPhase::CaughtUp);
    assert!(handle.is_up_to_date());
    assert_eq!(handle.stream_handle().as_deref(), Some("h1"));
    snapshot.assert_async().await;

    let db = client.database().await.unwrap();
    assert_eq!(document_ids(&db), vec![1, 2]);

    wait_until(|| document_title(&db, 1).as_deref() == Some("edited")).await;
    assert_eq!(document_title(&db, 2).as_deref(), Some("second"));
    wait_until(|| {
        position(&db, handle.shape_key()).map(|p| p.offset) == Some("0_3".to_string())
    })
    .await;

    client.release().await;
}

#[tokio::test]
async fn test_resume_then_forced_refetch() {
    let server = MockServer::start_async().await;
    let gone = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/shape")
                .query_param("offset", "5_0")
                .query_param("handle", "h1");
            then.status(409).header("electric-handle", "h2");
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/shape")
                .query_param("offset", "-1")
                .query_param("handle", "h2");
            then.status(200)
                .header("electric-handle", "h2")
                .header("electric-offset", "7_0")
                .header("electric-up-to-date", "true")
                .json_body(json!([
                    document(1, 1, "fresh", "insert"),
                    document(4, 1, "new", "insert")
                ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/shape").query_param("live", "true");
            then.status(200)
                .header("electric-handle", "h2")
                .header("electric-offset", "7_0")
                .header("electric-up-to-date", "true")
                .delay(Duration::from_millis(500))
                .json_body(json!([]));
        })
        .await;

    let client = client(&server);
    client.initialize("u1").await.unwrap();
    let db = client.database().await.unwrap();

    insert_document(&db, 1, 1, "stale");
    insert_document(&db, 2, 1, "gone upstream");
    insert_document(&db, 3, 2, "other space");
    let filter = "search_space_id = 1";
    let key = ShapeKey::derive(&IdentityId::new("u1").unwrap(), 1, "documents", Some(filter));
    db.with_conn(|conn| {
        save_position(
            conn,
            key.as_str(),
            &StreamPosition {
                handle: Some("h1".to_string()),
                offset: "5_0".to_string(),
            },
        )
    })
    .unwrap();

    let handle = client
        .sync_shape(ShapeDescriptor::new("documents").filter(filter))
        .await
        .unwrap();
    assert_eq!(handle.shape_key(), &key);
    assert_eq!(handle.initial_sync().await.unwrap(), ReadinessPhase::CaughtUp);

    gone.assert_async().await;
    fresh.assert_async().await;
    assert_eq!(document_ids(&db), vec![1, 3, 4]);
    assert_eq!(document_title(&db, 1).as_deref(), Some("fresh"));
    assert_eq!(
        position(&db, &key),
        Some(StreamPosition {
            handle: Some("h2".to_string()),
            offset: "7_0".to_string(),
        })
    );
    assert_eq!(handle.stream_handle().as_deref(), Some("h2"));

    client.release().await;
}

#[tokio::test]
async fn test_rejected_shape_is_establishment_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/shape");
            then.status(400).body("invalid where clause");
        })
        .await;

    let client = client(&server);
    client.initialize("u1").await.unwrap();
    let err = client
        .sync_shape(ShapeDescriptor::new("documents").filter("nope ="))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Shape(ShapeError::Establish {
            source: TransportError::Rejected { status: 400, .. },
            ..
        })
    ));
}

#[tokio::test]
async fn test_second_subscription_for_active_key_is_refused() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/shape").query_param("offset", "-1");
            then.status(200)
                .header("electric-handle", "h1")
                .header("electric-offset", "0_0")
                .header("electric-up-to-date", "true")
                .json_body(json!([]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/shape").query_param("live", "true");
            then.status(200)
                .header("electric-offset", "0_0")
                .header("electric-up-to-date", "true")
                .delay(Duration::from_millis(500))
                .json_body(json!([]));
        })
        .await;

    let db = ReplicaDb::open_in_memory("direct").unwrap();
    db.with_conn(|conn| Ok(SchemaRegistry::default().register(conn)?))
        .unwrap();
    let config = SubscriptionConfig {
        shape_key: ShapeKey::derive(&IdentityId::new("u1").unwrap(), 1, "notifications", None),
        table: "notifications".to_string(),
        where_clause: None,
        columns: None,
        primary_key: vec!["id".to_string()],
        db,
        callbacks: SubscriptionCallbacks::noop(),
    };

    let subscriber = subscriber(&server);
    let first = subscriber.subscribe(config.clone()).await.unwrap();
    assert!(first.is_up_to_date());

    let second = subscriber.subscribe(config.clone()).await;
    assert!(matches!(second, Err(TransportError::AlreadySubscribing(_))));
    assert_eq!(subscriber.active_shapes().len(), 1);

    first.unsubscribe();
    assert!(subscriber.active_shapes().is_empty());
}
