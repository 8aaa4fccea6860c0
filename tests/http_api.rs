//! Façade scenarios that cross component boundaries, driven through
//! the router with `tower::ServiceExt`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::Router;
use http::{header, Request, StatusCode};
use serde_json::{json, Map, Value};
use tower::ServiceExt;

use cookie_monster::http::{router, AppState};
use cookie_monster::notifier::Notifier;
use cookie_monster::prelude::*;
use cookie_monster::registry::{LoaderRegistry, ReceiverRegistry, RuleRegistry};

fn app() -> (Router, CookieJarHandle) {
    let jar = CookieJar::open(
        Arc::new(InMemoryDocumentStore::new()),
        RetryPolicy::disabled(),
    )
    .unwrap();
    let manager = ProcessorManager::new(
        jar.clone(),
        RuleRegistry::new("rules"),
        LoaderRegistry::new("loaders"),
        Arc::new(Notifier::new(ReceiverRegistry::new("receivers"))),
        Duration::from_millis(50),
    );
    let router = router(AppState {
        jar: jar.clone(),
        manager,
    });
    (router, jar)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn queue_length(app: &Router) -> u64 {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/queue")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["queue_length"].as_u64().unwrap()
}

#[tokio::test]
async fn reprocessing_an_in_flight_cookie_requeues_it_after_release() {
    let (app, jar) = app();

    jar.enrich("id_b", Enrichment::now("seed", Map::new())).unwrap();
    let reserved = jar.next_for_processing(None).unwrap();
    assert_eq!(reserved, "id_b");
    assert_eq!(queue_length(&app).await, 1); // in flight only

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/queue/reprocess")
                .header(header::ACCEPT, "application/json")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"path":"id_b"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "path": "id_b" }));

    // Still reserved: the re-mark is parked until the worker finishes.
    assert_eq!(jar.length().dirty, 0);

    jar.mark_complete("id_b").unwrap();
    assert_eq!(jar.length().dirty, 1);
    assert_eq!(queue_length(&app).await, 1);
    assert_eq!(jar.next_for_processing(None).unwrap(), "id_b");
}

#[tokio::test]
async fn fetch_and_delete_round_trip_through_the_facade() {
    let (app, jar) = app();
    jar.enrich("/seq/run1", Enrichment::now("irods", Map::new()))
        .unwrap();

    // Leading-slash ids travel in the query string.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cookiejar?identifier=/seq/run1")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let log = body_json(response).await;
    assert_eq!(log.as_array().unwrap().len(), 1);
    assert_eq!(log[0]["source"], json!("irods"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/cookiejar?identifier=/seq/run1")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(jar.fetch("/seq/run1").unwrap().is_none());
}
