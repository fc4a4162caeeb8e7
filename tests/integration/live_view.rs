//! Integration test: live views.
//!
//! A viewer streams `layer_changed` events over HTTP while writes arrive on
//! the command socket.

use std::time::Duration;

use atlas_tests::TestNode;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

async fn next_event(body: &mut Body) -> Option<String> {
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("event within timeout")?
        .unwrap();
    frame
        .into_data()
        .ok()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
}

#[tokio::test]
async fn test_socket_write_reaches_http_viewer() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;
    sock.ok(json!({"method": "insert_apikey", "data": {"apikey": "VIEWER", "datasources": []}}))
        .await;
    sock.ok(json!({"method": "create_datasource", "datasource": "watched"}))
        .await;
    sock.ok(json!({"method": "create_datasource", "datasource": "other"}))
        .await;
    sock.ok(json!({"method": "assign_datasource", "data": {"apikey": "VIEWER"}, "datasource": "watched"}))
        .await;

    let response = node
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/layer/watched/live?apikey=VIEWER")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    // A write to another layer is not delivered; the next one is.
    sock.ok(json!({"method": "insert_feature", "datasource": "other",
        "feature": {"type": "Feature", "geometry": null}}))
        .await;
    sock.ok(json!({"method": "insert_feature", "datasource": "watched",
        "feature": {"type": "Feature", "geometry": null}}))
        .await;

    let event = next_event(&mut body).await.unwrap();
    assert!(event.contains("event: layer_changed"), "{event}");
    assert!(event.contains("\"datasource\":\"watched\""), "{event}");
    assert!(event.contains("insert_feature"), "{event}");

    assert_eq!(node.dispatcher.hub().viewer_count(&"watched".into()), 1);
    drop(body);
    assert_eq!(node.dispatcher.hub().connection_count(), 0);

    drop(sock);
    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_live_streams() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;
    sock.ok(json!({"method": "insert_apikey", "data": {"apikey": "V", "datasources": []}}))
        .await;
    sock.ok(json!({"method": "create_datasource", "datasource": "d"}))
        .await;
    sock.ok(json!({"method": "assign_datasource", "data": {"apikey": "V"}, "datasource": "d"}))
        .await;
    drop(sock);

    let response = node
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/layer/d/live?apikey=V")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let mut body = response.into_body();

    assert_eq!(node.dispatcher.hub().close_all(), 1);
    assert!(next_event(&mut body).await.is_none());

    node.shutdown().await;
}
