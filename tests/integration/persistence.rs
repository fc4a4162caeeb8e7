//! Integration test: state survives a restart.

use atlas_tests::{SUPERUSER_KEY, TestNode};
use serde_json::json;

#[tokio::test]
async fn test_registry_layers_and_journal_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let node = TestNode::start_in(dir.path()).await;
    let mut sock = node.socket().await;
    sock.ok(json!({"method": "insert_apikey", "data": {"apikey": "KEEP", "datasources": []}}))
        .await;
    let ds = sock
        .ok(json!({"method": "create_datasource", "apikey": "KEEP",
            "layer": {"type": "FeatureCollection", "features": []}}))
        .await["datasource"]
        .as_str()
        .unwrap()
        .to_string();
    sock.ok(json!({"method": "insert_feature", "apikey": "KEEP", "datasource": ds,
        "feature": {"type": "Feature", "geometry": null, "properties": {"geo_id": "kept"}}}))
        .await;
    drop(sock);
    let first_run = node.shutdown().await;
    assert_eq!(first_run.len(), 3);

    let node = TestNode::start_in(dir.path()).await;
    let (status, customer) = node.http("GET", "/api/v1/layers?apikey=KEEP", None).await;
    assert!(status.is_success());
    assert_eq!(customer["data"]["datasources"], json!([ds]));

    let (_, feature) = node
        .http("GET", &format!("/api/v1/layer/{ds}/feature/kept?apikey=KEEP"), None)
        .await;
    assert_eq!(feature["properties"]["geo_id"], "kept");

    let (_, stamps) = node
        .http("GET", &format!("/api/v1/layer/{ds}/timestamps?apikey=KEEP"), None)
        .await;
    assert_eq!(stamps["data"].as_array().unwrap().len(), 2);

    let (_, keys) = node
        .http("GET", &format!("/management/customers?authkey={SUPERUSER_KEY}"), None)
        .await;
    assert_eq!(keys["data"], json!(["KEEP"]));

    // The commit log is appended to, not replaced.
    let mut sock = node.socket().await;
    sock.ok(json!({"method": "ping"})).await;
    sock.ok(json!({"method": "create_apikey"})).await;
    drop(sock);
    let entries = node.shutdown().await;
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[..3], first_run[..]);
}
