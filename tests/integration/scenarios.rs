//! Integration test: end-to-end command scenarios.
//!
//! Each test drives a full node through the command socket and the HTTP
//! router and checks the commit log written to disk.

use atlas_tests::{SUPERUSER_KEY, TestNode};
use axum::http::StatusCode;
use serde_json::{Value, json};

fn point(x: i64, y: i64) -> Value {
    json!({"type": "Feature", "geometry": {"type": "Point", "coordinates": [x, y]}, "properties": {}})
}

fn methods(entries: &[atlas_types::JournalEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.method.as_str()).collect()
}

/// Issue a key, create a layer, assign it, insert a feature and read it back.
#[tokio::test]
async fn test_owner_inserts_and_exports() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;

    let key = sock.ok(json!({"method": "create_apikey"})).await["apikey"]
        .as_str()
        .unwrap()
        .to_string();
    let ds = sock.ok(json!({"method": "create_datasource"})).await["datasource"]
        .as_str()
        .unwrap()
        .to_string();
    sock.ok(json!({"method": "assign_datasource", "apikey": key, "datasource": ds}))
        .await;

    let inserted = sock
        .ok(json!({"method": "insert_feature", "apikey": key, "datasource": ds, "feature": point(10, 20)}))
        .await;
    let geo_id = inserted["geo_id"].as_str().unwrap().to_string();

    let layer = sock
        .ok(json!({"method": "export_datasource", "datasource": ds}))
        .await;
    assert_eq!(layer["features"][0]["geometry"]["coordinates"], json!([10, 20]));
    assert_eq!(layer["features"][0]["properties"]["geo_id"], geo_id);

    // The same owner sees it over HTTP.
    let (status, feature) = node
        .http("GET", &format!("/api/v1/layer/{ds}/feature/{geo_id}?apikey={key}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(feature["geometry"]["coordinates"], json!([10, 20]));

    drop(sock);
    let entries = node.shutdown().await;
    assert_eq!(
        methods(&entries),
        ["create_apikey", "create_datasource", "assign_datasource", "insert_feature"]
    );
    assert_eq!(entries[3].data["datasource"], ds.as_str());
    assert_eq!(entries[3].data["feature"]["properties"]["geo_id"], geo_id);
}

/// A key that does not own a layer cannot change it, and nothing is logged.
#[tokio::test]
async fn test_non_owner_rejected_without_side_effects() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;

    let k1 = sock.ok(json!({"method": "create_apikey"})).await["apikey"].clone();
    let k2 = sock.ok(json!({"method": "create_apikey"})).await["apikey"].clone();
    let k1 = k1.as_str().unwrap();
    let k2 = k2.as_str().unwrap();

    let (status, body) = node.http("POST", &format!("/api/v1/layer?apikey={k1}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let ds = body["datasource"].as_str().unwrap().to_string();

    let (status, body) = node
        .http(
            "POST",
            &format!("/api/v1/layer/{ds}/feature?apikey={k2}"),
            Some(point(1, 1)),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let resp = sock
        .call(json!({"method": "insert_feature", "apikey": k2, "datasource": ds, "feature": point(1, 1)}))
        .await;
    assert_eq!(resp["status"], "error");

    let layer = sock
        .ok(json!({"method": "export_datasource", "datasource": ds}))
        .await;
    assert_eq!(layer["features"], json!([]));

    drop(sock);
    let entries = node.shutdown().await;
    assert_eq!(
        methods(&entries),
        ["create_apikey", "create_apikey", "create_datasource"]
    );
}

/// A full commit log queue drops entries but never fails the mutation.
#[tokio::test]
async fn test_full_journal_does_not_block_writes() {
    let node = TestNode::start_with_stalled_journal(2).await;
    let mut sock = node.socket().await;

    sock.ok(json!({"method": "create_datasource", "datasource": "busy"}))
        .await;
    for i in 0..3 {
        sock.ok(json!({"method": "insert_feature", "datasource": "busy", "feature": point(i, i)}))
            .await;
    }
    assert_eq!(node.journal_depth(), 2);

    let layer = sock
        .ok(json!({"method": "export_datasource", "datasource": "busy"}))
        .await;
    assert_eq!(layer["features"].as_array().unwrap().len(), 3);

    drop(sock);
    node.shutdown().await;
}

/// Deleting a layer revokes it from every owner before removing it.
#[tokio::test]
async fn test_delete_revokes_all_owners() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;

    sock.ok(json!({"method": "insert_apikey", "data": {"apikey": "K1", "datasources": []}}))
        .await;
    sock.ok(json!({"method": "insert_apikey", "data": {"apikey": "K2", "datasources": []}}))
        .await;
    sock.ok(json!({"method": "create_datasource", "datasource": "shared"}))
        .await;
    sock.ok(json!({"method": "assign_datasource", "data": {"apikey": "K1"}, "datasource": "shared"}))
        .await;
    sock.ok(json!({"method": "assign_datasource", "data": {"apikey": "K2"}, "datasource": "shared"}))
        .await;

    let (status, _) = node
        .http("DELETE", "/api/v1/layer/shared?apikey=K1", None)
        .await;
    assert_eq!(status, StatusCode::OK);

    for key in ["K1", "K2"] {
        let customer = sock
            .ok(json!({"method": "export_apikey", "apikey": key}))
            .await;
        assert_eq!(customer["datasources"], json!([]), "{key}");
    }
    let resp = sock
        .call(json!({"method": "export_layer", "datasource": "shared"}))
        .await;
    assert_eq!(resp["status"], "error");

    let (_, body) = node
        .http("GET", &format!("/management/datasources?authkey={SUPERUSER_KEY}"), None)
        .await;
    assert_eq!(body["data"], json!([]));

    drop(sock);
    let entries = node.shutdown().await;
    assert_eq!(entries.last().unwrap().method, "delete_datasource");
}

/// Snapshots taken by each write can be listed and read back.
#[tokio::test]
async fn test_snapshot_history() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;

    sock.ok(json!({"method": "create_datasource", "datasource": "hist"}))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    sock.ok(json!({"method": "insert_feature", "datasource": "hist", "feature": point(1, 1)}))
        .await;

    let stamps: Vec<i64> = serde_json::from_value(
        sock.ok(json!({"method": "export_snapshots", "datasource": "hist"}))
            .await,
    )
    .unwrap();
    assert_eq!(stamps.len(), 2);

    let first = sock
        .ok(json!({"method": "export_snapshot", "datasource": "hist", "timestamp": stamps[0]}))
        .await;
    assert_eq!(first["features"], json!([]));

    let latest = sock
        .ok(json!({"method": "export_snapshot", "datasource": "hist", "timestamp": stamps[1] + 1000}))
        .await;
    assert_eq!(latest["features"].as_array().unwrap().len(), 1);

    let resp = sock
        .call(json!({"method": "export_snapshot", "datasource": "hist", "timestamp": stamps[0] - 1}))
        .await;
    assert_eq!(resp["status"], "error");

    drop(sock);
    node.shutdown().await;
}

/// Importing a GeoJSON file creates a layer owned by the importing key.
#[tokio::test]
async fn test_import_geojson_file() {
    let node = TestNode::start().await;
    let mut sock = node.socket().await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("parcels.geojson");
    std::fs::write(
        &file,
        json!({"type": "FeatureCollection", "features": [point(3, 4), point(5, 6)]}).to_string(),
    )
    .unwrap();

    let key = sock.ok(json!({"method": "create_apikey"})).await["apikey"].clone();
    let ds = sock
        .ok(json!({"method": "import_file", "apikey": key, "file": file}))
        .await["datasource"]
        .clone();

    let customer = sock
        .ok(json!({"method": "export_apikey", "apikey": key}))
        .await;
    assert_eq!(customer["datasources"], json!([ds]));

    let layer = sock
        .ok(json!({"method": "export_datasource", "datasource": ds}))
        .await;
    assert_eq!(layer["features"].as_array().unwrap().len(), 2);

    let resp = sock
        .call(json!({"method": "import_file", "file": dir.path().join("notes.txt")}))
        .await;
    assert_eq!(resp["status"], "error");

    drop(sock);
    node.shutdown().await;
}

/// Malformed input ends only the offending connection.
#[tokio::test]
async fn test_malformed_line_closes_one_connection() {
    let node = TestNode::start().await;
    let mut bad = node.socket().await;
    let mut good = node.socket().await;

    bad.send_line("{\"method\": ").await;
    let resp: Value = serde_json::from_str(&bad.read_line().await.unwrap()).unwrap();
    assert_eq!(resp["status"], "error");
    assert!(bad.read_line().await.is_none());

    assert_eq!(good.ok(json!({"method": "ping"})).await["message"], "pong");

    drop(good);
    node.shutdown().await;
}
