//! Identity resolution end-to-end: creation, in-place update, the
//! fact/firmware merge, and duplicate rejection.

mod common;

use common::TestHarness;
use regex::Regex;
use serde_json::json;

#[tokio::test]
async fn boot_creates_node_with_canonical_fingerprint() {
    let h = TestHarness::new().await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "AA:BB:CC:DD:EE:01", "uuid": "u-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["created"], true);
    assert_eq!(
        body["node"]["hw_info"],
        json!(["mac=aa-bb-cc-dd-ee-01", "uuid=u-1"])
    );
    // Server-assigned monotonic name.
    assert_eq!(body["node"]["name"], "node1");

    // Same firmware report again: update path, same identity.
    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"net0": "aa-bb-cc-dd-ee-01", "uuid": "U-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let again: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(again["created"], false);
    assert_eq!(again["node"]["id"], body["node"]["id"]);
}

#[tokio::test]
async fn boot_without_match_eligible_keys_is_rejected() {
    let h = TestHarness::new().await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"vendor": "acme"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn checkin_requires_facts() {
    let h = TestHarness::new().await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn firmware_only_registration_merges_into_fact_bearing_node() {
    let h = TestHarness::with_config(|c| {
        c.matching.match_nodes_on_facts = vec![Regex::new("^serial_number$").unwrap()];
    })
    .await;

    // The agent registers first, identified by facts alone.
    let resp = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({"facts": {"uuid": "u-1", "serial_number": "S9"}}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let nodes: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodes["total"], 1);
    let real_id = nodes["items"][0]["id"].as_str().unwrap().to_string();

    // The same machine boots later and fails to identify: a second,
    // firmware-only node appears.
    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "AA:BB:CC:DD:EE:02"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    let fake_id = body["node"]["id"].as_str().unwrap().to_string();
    assert_ne!(real_id, fake_id);

    // Leave a trace in the fake node's log so the move is observable.
    let resp = h
        .client
        .post(h.url(&format!("/v1/nodes/{fake_id}/stage-done")))
        .json(&json!({"name": "boot"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // The next fact report carries the MAC too, overlapping both nodes:
    // the fact-bearing node absorbs the firmware-only one.
    let resp = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({"facts": {
            "uuid": "u-1",
            "serial_number": "S9",
            "macaddress": "AA:BB:CC:DD:EE:02",
        }}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let survivor = h.get_node(&real_id).await;
    let hw_info: Vec<String> = serde_json::from_value(survivor["hw_info"].clone()).unwrap();
    assert!(hw_info.contains(&"fact_serial_number=s9".to_string()));
    assert!(hw_info.contains(&"mac=aa-bb-cc-dd-ee-02".to_string()));
    assert!(hw_info.contains(&"uuid=u-1".to_string()));

    // The firmware-only node is gone, its log lives on the survivor.
    let resp = h
        .client
        .get(h.url(&format!("/v1/nodes/{fake_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let log = h.node_log(&real_id).await;
    assert!(
        log.iter()
            .any(|e| e["event"] == "stage_done" && e["stage"] == "boot"),
        "expected the absorbed node's log entry on the survivor: {log:?}"
    );
    assert!(log.iter().all(|e| e["timestamp"].is_string()));
}

#[tokio::test]
async fn ambiguous_identity_is_rejected_and_logged() {
    let h = TestHarness::new().await;

    // Legacy data: two nodes already share a MAC entry. The store's
    // unique side table would prevent this via the API, so seed directly.
    let mut ids = Vec::new();
    for _ in 0..2 {
        let id = mandrel_id::NodeId::new().to_string();
        sqlx::query("INSERT INTO nodes (id, hw_info) VALUES ($1, ARRAY['mac=aa-bb-cc-dd-ee-03'])")
            .bind(&id)
            .execute(h.db.pool())
            .await
            .unwrap();
        ids.push(id);
    }

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:03"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "duplicate_node");

    for id in &ids {
        let log = h.node_log(id).await;
        assert!(
            log.iter()
                .any(|e| e["event"] == "boot" && e["error"] == "duplicate_node"),
            "expected duplicate_node log entry on {id}: {log:?}"
        );
    }
}

#[tokio::test]
async fn protected_new_nodes_are_born_installed() {
    let h = TestHarness::with_config(|c| c.protect_new_nodes = true).await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "AA:BB:CC:DD:EE:04"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["node"]["installed"], "true");
    assert!(body["node"]["installed_at"].is_string());
}

#[tokio::test]
async fn search_by_hostname_and_fingerprint() {
    let h = TestHarness::new().await;

    for (mac, hostname) in [
        ("aa:bb:cc:dd:ee:10", "web-1.lab"),
        ("aa:bb:cc:dd:ee:11", "db-1.lab"),
        ("aa:bb:cc:dd:ee:12", "odd[1].lab"),
    ] {
        let resp = h
            .client
            .post(h.url("/v1/nodes/boot"))
            .json(&json!({"mac": mac}))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        let id = body["node"]["id"].as_str().unwrap();
        sqlx::query("UPDATE nodes SET hostname = $2 WHERE id = $1")
            .bind(id)
            .bind(hostname)
            .execute(h.db.pool())
            .await
            .unwrap();
    }

    // Regex hostname search.
    let body: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .query(&[("hostname", "^web-")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["hostname"], "web-1.lab");

    // An unparseable pattern downgrades to a literal substring match.
    let body: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .query(&[("hostname", "odd[1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["hostname"], "odd[1].lab");

    // Fingerprint key filter, normalized like the canonicalizer.
    let body: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .query(&[("mac", "AA:BB:CC:DD:EE:12"), ("hostname", "odd")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
}
