//! Checkin, policy binding, metadata, stage completion, and power
//! reconciliation end-to-end.

mod common;

use common::TestHarness;
use mandrel_control_plane::config::FactPattern;
use mandrel_control_plane::policy::{NewPolicy, PgPolicyCatalogue};
use mandrel_control_plane::tags::FactTagMatcher;
use mandrel_control_plane::workers::{SignalWorker, SignalWorkerConfig};
use mandrel_events::{PowerState, SignalKind};
use mandrel_id::NodeId;
use serde_json::json;

fn map(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    v.as_object().cloned().unwrap_or_default()
}

async fn seed_compute_policy(h: &TestHarness) {
    FactTagMatcher::new(h.db.pool().clone())
        .create("compute", map(json!({"role": "compute"})))
        .await
        .unwrap();
    PgPolicyCatalogue::new(h.db.pool().clone())
        .create(NewPolicy {
            name: "fedora-41".into(),
            rank: 0,
            hostname_pattern: "host-${id}.lab".into(),
            root_password: Some("hunter2".into()),
            tags: vec!["compute".into()],
            node_metadata: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn checkin_without_policy_becomes_bound() {
    let h = TestHarness::new().await;
    seed_compute_policy(&h).await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({"facts": {"uuid": "u-3", "role": "compute"}}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["action"], "reboot");

    let nodes: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let node = &nodes["items"][0];
    let id = node["id"].as_str().unwrap();
    assert_eq!(node["tags"], json!(["compute"]));
    assert_eq!(node["boot_count"], 1);
    assert_eq!(node["hostname"], format!("host-{id}.lab"));
    assert!(node["policy_id"].is_string());
    assert!(node["installed"].is_null());
    // Credentials never appear in responses.
    assert!(node.get("root_password").is_none());

    let log = h.node_log(id).await;
    assert!(log
        .iter()
        .any(|e| e["action"] == "reboot" && e["policy"] == "fedora-41"));
}

#[tokio::test]
async fn checkin_is_idempotent() {
    let h = TestHarness::new().await;
    seed_compute_policy(&h).await;

    let facts = json!({"facts": {"uuid": "u-5", "role": "compute", "kernel": "6.1"}});

    let first: serde_json::Value = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&facts)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let nodes: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = nodes["items"][0]["id"].as_str().unwrap().to_string();
    let mut before = h.get_node(&id).await;

    let second: serde_json::Value = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&facts)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first, second);

    let mut after = h.get_node(&id).await;
    for transient in ["last_checkin", "updated_at"] {
        before.as_object_mut().unwrap().remove(transient);
        after.as_object_mut().unwrap().remove(transient);
    }
    assert_eq!(before, after);
}

#[tokio::test]
async fn blacklisted_facts_are_dropped() {
    let h = TestHarness::with_config(|c| {
        c.facts_blacklist = vec![FactPattern::parse("/^uptime/")];
    })
    .await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({"facts": {
            "uuid": "u-4",
            "uptime_seconds": 99,
            "kernel": "6.1",
        }}))
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
    let facts = &nodes["items"][0]["facts"];
    assert_eq!(facts["kernel"], "6.1");
    assert_eq!(facts["uuid"], "u-4");
    assert!(facts.get("uptime_seconds").is_none());
}

#[tokio::test]
async fn metadata_modify_and_background_tag_evaluation() {
    let h = TestHarness::new().await;

    // A tag over metadata, so the queued eval_tags signal has a visible
    // effect.
    FactTagMatcher::new(h.db.pool().clone())
        .create("prod", map(json!({"env": "prod"})))
        .await
        .unwrap();

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:20"}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let id = body["node"]["id"].as_str().unwrap().to_string();

    // update
    let node: serde_json::Value = h
        .client
        .patch(h.url(&format!("/v1/nodes/{id}/metadata")))
        .json(&json!({"update": {"k": "v0", "env": "prod"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["metadata"]["k"], "v0");

    // no_replace preserves the stored value
    let node: serde_json::Value = h
        .client
        .patch(h.url(&format!("/v1/nodes/{id}/metadata")))
        .json(&json!({"update": {"k": "v1"}, "no_replace": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["metadata"]["k"], "v0");

    // plain update overwrites
    let node: serde_json::Value = h
        .client
        .patch(h.url(&format!("/v1/nodes/{id}/metadata")))
        .json(&json!({"update": {"k": "v1"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["metadata"]["k"], "v1");

    // Metadata edits queue tag re-evaluation; drain and observe the tag.
    let worker = SignalWorker::new(
        h.db.clone(),
        h.state.outbox().clone(),
        h.state.store().clone(),
        h.state.log().clone(),
        h.state.checkin().clone(),
        h.state.power().clone(),
        SignalWorkerConfig::default(),
    );
    let stats = worker.drain_once().await.unwrap();
    assert!(stats.delivered > 0);

    let node = h.get_node(&id).await;
    assert_eq!(node["tags"], json!(["prod"]));

    // clear
    let node: serde_json::Value = h
        .client
        .patch(h.url(&format!("/v1/nodes/{id}/metadata")))
        .json(&json!({"clear": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["metadata"], json!({}));
}

#[tokio::test]
async fn stage_finished_seals_the_install() {
    let h = TestHarness::new().await;
    seed_compute_policy(&h).await;

    h.client
        .post(h.url("/v1/nodes/checkin"))
        .json(&json!({"facts": {"uuid": "u-6", "role": "compute"}}))
        .send()
        .await
        .unwrap();

    let nodes: serde_json::Value = h
        .client
        .get(h.url("/v1/nodes/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = nodes["items"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(nodes["items"][0]["boot_count"], 1);

    let node: serde_json::Value = h
        .client
        .post(h.url(&format!("/v1/nodes/{id}/stage-done")))
        .json(&json!({"name": "finished"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["boot_count"], 2);
    assert_eq!(node["installed"], "fedora-41");
    assert!(node["installed_at"].is_string());
}

#[tokio::test]
async fn power_reconciliation_records_state_and_queues_toggle() {
    let h = TestHarness::new().await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:30"}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let id = body["node"]["id"].as_str().unwrap().to_string();
    let node_id = NodeId::parse(&id).unwrap();

    sqlx::query("UPDATE nodes SET ipmi_hostname = 'bmc-30.mgmt' WHERE id = $1")
        .bind(&id)
        .execute(h.db.pool())
        .await
        .unwrap();

    // Operator wants it on; the chassis reports off.
    h.client
        .post(h.url(&format!("/v1/nodes/{id}/desired-power")))
        .json(&json!({"desired": "on"}))
        .send()
        .await
        .unwrap();
    h.channel.set_on(Some(false));

    let observed = h.state.power().update_power_state(node_id).await.unwrap();
    assert_eq!(observed, PowerState::Off);

    let node = h.get_node(&id).await;
    assert_eq!(node["last_known_power_state"], "off");
    assert!(node["last_power_state_update_at"].is_string());

    // Exactly one queued signal naming the desired state.
    let claimed = h.state.outbox().claim(10, 30.0).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(matches!(
        claimed[0].kind,
        SignalKind::Power {
            desired: PowerState::On
        }
    ));

    // A channel failure records unknown and surfaces the error.
    h.channel.set_on(None);
    let err = h.state.power().update_power_state(node_id).await.unwrap_err();
    assert!(matches!(
        err,
        mandrel_control_plane::error::CoreError::Management(_)
    ));
    let node = h.get_node(&id).await;
    assert_eq!(node["last_known_power_state"], "unknown");
}

#[tokio::test]
async fn reboot_drives_the_channel_and_logs() {
    let h = TestHarness::new().await;

    let resp = h
        .client
        .post(h.url("/v1/nodes/boot"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:31"}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let id = body["node"]["id"].as_str().unwrap().to_string();

    sqlx::query("UPDATE nodes SET ipmi_hostname = 'bmc-31.mgmt' WHERE id = $1")
        .bind(&id)
        .execute(h.db.pool())
        .await
        .unwrap();

    let resp = h
        .client
        .post(h.url(&format!("/v1/nodes/{id}/reboot")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let log = h.node_log(&id).await;
    assert!(log.iter().any(|e| e["event"] == "reboot"));
}
