//! Live propagation of model changes to evaluators and subscribers.

mod common;

use std::time::Duration;

use common::harness;
use risk_engine::model::{ModelStatus, RiskModelPatch};
use risk_engine::store::ChangeOperation;
use risk_engine::{BroadcasterHealth, ModelEvent};

/// Poll until the cached active model reaches the expected version
async fn wait_for_cached_version(h: &common::Harness, version: u32) {
    for _ in 0..100 {
        if h.broadcaster
            .active_model()
            .map(|m| m.version == version)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cached model never reached version {}", version);
}

#[test_log::test(tokio::test)]
async fn initial_load_resolves_the_active_model() {
    let h = harness().await;

    let cached = h.broadcaster.active_model().expect("model cached at start");
    assert_eq!(cached.model_id, "default-risk-model");
    assert_eq!(cached.version, 1);
    assert_eq!(cached.status, ModelStatus::Active);
}

#[test_log::test(tokio::test)]
async fn activation_propagates_to_the_cache_without_polling() {
    let h = harness().await;
    let model_id = "default-risk-model";

    h.model_store
        .update(model_id, RiskModelPatch::default())
        .await
        .unwrap();
    h.model_store.activate(model_id, Some(2)).await.unwrap();

    wait_for_cached_version(&h, 2).await;

    let cached = h.broadcaster.active_model().unwrap();
    assert_eq!(cached.version, 2);
    assert_eq!(cached.status, ModelStatus::Active);
}

#[test_log::test(tokio::test)]
async fn archiving_the_active_model_clears_the_cache() {
    let h = harness().await;

    h.model_store
        .archive("default-risk-model", Some(1))
        .await
        .unwrap();

    for _ in 0..100 {
        if h.broadcaster.active_model().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cache still holds a model after the active version was archived");
}

#[test_log::test(tokio::test)]
async fn subscribers_receive_operation_tagged_events() {
    let h = harness().await;
    let mut rx = h.broadcaster.subscribe();

    h.model_store
        .update("default-risk-model", RiskModelPatch::default())
        .await
        .unwrap();

    // The new draft version arrives as an insert carrying the full document
    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await.unwrap() {
                ModelEvent::Change {
                    operation: ChangeOperation::Insert,
                    document,
                    ..
                } => break document,
                _ => continue,
            }
        }
    })
    .await
    .expect("no insert event within 2s");

    let document = event.expect("insert events carry the document");
    assert_eq!(document.version, 2);
    assert_eq!(document.status, ModelStatus::Draft);
}

#[test_log::test(tokio::test)]
async fn heartbeats_arrive_while_idle() {
    // Harness config beats once per second
    let h = harness().await;
    let mut rx = h.broadcaster.subscribe();

    let heartbeat = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let ModelEvent::Heartbeat { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
    })
    .await;
    assert!(heartbeat.is_ok(), "no heartbeat within 3s of idle time");
}

#[test_log::test(tokio::test)]
async fn feed_is_reported_healthy_once_connected() {
    let h = harness().await;

    for _ in 0..100 {
        if h.broadcaster.health() == BroadcasterHealth::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broadcaster never reported a connected feed");
}

#[test_log::test(tokio::test)]
async fn stop_tears_down_background_tasks() {
    let h = harness().await;
    h.broadcaster.stop();

    // After stop the feed no longer refreshes the cache
    h.model_store
        .update("default-risk-model", RiskModelPatch::default())
        .await
        .unwrap();
    h.model_store
        .activate("default-risk-model", Some(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cached = h.broadcaster.active_model().unwrap();
    assert_eq!(cached.version, 1);
}
