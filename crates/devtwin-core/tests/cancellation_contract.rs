//! Contract Test: Cancellation and Link Loss
//!
//! Constraints verified:
//! - Removing a device stops its tasks; no further transport calls happen
//! - Removal does not wait out retry backoffs or link outages
//! - Transport failures pause a property until the link is back
//! - A bounded reconnect wait degrades the property but keeps it alive
//! - Shutdown stops every device and releases model references

mod common;

use common::*;
use devtwin_core::config::ReconcilerConfig;
use devtwin_core::twin::{TwinEvent, TwinState};
use std::time::Duration;
use tokio::sync::oneshot;

#[tokio::test]
async fn remove_device_stops_collection() {
    let mut h = harness(fast_config());
    h.transport.set_value("plc-1", "setpoint", b"10");
    h.transport.set_value("plc-1", "temperature", b"20.5");

    h.reconciler
        .admit(plc_device("plc-1", Duration::from_millis(20)))
        .await
        .unwrap();
    events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Reported { .. })
    })
    .await
    .expect("device never collected");

    h.reconciler.remove_device("plc-1").await.unwrap();
    let reads = h.transport.read_count();
    assert!(reads >= 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.read_count(), reads);
    assert!(h.reconciler.devices().await.is_empty());
    assert!(h.reconciler.twin("plc-1", "setpoint").await.is_none());
}

#[tokio::test]
async fn remove_during_backoff_is_prompt() {
    let config = ReconcilerConfig {
        retry_backoff_ms: 5_000,
        max_backoff_ms: 5_000,
        ..fast_config()
    };
    let h = harness(config);
    h.transport.set_value("plc-1", "setpoint", b"garbage");
    h.transport.set_value("plc-1", "temperature", b"garbage");

    h.reconciler
        .admit(plc_device("plc-1", Duration::from_millis(20)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Both properties are sleeping in their first backoff
    assert_eq!(h.transport.read_count(), 2);

    let removal = tokio::time::timeout(
        Duration::from_millis(500),
        h.reconciler.remove_device("plc-1"),
    )
    .await;
    assert!(removal.is_ok(), "removal waited for the backoff");
    assert_eq!(h.transport.read_count(), 2);
}

#[tokio::test]
async fn remove_while_paused_is_prompt() {
    let mut h = harness(fast_config());
    h.transport.set_value("plc-1", "setpoint", b"10");
    h.transport.set_value("plc-1", "temperature", b"20.5");
    h.transport.set_link(false);

    h.reconciler
        .admit(plc_device("plc-1", Duration::from_millis(20)))
        .await
        .unwrap();
    events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Paused { .. })
    })
    .await
    .expect("property did not pause");

    let removal = tokio::time::timeout(
        Duration::from_millis(500),
        h.reconciler.remove_device("plc-1"),
    )
    .await;
    assert!(removal.is_ok(), "removal waited for the link");
    assert!(h.models.references("plc").is_empty());
}

#[tokio::test]
async fn link_loss_pauses_and_resumes() {
    let mut h = harness(fast_config());
    h.transport.set_value("plc-1", "setpoint", b"10");
    h.transport.set_value("plc-1", "temperature", b"20.5");

    h.reconciler
        .admit(plc_device("plc-1", Duration::from_millis(20)))
        .await
        .unwrap();
    events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Reported { property_name, .. } if property_name == "setpoint")
    })
    .await
    .expect("device never collected");

    h.transport.set_link(false);
    let seen = events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Paused { property_name, .. } if property_name == "setpoint")
    })
    .await
    .expect("setpoint did not pause");
    // Transport errors are not retried against the budget
    assert!(!seen.iter().any(|e| matches!(e, TwinEvent::Degraded { .. })));

    // While paused nothing polls the device
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reads = h.transport.read_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.read_count(), reads);

    h.transport.set_value("plc-1", "setpoint", b"11");
    h.transport.set_link(true);
    let seen = events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Reported { property_name, value, .. }
            if property_name == "setpoint" && value == "11")
    })
    .await
    .expect("setpoint did not resume");
    assert!(seen.iter().any(|e| matches!(e,
        TwinEvent::Resumed { property_name, .. } if property_name == "setpoint")));
}

#[tokio::test]
async fn reconnect_timeout_degrades_but_keeps_waiting() {
    let config = ReconcilerConfig {
        reconnect_timeout_secs: 1,
        ..fast_config()
    };
    let mut h = harness(config);
    h.transport.set_value("plc-1", "setpoint", b"10");
    h.transport.set_value("plc-1", "temperature", b"20.5");
    h.transport.set_link(false);

    h.reconciler
        .admit(plc_device("plc-1", Duration::from_millis(20)))
        .await
        .unwrap();

    let seen = events_until(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, TwinEvent::Degraded { property_name, .. } if property_name == "setpoint")
    })
    .await
    .expect("setpoint never degraded");
    match seen.last() {
        Some(TwinEvent::Degraded { cause, .. }) => {
            assert!(cause.contains("transport unavailable"), "cause: {}", cause)
        }
        other => panic!("unexpected {:?}", other),
    }
    let status = h.reconciler.health("plc-1", "setpoint").await.unwrap();
    assert_eq!(status.state, TwinState::Degraded);

    h.transport.set_link(true);
    events_until(&mut h.events, Duration::from_secs(2), |e| {
        matches!(e, TwinEvent::Reported { property_name, .. } if property_name == "setpoint")
    })
    .await
    .expect("setpoint did not recover after the link came back");

    let status = h.reconciler.health("plc-1", "setpoint").await.unwrap();
    assert_eq!(status.state, TwinState::Reported);
    assert!(status.cause.is_none());
}

#[tokio::test]
async fn shutdown_stops_every_device() {
    let h = harness(fast_config());
    for id in ["plc-1", "plc-2"] {
        h.transport.set_value(id, "setpoint", b"10");
        h.transport.set_value(id, "temperature", b"20.5");
        h.reconciler
            .admit(plc_device(id, Duration::from_millis(20)))
            .await
            .unwrap();
    }
    assert_eq!(h.models.references("plc").len(), 2);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let reconciler = h.reconciler.clone();
    let runner = tokio::spawn(async move { reconciler.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("shutdown timed out")
        .unwrap();
    assert!(result.is_ok());

    assert!(h.reconciler.devices().await.is_empty());
    assert!(h.models.references("plc").is_empty());

    let reads = h.transport.read_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.read_count(), reads);
}
