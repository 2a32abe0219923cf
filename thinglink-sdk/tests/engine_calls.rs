mod common;

use common::{harness, PK, DEV};
use std::{sync::atomic::Ordering, time::Duration};
use thinglink_sdk::{
    tsl::methods::PROPERTY_GET, ConfigKey, ConnectionState, Envelope, Request, SdkError,
    SubDeviceRecord,
};

#[tokio::test]
async fn test_call_when_not_connected() {
    let h = harness().await;

    let response = h
        .client
        .call_and_wait(
            Envelope::new(),
            Request::new(PROPERTY_GET, "{}"),
            "thing.",
            None,
        )
        .await;

    assert_eq!(response.code, "170008");
    assert_eq!(h.client.pending_calls(), 0);
    assert_eq!(
        h.client.post_property(r#"{"x":1}"#).await,
        Err(SdkError::NotConnected)
    );
}

#[tokio::test]
async fn test_sync_call_completes_with_reply() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move { client.property_get(r#"{"keys":["x"]}"#).await });

    let sent = h.next_publish().await;
    assert!(sent.topic.starts_with(&format!("/sys/{PK}/{DEV}/up/request/")));
    let body = sent.json();
    assert_eq!(body["method"], "thing.property.get");
    assert_eq!(body["traceId"], sent.message_id());
    assert_eq!(body["params"]["keys"][0], "x");
    assert_eq!(h.client.pending_calls(), 1);

    h.reply_to(&sent, "000000", Some(r#"{"x":1}"#)).await;

    let response = call.await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.data.as_deref(), Some(r#"{"x":1}"#));
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_call_times_out() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move { client.property_get("{}").await });

    let _sent = h.next_publish().await;
    let response = call.await.unwrap();

    assert_eq!(response.code, "170004");
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_ignored() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move {
        client
            .service_call("reboot", "{}")
            .await
    });
    let sent = h.next_publish().await;
    let response = call.await.unwrap();
    assert_eq!(response.code, "170004");

    h.reply_to(&sent, "000000", None).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_unknown_trace_id_does_not_complete_other_calls() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move { client.service_call("reboot", r#"{"delay":1}"#).await });
    let sent = h.next_publish().await;
    assert_eq!(sent.json()["method"], "thing.service.reboot");

    h.deliver(
        &format!("/sys/{PK}/{DEV}/up/response/unknown"),
        r#"{"version":"1.0.1","traceId":"unknown","code":"000000","message":"ok"}"#,
    )
    .await;
    h.reply_to(&sent, "000000", Some(r#""done""#)).await;

    let response = call.await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.data.as_deref(), Some("done"));
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_publish_failure_rolls_back_registration() {
    let h = harness().await;
    h.connect().await;
    h.transport.fail_publish.store(true, Ordering::SeqCst);

    let response = h.client.property_get("{}").await;

    assert_eq!(response.code, "170002");
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_bad_qos_rejected_before_publish() {
    let mut h = harness().await;
    h.connect().await;

    let err = h.client.publish("/custom/t", "x", 5, false).await.unwrap_err();

    assert_eq!(err, SdkError::BadQos { qos: 5 });
    assert_eq!(err.code(), "170013");
    assert!(h.published.try_recv().is_err());
}

#[tokio::test]
async fn test_raw_and_custom_publish() {
    let mut h = harness().await;
    h.connect().await;

    h.client.publish("/custom/raw", "x", 0, true).await.unwrap();
    let sent = h.next_publish().await;
    assert_eq!(sent.topic, "/custom/raw");
    assert_eq!(sent.payload, b"x");
    assert_eq!(sent.qos, rumqttc::QoS::AtMostOnce);
    assert!(sent.retain);

    h.client.publish_custom("/custom/app", "y").await.unwrap();
    let sent = h.next_publish().await;
    assert_eq!(sent.qos, rumqttc::QoS::AtLeastOnce);
    assert!(!sent.retain);
}

#[tokio::test]
async fn test_fire_and_forget_posts() {
    let mut h = harness().await;
    h.connect().await;

    h.client.post_device_version("2.3.0").await.unwrap();
    let body = h.next_publish().await.json();
    assert_eq!(body["method"], "thing.event.basic.post");
    assert_eq!(body["params"]["version"], "2.3.0");

    h.client.post_device_name("boiler").await.unwrap();
    let body = h.next_publish().await.json();
    assert_eq!(body["params"]["deviceName"], "boiler");

    h.client
        .post_config_version(&[ConfigKey::new("net", 4)])
        .await
        .unwrap();
    let body = h.next_publish().await.json();
    assert_eq!(body["method"], "thing.event.config.post");
    assert_eq!(body["params"][0]["key"], "net");
    assert_eq!(body["params"][0]["version"], 4);

    h.client.post_event("alarm", r#"{"level":2}"#).await.unwrap();
    let body = h.next_publish().await.json();
    assert_eq!(body["method"], "thing.event.alarm");

    h.client.post_property("").await.unwrap();
    let body = h.next_publish().await.json();
    assert_eq!(body["method"], "thing.property.post");
    assert_eq!(body["params"], serde_json::json!({}));
}

#[tokio::test]
async fn test_scalar_params_rejected() {
    let h = harness().await;
    h.connect().await;

    let err = h.client.post_property("42").await.unwrap_err();
    assert_eq!(err.code(), "170001");
}

#[tokio::test]
async fn test_sub_device_lifecycle_and_listing() {
    let mut h = harness().await;
    h.connect().await;
    let subs = h.client.sub_devices();
    let record = SubDeviceRecord::new("SPK", "S1");

    subs.add_sub_device(&record).await.unwrap();
    let sent = h.next_publish().await;
    assert!(sent.topic.starts_with(&format!("/sys/{PK}/{DEV}/up/request/")));
    let body = sent.json();
    assert_eq!(body["method"], "thing.sub.add");
    assert_eq!(body["params"]["productKey"], "SPK");
    assert_eq!(body["params"]["deviceId"], "S1");

    subs.online_sub_device(&record).await.unwrap();
    assert_eq!(h.next_publish().await.json()["method"], "thing.sub.connect");

    let lister = subs.clone();
    let call = tokio::spawn(async move { lister.list_sub_devices().await });
    let sent = h.next_publish().await;
    assert_eq!(sent.json()["method"], "thing.sub.get");
    h.reply_to(&sent, "000000", Some(r#"[{"productKey":"SPK","deviceId":"S1"}]"#))
        .await;

    assert_eq!(call.await.unwrap().unwrap(), vec![record]);
}

#[tokio::test]
async fn test_sub_device_listing_failure_is_remote_error() {
    let mut h = harness().await;
    h.connect().await;

    let subs = h.client.sub_devices();
    let call = tokio::spawn(async move { subs.list_sub_devices().await });
    let sent = h.next_publish().await;
    h.reply_to(&sent, "300001", None).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, SdkError::Remote { ref code, .. } if code == "300001"));
}

#[tokio::test]
async fn test_shutdown_fails_pending_calls() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move { client.property_get("{}").await });
    let _sent = h.next_publish().await;

    h.client.shutdown().await;

    assert_eq!(call.await.unwrap().code, "170012");
    assert_eq!(h.client.pending_calls(), 0);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(h.transport.disconnected.load(Ordering::SeqCst));
    assert_eq!(h.client.connect().await, Err(SdkError::Shutdown));
    assert_eq!(h.client.property_get("{}").await.code, "170012");
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls_and_allows_reattach() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let call = tokio::spawn(async move { client.property_get("{}").await });
    let _sent = h.next_publish().await;

    h.client.disconnect().await;
    assert_eq!(call.await.unwrap().code, "170008");
    assert!(!h.client.is_connected());

    let (transport, _published) = common::MockTransport::new();
    let events = h.client.attach(transport).await.unwrap();
    events
        .send(thinglink_sdk::TransportEvent::Connected)
        .await
        .unwrap();
    h.wait_state(ConnectionState::is_connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_overdue_call_expired_while_waiter_is_not_polled() {
    let mut h = harness().await;
    h.connect().await;

    let client = h.client.clone();
    let mut call = Box::pin(client.service_call("reboot", "{}"));
    tokio::select! {
        _ = &mut call => panic!("call resolved before the request was sent"),
        _ = h.next_publish() => {}
    }
    assert_eq!(h.client.pending_calls(), 1);

    // The waiter is parked; the dispatcher sweep has to reap the entry.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(h.client.pending_calls(), 0);

    let response = call.await;
    assert_eq!(response.code, "170004");
}
