mod common;

use common::{harness, MockTransport, DEV, PK};
use rumqttc::QoS;
use std::time::Duration;
use thinglink_sdk::{
    ConfigItem, ConnectionState, Response, SdkError, TransportEvent, UpgradeDescriptor,
};
use tokio::sync::mpsc;

fn request_topic(msg: &str) -> String {
    format!("/sys/{PK}/{DEV}/rpc/request/{msg}")
}

fn response_topic(msg: &str) -> String {
    format!("/sys/{PK}/{DEV}/rpc/response/{msg}")
}

#[tokio::test]
async fn test_property_set_routed_and_answered() {
    let mut h = harness().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    h.client.set_property_set_handler(move |envelope, request| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send((envelope, request));
            Response::success()
        }
    });
    h.connect().await;

    h.deliver(
        &request_topic("7"),
        r#"{"version":"1.0.1","traceId":"t-7","method":"property.set","params":{"x":1}}"#,
    )
    .await;

    let reply = h.next_publish().await;
    assert_eq!(reply.topic, response_topic("7"));
    assert_eq!(reply.qos, QoS::AtLeastOnce);
    assert!(!reply.retain);
    let body = reply.json();
    assert_eq!(body["code"], "000000");
    assert_eq!(body["traceId"], "t-7");

    let (envelope, request) = seen_rx.recv().await.unwrap();
    assert_eq!(request.method, "property.set");
    assert_eq!(request.params, r#"{"x":1}"#);
    assert_eq!(envelope.device_id, DEV);
}

#[tokio::test]
async fn test_qualified_property_get_returns_handler_data() {
    let mut h = harness().await;
    h.client.set_property_get_handler(|_envelope, _request| async {
        Response::success_with(r#"{"temp":21.5}"#)
    });
    h.connect().await;

    h.deliver(
        &request_topic("8"),
        r#"{"version":"1.0.1","traceId":"t-8","method":"thing.property.get","params":["temp"]}"#,
    )
    .await;

    let body = h.next_publish().await.json();
    assert_eq!(body["code"], "000000");
    assert_eq!(body["data"]["temp"], 21.5);
}

#[tokio::test]
async fn test_service_request_for_sub_device_replies_on_its_topic() {
    let mut h = harness().await;
    h.client.set_service_handler(|envelope, request| async move {
        Response::success_with(format!(r#"{{"{}":"{}"}}"#, envelope.device_id, request.method))
    });
    h.connect().await;

    h.deliver(
        &format!("/sys/{PK}/SUB1/rpc/request/9"),
        r#"{"version":"1.0.1","traceId":"t-9","method":"service.reboot","params":{}}"#,
    )
    .await;

    let reply = h.next_publish().await;
    assert_eq!(reply.topic, format!("/sys/{PK}/SUB1/rpc/response/9"));
    assert_eq!(reply.json()["data"]["SUB1"], "service.reboot");
}

#[tokio::test]
async fn test_unsupported_method_answered_with_error() {
    let mut h = harness().await;
    h.connect().await;

    h.deliver(
        &request_topic("10"),
        r#"{"version":"1.0.1","traceId":"t-10","method":"property.set","params":{}}"#,
    )
    .await;
    let body = h.next_publish().await.json();
    assert_eq!(body["code"], "170006");

    h.deliver(
        &request_topic("11"),
        r#"{"version":"1.0.1","traceId":"t-11","method":"firmware.flash","params":{}}"#,
    )
    .await;
    let body = h.next_publish().await.json();
    assert_eq!(body["code"], "170006");
    assert_eq!(body["traceId"], "t-11");
}

#[tokio::test]
async fn test_malformed_request_still_answered() {
    let mut h = harness().await;
    h.connect().await;

    h.deliver(&request_topic("12"), "not json").await;

    let reply = h.next_publish().await;
    assert_eq!(reply.topic, response_topic("12"));
    let body = reply.json();
    assert_eq!(body["code"], "170005");
    assert_eq!(body["traceId"], "");
}

#[tokio::test]
async fn test_malformed_topic_dropped() {
    let mut h = harness().await;
    h.connect().await;

    h.deliver(
        &format!("/sys/{PK}/{DEV}/rpc/request/"),
        r#"{"traceId":"x","method":"property.get","params":{}}"#,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.published.try_recv().is_err());
}

#[tokio::test]
async fn test_config_push_decoded_for_handler() {
    let mut h = harness().await;
    let (items_tx, mut items_rx) = mpsc::unbounded_channel::<Vec<ConfigItem>>();
    h.client.set_config_handler(move |items| {
        let items_tx = items_tx.clone();
        async move {
            let _ = items_tx.send(items);
            Ok(())
        }
    });
    h.connect().await;

    h.deliver(
        &request_topic("13"),
        r#"{"traceId":"t-13","method":"thing.config.push","params":[{"key":"net","version":3,"values":{"dhcp":true}},7]}"#,
    )
    .await;

    assert_eq!(h.next_publish().await.json()["code"], "000000");
    let items = items_rx.recv().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key.key, "net");
    assert_eq!(items[0].key.version, 3);
    assert_eq!(items[0].values["dhcp"], true);
}

#[tokio::test]
async fn test_upgrade_handler_failure_reported() {
    let mut h = harness().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<UpgradeDescriptor>();
    h.client.set_upgrade_handler(move |descriptor| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(descriptor);
            Err(SdkError::HandlerFailed {
                reason: "battery low".to_string(),
            })
        }
    });
    h.connect().await;

    h.deliver(
        &request_topic("14"),
        r#"{"traceId":"t-14","method":"service.upgrade","params":{"versionCode":"2.0","policyTag":"p","appKey":"a"}}"#,
    )
    .await;

    let body = h.next_publish().await.json();
    assert_eq!(body["code"], "170016");
    assert_eq!(seen_rx.recv().await.unwrap().version_code, "2.0");
}

#[tokio::test]
async fn test_subscriptions_reasserted_on_reconnect() {
    let h = harness().await;
    let subscribed = h
        .client
        .subscribe_custom("/custom/+/data", |_topic, _payload| async { Ok(()) })
        .await
        .unwrap();
    assert!(!subscribed);

    h.connect().await;
    h.events
        .send(TransportEvent::ConnectionLost(Some("network".to_string())))
        .await
        .unwrap();
    h.wait_state(|state| *state == ConnectionState::Disconnected)
        .await;
    h.connect().await;

    let batches = h.transport.subscription_batches();
    assert_eq!(batches.len(), 2);
    for batch in batches {
        assert_eq!(
            batch,
            vec![
                (format!("/sys/{PK}/{DEV}/rpc/request/+"), QoS::AtLeastOnce),
                (format!("/sys/{PK}/{DEV}/up/response/+"), QoS::AtLeastOnce),
                ("/custom/+/data".to_string(), QoS::ExactlyOnce),
            ]
        );
    }
}

#[tokio::test]
async fn test_custom_topic_delivery_and_unsubscribe() {
    let h = harness().await;
    h.connect().await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let subscribed = h
        .client
        .subscribe_custom("/custom/#", move |topic, payload| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send((topic, payload));
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(subscribed);
    assert_eq!(
        h.transport.subscription_batches().last().cloned(),
        Some(vec![("/custom/#".to_string(), QoS::ExactlyOnce)])
    );

    h.deliver("/custom/a/b", "hello").await;
    let (topic, payload) = seen_rx.recv().await.unwrap();
    assert_eq!(topic, "/custom/a/b");
    assert_eq!(&payload[..], b"hello");

    assert!(h.client.unsubscribe_custom("/custom/#").await.unwrap());
    assert!(!h.client.unsubscribe_custom("/custom/#").await.unwrap());
    assert_eq!(
        *h.transport.unsubscribed.lock().unwrap(),
        vec!["/custom/#".to_string()]
    );
}

#[tokio::test]
async fn test_invalid_custom_filter_rejected() {
    let h = harness().await;
    let err = h
        .client
        .subscribe_custom("/custom/#/tail", |_topic, _payload| async { Ok(()) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "170015");
}

#[tokio::test]
async fn test_transport_failure_enters_error_state() {
    let h = harness().await;
    h.connect().await;

    h.events
        .send(TransportEvent::Failed("retries exhausted".to_string()))
        .await
        .unwrap();
    h.wait_state(|state| matches!(state, ConnectionState::Error { .. }))
        .await;

    match h.client.state() {
        ConnectionState::Error { code, .. } => assert_eq!(code, "170009"),
        other => panic!("unexpected state {other}"),
    }
}

#[tokio::test]
async fn test_custom_subscription_during_resubscribe_is_sent() {
    let h = harness().await;
    let (entered, release) = h.transport.hold_next_subscribe();
    h.events.send(TransportEvent::Connected).await.unwrap();
    entered.await.unwrap();

    let client = h.client.clone();
    let subscribe = tokio::spawn(async move {
        client
            .subscribe_custom("factory/alarm", |_topic, _payload| async { Ok(()) })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!subscribe.is_finished());

    release.send(()).unwrap();
    let immediate = subscribe.await.unwrap().unwrap();
    assert!(immediate);
    assert!(h.client.is_connected());

    let batches = h.transport.subscription_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(
        batches[1],
        vec![("factory/alarm".to_string(), QoS::ExactlyOnce)]
    );
}

#[tokio::test]
async fn test_new_transport_attaches_after_failure() {
    let h = harness().await;
    h.connect().await;

    h.events
        .send(TransportEvent::Failed("gave up".to_string()))
        .await
        .unwrap();
    h.wait_state(|state| matches!(state, ConnectionState::Error { .. }))
        .await;

    let (transport, mut published) = MockTransport::new();
    let events = h.client.attach(transport.clone()).await.unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    events.send(TransportEvent::Connected).await.unwrap();
    let mut state = h.client.subscribe_connection_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(ConnectionState::is_connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.subscription_batches().len(), 1);

    h.client.publish_custom("/custom/t", "x").await.unwrap();
    assert_eq!(published.recv().await.unwrap().topic, "/custom/t");
}
