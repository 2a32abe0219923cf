#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use thinglink_sdk::{
    ClientConfig, ConnectionState, DeviceClient, DeviceIdentity, SdkError, SdkResult, Transport,
    TransportEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::Level;

pub const PK: &str = "PK";
pub const DEV: &str = "DEV";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// Outbound publish captured by [`MockTransport`]
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).expect("published payload is JSON")
    }

    /// Last topic segment (message id / trace id)
    pub fn message_id(&self) -> &str {
        self.topic.rsplit('/').next().unwrap_or_default()
    }
}

/// In-memory transport recording everything the engine sends.
pub struct MockTransport {
    published_tx: mpsc::UnboundedSender<Published>,
    pub subscriptions: Mutex<Vec<Vec<(String, QoS)>>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub fail_publish: AtomicBool,
    pub disconnected: AtomicBool,
    subscribe_gate: Mutex<Option<SubscribeGate>>,
}

/// Parks one `subscribe_many` call until released
struct SubscribeGate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Published>) {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            published_tx,
            subscriptions: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            subscribe_gate: Mutex::new(None),
        });
        (transport, published_rx)
    }

    pub fn subscription_batches(&self) -> Vec<Vec<(String, QoS)>> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Block the next `subscribe_many` call. The first receiver fires once
    /// the call is parked; sending on the returned sender lets it finish.
    pub fn hold_next_subscribe(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered, entered_rx) = oneshot::channel();
        let (release_tx, release) = oneshot::channel();
        *self.subscribe_gate.lock().unwrap() = Some(SubscribeGate { entered, release });
        (entered_rx, release_tx)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> SdkResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SdkError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        let _ = self.published_tx.send(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe_many(&self, filters: Vec<(String, QoS)>) -> SdkResult<()> {
        let gate = self.subscribe_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.await;
        }
        self.subscriptions.lock().unwrap().push(filters);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> SdkResult<()> {
        self.unsubscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> SdkResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine wired to a [`MockTransport`]
pub struct Harness {
    pub client: DeviceClient,
    pub transport: Arc<MockTransport>,
    pub events: mpsc::Sender<TransportEvent>,
    pub published: mpsc::UnboundedReceiver<Published>,
}

pub async fn harness() -> Harness {
    harness_with(ClientConfig::default()).await
}

pub async fn harness_with(config: ClientConfig) -> Harness {
    init_tracing();
    let client = DeviceClient::new(DeviceIdentity::new(PK, DEV, "secret"), config).unwrap();
    let (transport, published) = MockTransport::new();
    let events = client.attach(transport.clone()).await.unwrap();
    Harness {
        client,
        transport,
        events,
        published,
    }
}

impl Harness {
    /// Report a session and wait until subscriptions are asserted.
    pub async fn connect(&self) {
        self.events.send(TransportEvent::Connected).await.unwrap();
        self.wait_state(ConnectionState::is_connected).await;
    }

    pub async fn wait_state(&self, predicate: impl FnMut(&ConnectionState) -> bool) {
        let mut rx = self.client.subscribe_connection_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("state change in time")
            .expect("state channel open");
    }

    pub async fn deliver(&self, topic: &str, payload: &str) {
        self.events
            .send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload.as_bytes()),
            })
            .await
            .unwrap();
    }

    pub async fn next_publish(&mut self) -> Published {
        tokio::time::timeout(Duration::from_secs(5), self.published.recv())
            .await
            .expect("publish in time")
            .expect("publish channel open")
    }

    /// Answer an upstream call the way the platform does.
    pub async fn reply_to(&self, call: &Published, code: &str, data: Option<&str>) {
        let trace_id = call.message_id();
        let data = data.map(|d| format!(r#","data":{d}"#)).unwrap_or_default();
        let payload = format!(
            r#"{{"version":"1.0.1","traceId":"{trace_id}","code":"{code}","message":"ok"{data}}}"#
        );
        self.deliver(&format!("/sys/{PK}/{DEV}/up/response/{trace_id}"), &payload)
            .await;
    }
}
