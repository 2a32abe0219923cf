//! Protocol engine: owns the transport link, the correlation registry and
//! the handler table, and exposes the device call surface.

mod calls;
mod dispatch;

use crate::{
    config::ClientConfig,
    mqtt::{
        config_handler, connect_mqtt_client, message_handler, qos_from_u8, request_handler,
        upgrade_handler, validate_topic_filter, CustomTopics, HandlerResult, HandlerSlots,
        MqttSupervisor, MqttTransport, Transport, TransportEvent,
    },
    registry::CorrelationRegistry,
    tsl::{new_trace_id, ConfigItem, Envelope, Request, Response, UpgradeDescriptor},
    ConnectionState, DeviceIdentity, SdkError, SdkResult,
};
use bytes::Bytes;
use rumqttc::QoS;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Active transport plus the token that stops its background tasks
struct Link {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

pub(crate) struct EngineInner {
    identity: DeviceIdentity,
    config: ClientConfig,
    session_id: String,
    qos: QoS,
    custom_qos: QoS,
    /// Write-locked by connect/disconnect/shutdown, read-locked by publish
    /// and subscribe so steady-state traffic never races teardown
    link: RwLock<Option<Link>>,
    state_tx: watch::Sender<ConnectionState>,
    registry: Arc<CorrelationRegistry>,
    handlers: HandlerSlots,
    custom: CustomTopics,
    /// Held by the resubscribe pass and by custom subscribe/unsubscribe
    subscription_pass: Mutex<()>,
    inbound_pool: Arc<Semaphore>,
    call_pool: Arc<Semaphore>,
    accepting: AtomicBool,
}

impl EngineInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    #[inline]
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> SdkResult<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let link = self.link.read().await;
        let Some(link) = link.as_ref() else {
            return Err(SdkError::NotConnected);
        };
        match link.transport.publish(topic, payload, qos, retain).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(topic, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Fail outstanding calls, then release the transport.
    async fn teardown(&self, slot: &mut Option<Link>, reason: &SdkError) {
        self.set_state(ConnectionState::Disconnected);
        self.registry.cancel_all(reason);
        if let Some(link) = slot.take() {
            if let Err(e) = link.transport.disconnect().await {
                warn!(error = %e, "Transport disconnect failed");
            }
            link.cancel.cancel();
        }
    }
}

/// Device-side protocol engine.
///
/// Cheap to clone; all clones share one connection, registry and handler table.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<EngineInner>,
}

impl DeviceClient {
    /// Create an engine for `identity`. No connection is made until
    /// [`connect`](Self::connect) or [`attach`](Self::attach).
    pub fn new(identity: DeviceIdentity, config: ClientConfig) -> SdkResult<Self> {
        if identity.product_key.trim().is_empty() || identity.device_id.trim().is_empty() {
            return Err(SdkError::ConfigurationError {
                message: "product key and device id are required".to_string(),
            });
        }
        let qos = config.engine.qos()?;
        let custom_qos = config.engine.custom_qos()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = EngineInner {
            session_id: new_trace_id(),
            qos,
            custom_qos,
            link: RwLock::new(None),
            state_tx,
            registry: Arc::new(CorrelationRegistry::new()),
            handlers: HandlerSlots::new(),
            custom: CustomTopics::new(),
            subscription_pass: Mutex::new(()),
            inbound_pool: Arc::new(Semaphore::new(config.engine.inbound_workers.max(1))),
            call_pool: Arc::new(Semaphore::new(config.engine.call_workers.max(1))),
            accepting: AtomicBool::new(true),
            identity,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Session id appended to the broker username
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Connect to the configured broker.
    ///
    /// Returns once the link is set up; the session itself is reported
    /// through [`subscribe_connection_state`](Self::subscribe_connection_state).
    pub async fn connect(&self) -> SdkResult<()> {
        self.ensure_open()?;
        let mut link = self.inner.link.write().await;
        if link.is_some() {
            debug!("Connect requested while already linked");
            return Ok(());
        }

        let credentials = self.inner.identity.credentials(&self.inner.session_id)?;
        let (client, event_loop) =
            match connect_mqtt_client(&self.inner.config.connection, &credentials) {
                Ok(pair) => pair,
                Err(e) => {
                    self.inner.set_state(ConnectionState::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };

        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = self.event_channel();
        MqttSupervisor::new(
            event_loop,
            self.inner.config.retry,
            cancel.child_token(),
            events_tx,
        )
        .spawn();

        info!(
            host = %self.inner.config.connection.host,
            port = self.inner.config.connection.port,
            device_id = %self.inner.identity.device_id,
            "Connecting to broker"
        );
        self.install(&mut link, Arc::new(MqttTransport::new(client)), cancel, events_rx);
        Ok(())
    }

    /// Run the engine over a caller-provided transport.
    ///
    /// The returned sender is where the transport reports connection changes
    /// and inbound messages.
    pub async fn attach(
        &self,
        transport: Arc<dyn Transport>,
    ) -> SdkResult<mpsc::Sender<TransportEvent>> {
        self.ensure_open()?;
        let mut link = self.inner.link.write().await;
        if link.is_some() {
            return Err(SdkError::ConfigurationError {
                message: "a transport is already attached".to_string(),
            });
        }
        let (events_tx, events_rx) = self.event_channel();
        self.install(&mut link, transport, CancellationToken::new(), events_rx);
        Ok(events_tx)
    }

    fn event_channel(
        &self,
    ) -> (
        mpsc::Sender<TransportEvent>,
        mpsc::Receiver<TransportEvent>,
    ) {
        mpsc::channel(self.inner.config.connection.event_queue_capacity.max(1))
    }

    fn install(
        &self,
        slot: &mut Option<Link>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
        events_rx: mpsc::Receiver<TransportEvent>,
    ) {
        self.inner.set_state(ConnectionState::Connecting);
        tokio::spawn(dispatch::run(
            Arc::clone(&self.inner),
            events_rx,
            cancel.clone(),
        ));
        *slot = Some(Link { transport, cancel });
    }

    /// Disconnect from the broker. Outstanding calls fail with `NotConnected`.
    /// The engine can be connected again afterwards.
    pub async fn disconnect(&self) {
        let mut link = self.inner.link.write().await;
        self.inner.teardown(&mut link, &SdkError::NotConnected).await;
    }

    /// Permanently stop the engine.
    ///
    /// Stops accepting inbound work, fails outstanding calls with `Shutdown`,
    /// releases the transport and closes both worker pools.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut link = self.inner.link.write().await;
        self.inner.teardown(&mut link, &SdkError::Shutdown).await;
        self.inner.inbound_pool.close();
        self.inner.call_pool.close();
        info!("Device engine shut down");
    }

    fn ensure_open(&self) -> SdkResult<()> {
        if self.inner.is_accepting() {
            Ok(())
        } else {
            Err(SdkError::Shutdown)
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Observe connection state changes
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of synchronous calls awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Publish a raw message. QoS is validated before anything else.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> SdkResult<()> {
        let qos = qos_from_u8(qos)?;
        self.inner.publish(topic, payload.into(), qos, retain).await
    }

    /// Publish to a custom topic with the engine QoS.
    pub async fn publish_custom(&self, topic: &str, payload: impl Into<Vec<u8>>) -> SdkResult<()> {
        self.inner
            .publish(topic, payload.into(), self.inner.qos, false)
            .await
    }

    /// Direct access to the handler slots, e.g. to clear a handler.
    pub fn handlers(&self) -> &HandlerSlots {
        &self.inner.handlers
    }

    pub fn set_property_set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.inner
            .handlers
            .set_property_set(Some(request_handler(handler)));
    }

    pub fn set_property_get_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.inner
            .handlers
            .set_property_get(Some(request_handler(handler)));
    }

    pub fn set_service_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.inner.handlers.set_service(Some(request_handler(handler)));
    }

    pub fn set_config_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Vec<ConfigItem>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.handlers.set_config(Some(config_handler(handler)));
    }

    pub fn set_upgrade_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(UpgradeDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .handlers
            .set_upgrade(Some(upgrade_handler(handler)));
    }

    /// Subscribe to a custom topic filter (`+` and `#` allowed).
    ///
    /// The subscription is recorded and re-asserted on every reconnect.
    /// Returns `true` if it was sent to the broker now and `false` if it is
    /// deferred until the next connect.
    pub async fn subscribe_custom<F, Fut>(&self, topic: &str, handler: F) -> SdkResult<bool>
    where
        F: Fn(String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        validate_topic_filter(topic)?;
        let _pass = self.inner.subscription_pass.lock().await;
        self.inner.custom.insert(topic, message_handler(handler));

        let link = self.inner.link.read().await;
        let transport = match link.as_ref() {
            Some(link) if self.inner.is_connected() => &link.transport,
            _ => {
                debug!(topic, "Custom subscription deferred until connected");
                return Ok(false);
            }
        };
        transport
            .subscribe_many(vec![(topic.to_string(), self.inner.custom_qos)])
            .await?;
        info!(topic, "Subscribed to custom topic");
        Ok(true)
    }

    /// Forget a custom subscription. Returns whether it was recorded.
    pub async fn unsubscribe_custom(&self, topic: &str) -> SdkResult<bool> {
        let _pass = self.inner.subscription_pass.lock().await;
        if !self.inner.custom.remove(topic) {
            return Ok(false);
        }
        let link = self.inner.link.read().await;
        if let Some(link) = link.as_ref() {
            if self.inner.is_connected() {
                link.transport.unsubscribe(topic).await?;
            }
        }
        info!(topic, "Unsubscribed from custom topic");
        Ok(true)
    }
}
