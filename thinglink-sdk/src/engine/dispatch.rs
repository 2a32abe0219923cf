use super::EngineInner;
use crate::{
    mqtt::TransportEvent,
    tsl::{
        classify, decode_request, decode_response, encode_response, extract_device_id,
        extract_message_id, Envelope, Response, TopicKind, Topics,
    },
    ConnectionState, SdkError,
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Period of the sweep that expires calls whose waiter never collected them
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Consume transport events for one link, in arrival order.
pub(super) async fn run(
    inner: Arc<EngineInner>,
    mut events_rx: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut sweep = interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let expired = inner.registry.expire_overdue(Instant::now());
                if expired > 0 {
                    debug!(expired, "Expired overdue calls");
                }
                continue;
            }
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.on_event(event, &cancel).await;
    }
    debug!("Engine dispatcher stopped");
}

impl EngineInner {
    async fn on_event(self: &Arc<Self>, event: TransportEvent, cancel: &CancellationToken) {
        match event {
            TransportEvent::Connected => self.on_connected(cancel).await,
            TransportEvent::ConnectionLost(cause) => {
                warn!(cause = ?cause, "Connection lost");
                self.set_state(ConnectionState::Disconnected);
            }
            TransportEvent::Message { topic, payload } => self.on_message(topic, payload),
            TransportEvent::DeliveryComplete(packet_id) => {
                debug!(packet_id, "Delivery complete");
            }
            TransportEvent::Failed(reason) => {
                let err = SdkError::TransportException { reason };
                error!(error = %err, "Transport gave up");
                // Release the dead link so connect/attach can install a new one.
                // A cancelled token means it was already torn down and the
                // slot may hold its successor.
                let mut slot = self.link.write().await;
                if cancel.is_cancelled() {
                    return;
                }
                self.registry.cancel_all(&SdkError::NotConnected);
                self.set_state(ConnectionState::Error {
                    code: err.code(),
                    message: err.to_string(),
                });
                if let Some(link) = slot.take() {
                    link.cancel.cancel();
                }
            }
        }
    }

    /// Assert the fixed and custom subscriptions in one batch, then report
    /// the session as connected.
    async fn on_connected(&self, cancel: &CancellationToken) {
        // Custom subscribe/unsubscribe wait for this pass, so a topic recorded
        // meanwhile is either in the batch or sent once the state is Connected.
        let _pass = self.subscription_pass.lock().await;
        let link = self.link.read().await;
        let Some(link) = link.as_ref().filter(|_| !cancel.is_cancelled()) else {
            return;
        };

        let pk = &self.identity.product_key;
        let did = &self.identity.device_id;
        let mut filters = vec![
            (Topics::downstream_request_sub(pk, did), self.qos),
            (Topics::upstream_response_sub(pk, did), self.qos),
        ];
        filters.extend(
            self.custom
                .topics()
                .into_iter()
                .map(|topic| (topic, self.custom_qos)),
        );
        let count = filters.len();

        match link.transport.subscribe_many(filters).await {
            Ok(()) => {
                info!(topics = count, "Subscriptions asserted");
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!(error = %e, "Failed to assert subscriptions");
                self.set_state(ConnectionState::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn on_message(self: &Arc<Self>, topic: String, payload: Bytes) {
        let kind = classify(&topic);
        if kind == TopicKind::UpstreamResponse {
            self.on_upstream_response(&topic, &payload);
            return;
        }
        if !self.is_accepting() {
            debug!(topic = %topic, "Engine closed, dropping inbound message");
            return;
        }

        let inner = Arc::clone(self);
        let pool = Arc::clone(&self.inbound_pool);
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            match kind {
                TopicKind::DownstreamRequest => inner.on_downstream_request(topic, payload).await,
                _ => inner.on_custom_message(topic, payload).await,
            }
        });
    }

    fn on_upstream_response(&self, topic: &str, payload: &[u8]) {
        match decode_response(payload) {
            Ok((envelope, response)) => {
                if !self.registry.complete(&envelope.trace_id, response) {
                    debug!(trace_id = %envelope.trace_id, topic, "Response for unknown or expired call");
                }
            }
            Err(e) => warn!(topic, error = %e, "Dropping undecodable response"),
        }
    }

    async fn on_downstream_request(&self, topic: String, payload: Bytes) {
        let (device_id, message_id) = match (extract_device_id(&topic), extract_message_id(&topic)) {
            (Ok(device_id), Ok(message_id)) => (device_id.to_string(), message_id.to_string()),
            (Err(e), _) | (_, Err(e)) => {
                warn!(topic = %topic, error = %e, "Dropping request on malformed topic");
                return;
            }
        };

        let (envelope, response) = match decode_request(&payload) {
            Ok((mut envelope, request)) => {
                envelope.device_id = device_id;
                debug!(
                    trace_id = %envelope.trace_id,
                    method = %request.method,
                    "Downstream request"
                );
                let reply = envelope.clone();
                (reply, self.handlers.dispatch(envelope, request).await)
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Malformed downstream request");
                let envelope = Envelope {
                    version: self.config.engine.version.clone(),
                    trace_id: String::new(),
                    device_id,
                };
                (envelope, Response::from_error(&e))
            }
        };

        self.reply(envelope, &message_id, response).await;
    }

    async fn reply(&self, mut envelope: Envelope, message_id: &str, response: Response) {
        if envelope.version.is_empty() {
            envelope.version = self.config.engine.version.clone();
        }
        if envelope.device_id.is_empty() {
            envelope.device_id = self.identity.device_id.clone();
        }
        let topic = Topics::downstream_response_topic(
            &self.identity.product_key,
            &envelope.device_id,
            message_id,
        );
        let payload = match encode_response(&envelope, &response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.publish(&topic, payload, self.qos, false).await {
            warn!(topic = %topic, code = %response.code, error = %e, "Reply not delivered");
        }
    }

    async fn on_custom_message(&self, topic: String, payload: Bytes) {
        let Some(handler) = self.custom.lookup(&topic) else {
            debug!(topic = %topic, "No handler for custom topic");
            return;
        };
        if let Err(e) = handler(topic.clone(), payload).await {
            warn!(topic = %topic, error = %e, "Custom topic handler failed");
        }
    }
}
