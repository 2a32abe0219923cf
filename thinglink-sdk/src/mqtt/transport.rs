use crate::{SdkError, SdkResult};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, QoS, SubscribeFilter};

/// Events delivered by a transport to the protocol engine, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Session (re)established; subscriptions must be asserted again
    Connected,
    /// Session lost; the transport reconnects on its own
    ConnectionLost(Option<String>),
    /// Inbound publish
    Message { topic: String, payload: Bytes },
    /// Outbound publish acknowledged by the broker
    DeliveryComplete(u16),
    /// Transport gave up reconnecting
    Failed(String),
}

/// Pub/sub capability the protocol engine is built on.
///
/// Implementations report inbound traffic and connection changes through the
/// [`TransportEvent`] channel handed out by the engine.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> SdkResult<()>;

    /// Subscribe to every filter in a single request.
    async fn subscribe_many(&self, filters: Vec<(String, QoS)>) -> SdkResult<()>;

    async fn unsubscribe(&self, topic: &str) -> SdkResult<()>;

    async fn disconnect(&self) -> SdkResult<()>;
}

/// Map a numeric QoS level, rejecting anything outside 0..=2.
pub fn qos_from_u8(qos: u8) -> SdkResult<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SdkError::BadQos { qos: other }),
    }
}

/// [`Transport`] backed by a rumqttc client
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> SdkResult<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| SdkError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe_many(&self, filters: Vec<(String, QoS)>) -> SdkResult<()> {
        let filters = filters
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| SdkError::TransportException {
                reason: format!("Failed to subscribe: {e}"),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> SdkResult<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| SdkError::TransportException {
                reason: format!("Failed to unsubscribe from '{topic}': {e}"),
            })
    }

    async fn disconnect(&self) -> SdkResult<()> {
        self.client
            .try_disconnect()
            .map_err(|e| SdkError::TransportException {
                reason: format!("Failed to disconnect: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(5).unwrap_err(), SdkError::BadQos { qos: 5 });
    }
}
