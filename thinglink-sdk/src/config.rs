use crate::{mqtt::qos_from_u8, tsl::DEFAULT_VERSION, RetryPolicy, SdkResult};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Device client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Protocol engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Reconnect pacing for the broker link
    #[serde(default = "ClientConfig::default_retry")]
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            engine: EngineConfig::default(),
            retry: Self::default_retry(),
        }
    }
}

impl ClientConfig {
    fn default_retry() -> RetryPolicy {
        RetryPolicy::unlimited()
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// MQTT broker host
    #[serde(default = "ConnectionConfig::default_host")]
    pub host: String,
    /// MQTT broker port
    #[serde(default = "ConnectionConfig::default_port")]
    pub port: u16,
    /// CA certificate (PEM). When set the link uses TLS.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Keep alive interval in seconds
    #[serde(default = "ConnectionConfig::default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Clean session flag
    #[serde(default)]
    pub clean_session: bool,
    /// Capacity of the rumqttc request channel
    #[serde(default = "ConnectionConfig::default_request_capacity")]
    pub request_capacity: usize,
    /// Capacity of the transport event queue feeding the engine
    #[serde(default = "ConnectionConfig::default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            ca_cert_path: None,
            keep_alive_secs: Self::default_keep_alive_secs(),
            clean_session: false,
            request_capacity: Self::default_request_capacity(),
            event_queue_capacity: Self::default_event_queue_capacity(),
        }
    }
}

impl ConnectionConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_keep_alive_secs() -> u64 {
        30
    }

    fn default_request_capacity() -> usize {
        100
    }

    fn default_event_queue_capacity() -> usize {
        1000
    }
}

/// Protocol engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent inbound request/custom-topic handlers
    #[serde(default = "EngineConfig::default_workers")]
    pub inbound_workers: usize,
    /// Concurrent synchronous upstream calls
    #[serde(default = "EngineConfig::default_workers")]
    pub call_workers: usize,
    /// Default synchronous call timeout in milliseconds
    #[serde(default = "EngineConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// QoS of request/reply traffic and protocol subscriptions (0, 1 or 2)
    #[serde(default = "EngineConfig::default_qos")]
    pub qos: u8,
    /// QoS of custom topic subscriptions (0, 1 or 2)
    #[serde(default = "EngineConfig::default_custom_qos")]
    pub custom_qos: u8,
    /// Protocol version stamped on outbound envelopes
    #[serde(default = "EngineConfig::default_version")]
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inbound_workers: Self::default_workers(),
            call_workers: Self::default_workers(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            qos: Self::default_qos(),
            custom_qos: Self::default_custom_qos(),
            version: Self::default_version(),
        }
    }
}

impl EngineConfig {
    fn default_workers() -> usize {
        4
    }

    fn default_call_timeout_ms() -> u64 {
        10_000
    }

    fn default_qos() -> u8 {
        1
    }

    fn default_custom_qos() -> u8 {
        2
    }

    fn default_version() -> String {
        DEFAULT_VERSION.to_string()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// QoS for request/reply traffic
    pub fn qos(&self) -> SdkResult<QoS> {
        qos_from_u8(self.qos)
    }

    /// QoS for custom topic subscriptions
    pub fn custom_qos(&self) -> SdkResult<QoS> {
        qos_from_u8(self.custom_qos)
    }
}
