//! Device-side SDK: a request/response protocol engine over MQTT.
//!
//! The platform calls the device on `/sys/{pk}/{did}/rpc/request/{msgId}` and
//! the device replies on the matching `rpc/response` topic. Device-initiated
//! calls go out on `/sys/{pk}/{did}/up/request/{traceId}` and synchronous
//! callers are woken when the `up/response` arrives.

pub mod config;
mod engine;
mod error;
mod gateway;
mod identity;
pub mod mqtt;
mod provision;
pub mod registry;
mod retry;
pub mod tsl;
mod types;

pub type SdkResult<T> = Result<T, SdkError>;

pub use config::{ClientConfig, ConnectionConfig, EngineConfig};
pub use engine::DeviceClient;
pub use error::{SdkError, SDK_CODE_BASE, SUCCESS_CODE};
pub use gateway::SubDeviceManager;
pub use identity::{sign_hmac_md5, DeviceIdentity, MqttCredentials};
pub use mqtt::{Transport, TransportEvent};
pub use provision::{DeviceRegistrar, RegisterConfig, REGISTER_VERSION};
pub use registry::CorrelationRegistry;
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use tsl::{ConfigItem, ConfigKey, Envelope, Request, Response, SubDeviceRecord, UpgradeDescriptor};
pub use types::ConnectionState;
