mod client;
pub mod router;
mod supervisor;
mod transport;

pub(crate) use client::connect_mqtt_client;
pub use router::{
    config_handler, message_handler, mqtt_pattern_matches, request_handler, upgrade_handler,
    validate_topic_filter, ConfigHandler, CustomTopics, HandlerFuture, HandlerResult, HandlerSlots,
    MessageHandler, RequestHandler, UpgradeHandler,
};
pub(crate) use supervisor::MqttSupervisor;
pub use transport::{qos_from_u8, MqttTransport, Transport, TransportEvent};
