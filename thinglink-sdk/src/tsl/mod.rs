//! Thing specification language: topics, envelopes, methods and payloads.

pub mod envelope;
pub mod methods;
pub mod payload;
pub mod topics;

pub use envelope::{
    decode_request, decode_response, encode_request, encode_response, new_trace_id, Envelope,
    Request, Response, DEFAULT_VERSION,
};
pub use methods::{qualify_method, DownMethod};
pub use payload::{
    decode_config_items, decode_upgrade, ConfigItem, ConfigKey, SubDeviceRecord,
    UpgradeDescriptor,
};
pub use topics::{classify, extract_device_id, extract_message_id, TopicKind, Topics};
