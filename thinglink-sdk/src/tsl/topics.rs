//! Topic addressing for the device protocol.
//!
//! Every protocol topic has the shape
//! `/sys/{productKey}/{deviceId}/{direction}/{kind}/{messageId}` where
//! direction is `rpc` (platform to device) or `up` (device to platform) and
//! kind is `request` or `response`.

use crate::{SdkError, SdkResult};

/// Root of all protocol topics
pub const SYS_ROOT: &str = "/sys";
/// Platform-initiated calls
pub const DOWNSTREAM: &str = "rpc";
/// Device-initiated calls
pub const UPSTREAM: &str = "up";
pub const REQUEST: &str = "request";
pub const RESPONSE: &str = "response";
/// Single-level subscription wildcard
pub const SUB_TOPIC: &str = "+";

/// Substring identifying a downstream request topic
pub const DOWNSTREAM_REQUEST_MARK: &str = "/rpc/request/";
/// Substring identifying an upstream response topic
pub const UPSTREAM_RESPONSE_MARK: &str = "/up/response/";

/// Number of `/`-separated segments of a protocol topic, including the
/// empty leading segment.
const TOPIC_SEGMENTS: usize = 7;
const DEVICE_ID_SEGMENT: usize = 3;
const MESSAGE_ID_SEGMENT: usize = 6;

/// Category of an inbound message, derived from its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    DownstreamRequest,
    UpstreamResponse,
    Custom,
}

/// Topic builder for the four protocol topic families
pub struct Topics;

impl Topics {
    fn build(product_key: &str, device_id: &str, direction: &str, kind: &str, tail: &str) -> String {
        format!("{SYS_ROOT}/{product_key}/{device_id}/{direction}/{kind}/{tail}")
    }

    /// Subscription pattern for platform-initiated requests
    pub fn downstream_request_sub(product_key: &str, device_id: &str) -> String {
        Self::build(product_key, device_id, DOWNSTREAM, REQUEST, SUB_TOPIC)
    }

    /// Concrete downstream request topic
    pub fn downstream_request_topic(product_key: &str, device_id: &str, message_id: &str) -> String {
        Self::build(product_key, device_id, DOWNSTREAM, REQUEST, message_id)
    }

    /// Reply address for a downstream request
    pub fn downstream_response_topic(
        product_key: &str,
        device_id: &str,
        message_id: &str,
    ) -> String {
        Self::build(product_key, device_id, DOWNSTREAM, RESPONSE, message_id)
    }

    /// Publish address for device-initiated calls
    pub fn upstream_request_topic(product_key: &str, device_id: &str, message_id: &str) -> String {
        Self::build(product_key, device_id, UPSTREAM, REQUEST, message_id)
    }

    /// Subscription pattern for replies to device-initiated calls
    pub fn upstream_response_sub(product_key: &str, device_id: &str) -> String {
        Self::build(product_key, device_id, UPSTREAM, RESPONSE, SUB_TOPIC)
    }

    /// Concrete upstream response topic
    pub fn upstream_response_topic(product_key: &str, device_id: &str, message_id: &str) -> String {
        Self::build(product_key, device_id, UPSTREAM, RESPONSE, message_id)
    }
}

/// Classify an inbound topic. Anything that is not a protocol topic is `Custom`.
pub fn classify(topic: &str) -> TopicKind {
    if topic.contains(DOWNSTREAM_REQUEST_MARK) {
        TopicKind::DownstreamRequest
    } else if topic.contains(UPSTREAM_RESPONSE_MARK) {
        TopicKind::UpstreamResponse
    } else {
        TopicKind::Custom
    }
}

fn segment<'a>(topic: &'a str, index: usize) -> SdkResult<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    let well_formed = parts.len() == TOPIC_SEGMENTS
        && parts[0].is_empty()
        && SYS_ROOT.strip_prefix('/') == Some(parts[1])
        && matches!(parts[4], DOWNSTREAM | UPSTREAM)
        && matches!(parts[5], REQUEST | RESPONSE)
        && parts[2..].iter().all(|p| !p.is_empty());

    if !well_formed {
        return Err(SdkError::MalformedTopic {
            topic: topic.to_string(),
        });
    }
    Ok(parts[index])
}

/// Extract the device id segment from a protocol topic.
pub fn extract_device_id(topic: &str) -> SdkResult<&str> {
    segment(topic, DEVICE_ID_SEGMENT)
}

/// Extract the message id segment from a protocol topic.
pub fn extract_message_id(topic: &str) -> SdkResult<&str> {
    segment(topic, MESSAGE_ID_SEGMENT)
}
