use crate::{
    tsl::{
        decode_config_items, decode_upgrade, ConfigItem, DownMethod, Envelope, Request, Response,
        UpgradeDescriptor,
    },
    SdkError, SdkResult,
};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use std::{future::Future, pin::Pin, sync::Arc};

/// Result type for config, upgrade and custom-topic handlers
pub type HandlerResult = SdkResult<()>;

/// Boxed future returned by every handler
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Property get/set and service handler: receives the request and returns the reply
pub type RequestHandler = Box<dyn Fn(Envelope, Request) -> HandlerFuture<Response> + Send + Sync>;

/// Config push handler
pub type ConfigHandler = Box<dyn Fn(Vec<ConfigItem>) -> HandlerFuture<HandlerResult> + Send + Sync>;

/// OTA upgrade handler
pub type UpgradeHandler =
    Box<dyn Fn(UpgradeDescriptor) -> HandlerFuture<HandlerResult> + Send + Sync>;

/// Custom-topic message handler
pub type MessageHandler = Arc<dyn Fn(String, Bytes) -> HandlerFuture<HandlerResult> + Send + Sync>;

/// Box an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Envelope, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Box::new(
        move |envelope: Envelope, request: Request| -> HandlerFuture<Response> {
            Box::pin(f(envelope, request))
        },
    )
}

/// Box an async closure as a [`ConfigHandler`].
pub fn config_handler<F, Fut>(f: F) -> ConfigHandler
where
    F: Fn(Vec<ConfigItem>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Box::new(move |items: Vec<ConfigItem>| -> HandlerFuture<HandlerResult> { Box::pin(f(items)) })
}

/// Box an async closure as an [`UpgradeHandler`].
pub fn upgrade_handler<F, Fut>(f: F) -> UpgradeHandler
where
    F: Fn(UpgradeDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Box::new(
        move |descriptor: UpgradeDescriptor| -> HandlerFuture<HandlerResult> {
            Box::pin(f(descriptor))
        },
    )
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(String, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |topic: String, payload: Bytes| -> HandlerFuture<HandlerResult> {
            Box::pin(f(topic, payload))
        },
    )
}

/// Optional handler slots, one per downstream method category.
///
/// Slots are swapped atomically and read without locking on the dispatch path.
#[derive(Default)]
pub struct HandlerSlots {
    property_set: ArcSwapOption<RequestHandler>,
    property_get: ArcSwapOption<RequestHandler>,
    service: ArcSwapOption<RequestHandler>,
    config: ArcSwapOption<ConfigHandler>,
    upgrade: ArcSwapOption<UpgradeHandler>,
}

impl HandlerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property_set(&self, handler: Option<RequestHandler>) {
        self.property_set.store(handler.map(Arc::new));
    }

    pub fn set_property_get(&self, handler: Option<RequestHandler>) {
        self.property_get.store(handler.map(Arc::new));
    }

    pub fn set_service(&self, handler: Option<RequestHandler>) {
        self.service.store(handler.map(Arc::new));
    }

    pub fn set_config(&self, handler: Option<ConfigHandler>) {
        self.config.store(handler.map(Arc::new));
    }

    pub fn set_upgrade(&self, handler: Option<UpgradeHandler>) {
        self.upgrade.store(handler.map(Arc::new));
    }

    /// Route a decoded downstream request to its handler and produce the reply.
    ///
    /// A category without a registered handler replies `MethodNotSupported`.
    pub async fn dispatch(&self, envelope: Envelope, request: Request) -> Response {
        match DownMethod::parse(&request.method) {
            DownMethod::PropertySet => match self.property_set.load_full() {
                Some(handler) => handler(envelope, request).await,
                None => unsupported(&request.method),
            },
            DownMethod::PropertyGet => match self.property_get.load_full() {
                Some(handler) => handler(envelope, request).await,
                None => unsupported(&request.method),
            },
            DownMethod::Service => match self.service.load_full() {
                Some(handler) => handler(envelope, request).await,
                None => unsupported(&request.method),
            },
            DownMethod::ConfigPush => match self.config.load_full() {
                Some(handler) => match decode_config_items(&request.params) {
                    Ok(items) => handler(items).await.into(),
                    Err(e) => Response::from_error(&e),
                },
                None => unsupported(&request.method),
            },
            DownMethod::Upgrade => match self.upgrade.load_full() {
                Some(handler) => match decode_upgrade(&request.params) {
                    Ok(descriptor) => handler(descriptor).await.into(),
                    Err(e) => Response::from_error(&e),
                },
                None => unsupported(&request.method),
            },
            DownMethod::Unsupported => unsupported(&request.method),
        }
    }
}

fn unsupported(method: &str) -> Response {
    Response::from_error(&SdkError::MethodNotSupported {
        method: method.to_string(),
    })
}

/// Custom topic subscriptions, re-asserted on every reconnect.
#[derive(Default)]
pub struct CustomTopics {
    entries: DashMap<String, MessageHandler>,
}

impl CustomTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. Returns `true` if the topic was not yet recorded.
    pub fn insert(&self, topic: impl Into<String>, handler: MessageHandler) -> bool {
        self.entries.insert(topic.into(), handler).is_none()
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Find the handler for an inbound topic: exact match first, then the
    /// first wildcard filter that matches.
    pub fn lookup(&self, topic: &str) -> Option<MessageHandler> {
        if let Some(entry) = self.entries.get(topic) {
            return Some(Arc::clone(entry.value()));
        }
        self.entries
            .iter()
            .find(|entry| mqtt_pattern_matches(entry.key(), topic))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every recorded topic filter
    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Check if an MQTT topic matches a pattern with wildcards
///
/// Supports MQTT-style wildcards:
/// - `+` matches exactly one topic level
/// - `#` matches zero or more topic levels (must be at the end)
pub fn mqtt_pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    if pattern == "#" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix("/#") {
        if prefix.contains('+') {
            return matches_mixed_wildcards(pattern, topic);
        }

        if topic.starts_with(prefix) {
            return topic.len() == prefix.len() || topic.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        return false;
    }

    if pattern.contains('+') {
        return matches_with_single_level_wildcards(pattern, topic);
    }

    false
}

/// Returns true if the first `count` parts of pattern match the topic parts
fn matches_pattern_parts(pattern_parts: &[&str], topic_parts: &[&str], count: usize) -> bool {
    if topic_parts.len() < count {
        return false;
    }

    pattern_parts
        .iter()
        .zip(topic_parts)
        .take(count)
        .all(|(p, t)| *p == "+" || p == t)
}

fn matches_with_single_level_wildcards(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if pattern_parts.len() != topic_parts.len() {
        return false;
    }

    matches_pattern_parts(&pattern_parts, &topic_parts, pattern_parts.len())
}

fn matches_mixed_wildcards(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if pattern_parts.last() != Some(&"#") {
        return false;
    }

    let prefix_len = pattern_parts.len() - 1;
    matches_pattern_parts(&pattern_parts, &topic_parts, prefix_len)
}

/// Validate a custom subscription filter before it reaches the broker.
pub fn validate_topic_filter(pattern: &str) -> SdkResult<()> {
    let invalid = |reason: &str| SdkError::ConfigurationError {
        message: format!("invalid topic filter '{pattern}': {reason}"),
    };

    if pattern.is_empty() {
        return Err(invalid("filter cannot be empty"));
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" if index + 1 == levels.len() => {}
            "#" => return Err(invalid("'#' must be the last level")),
            literal if literal.contains(['+', '#']) => {
                return Err(invalid("wildcards cannot be mixed with text in one level"))
            }
            _ => {}
        }
    }
    Ok(())
}
