//! TSL method names and downstream method routing.

/// Namespace shared by every TSL method
pub const THING_PREFIX: &str = "thing.";

pub const PROPERTY_SET: &str = "property.set";
pub const PROPERTY_GET: &str = "property.get";
pub const CONFIG_PUSH: &str = "config.push";
pub const CONFIG_PUSH_SERVICE: &str = "service.configPush";
pub const SERVICE_UPGRADE: &str = "service.upgrade";
pub const SERVICE_PREFIX: &str = "service.";

/// Upstream method prefixes
pub const UP_PROPERTY_POST: &str = "thing.property.post";
pub const UP_PROPERTY_GET: &str = "thing.property.get";
pub const UP_SERVICE_PREFIX: &str = "thing.service.";
pub const UP_EVENT_PREFIX: &str = "thing.event.";
pub const UP_BASIC_POST: &str = "thing.event.basic.post";
pub const UP_CONFIG_POST: &str = "thing.event.config.post";

/// Gateway sub-device methods, qualified with [`THING_PREFIX`]
pub const SUB_CONNECT: &str = "sub.connect";
pub const SUB_DISCONNECT: &str = "sub.disconnect";
pub const SUB_ADD: &str = "sub.add";
pub const SUB_DEL: &str = "sub.del";
pub const SUB_GET: &str = "sub.get";

/// Handler category of a downstream method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownMethod {
    PropertySet,
    PropertyGet,
    ConfigPush,
    Upgrade,
    Service,
    Unsupported,
}

impl DownMethod {
    /// Route a downstream method name. The `thing.` namespace is optional,
    /// and the bare identifier (`set`, `configPush`, ...) is accepted too.
    pub fn parse(method: &str) -> Self {
        let short = method.strip_prefix(THING_PREFIX).unwrap_or(method);
        match short {
            PROPERTY_SET | "set" => DownMethod::PropertySet,
            PROPERTY_GET | "get" => DownMethod::PropertyGet,
            CONFIG_PUSH | CONFIG_PUSH_SERVICE | "configPush" => DownMethod::ConfigPush,
            SERVICE_UPGRADE | "upgrade" => DownMethod::Upgrade,
            s if s.len() > SERVICE_PREFIX.len() && s.starts_with(SERVICE_PREFIX) => {
                DownMethod::Service
            }
            _ => DownMethod::Unsupported,
        }
    }
}

/// Qualify an upstream method with `prefix`.
///
/// - already prefixed: unchanged
/// - prefix ending in `.`: prepended (`thing.event.` + `alarm`)
/// - empty method, or the prefix already ends with it
///   (`thing.property.get` for `property.get`): the prefix alone
/// - otherwise: prepended
pub fn qualify_method(prefix: &str, method: &str) -> String {
    if prefix.is_empty() || method.starts_with(prefix) {
        return method.to_string();
    }
    if prefix.ends_with('.') {
        return format!("{prefix}{method}");
    }
    if method.is_empty() || prefix.ends_with(method) {
        return prefix.to_string();
    }
    format!("{prefix}{method}")
}
