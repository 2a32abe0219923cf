use crate::{DeviceIdentity, SdkError, SdkResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Versioned configuration key, reported with `thing.event.config.post`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigKey {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: i64,
}

impl ConfigKey {
    pub fn new(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

/// One entry of a `config.push` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    #[serde(flatten)]
    pub key: ConfigKey,
    #[serde(default = "ConfigItem::default_values")]
    pub values: Value,
}

impl ConfigItem {
    fn default_values() -> Value {
        Value::Object(Default::default())
    }
}

/// OTA notification carried by `service.upgrade`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeDescriptor {
    #[serde(default)]
    pub version_code: String,
    #[serde(default)]
    pub policy_tag: String,
    #[serde(default)]
    pub app_key: String,
}

/// Sub-device managed through a gateway connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubDeviceRecord(pub DeviceIdentity);

impl SubDeviceRecord {
    pub fn new(product_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self(DeviceIdentity::new(product_key, device_id, ""))
    }
}

impl From<DeviceIdentity> for SubDeviceRecord {
    fn from(identity: DeviceIdentity) -> Self {
        Self(identity)
    }
}

/// Decode `config.push` params. Non-object entries are skipped.
pub fn decode_config_items(params: &str) -> SdkResult<Vec<ConfigItem>> {
    let entries: Vec<Value> =
        serde_json::from_str(params).map_err(|e| SdkError::DeserializeFailed {
            reason: format!("config push params must be an array: {e}"),
        })?;
    entries
        .into_iter()
        .filter(Value::is_object)
        .map(|entry| serde_json::from_value(entry).map_err(SdkError::from))
        .collect()
}

/// Decode `service.upgrade` params.
pub fn decode_upgrade(params: &str) -> SdkResult<UpgradeDescriptor> {
    Ok(serde_json::from_str(params)?)
}
