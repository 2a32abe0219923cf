use crate::{SdkError, SdkResult};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use std::fmt;

type HmacMd5 = Hmac<Md5>;

/// Device identity issued by the platform
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_secret: String,
}

impl DeviceIdentity {
    pub fn new(
        product_key: impl Into<String>,
        device_id: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        Self {
            product_key: product_key.into(),
            device_id: device_id.into(),
            device_secret: device_secret.into(),
        }
    }

    /// Derive broker credentials for one engine session.
    ///
    /// username = `{deviceId}_{sessionId}`, password = uppercase hex of
    /// HMAC-MD5 keyed by the device secret over the device id.
    pub fn credentials(&self, session_id: &str) -> SdkResult<MqttCredentials> {
        if self.device_id.trim().is_empty() {
            return Err(SdkError::ConfigurationError {
                message: "device id must not be empty".to_string(),
            });
        }
        Ok(MqttCredentials {
            client_id: self.device_id.clone(),
            username: format!("{}_{}", self.device_id, session_id),
            password: sign_hmac_md5(&self.device_secret, &self.device_id)?,
        })
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("product_key", &self.product_key)
            .field("device_id", &self.device_id)
            .field("device_secret", &"***")
            .finish()
    }
}

/// Broker login derived from a [`DeviceIdentity`]
#[derive(Clone, PartialEq, Eq)]
pub struct MqttCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// HMAC-MD5 of `data` keyed by `key`, as uppercase hex.
pub fn sign_hmac_md5(key: &str, data: &str) -> SdkResult<String> {
    let mut mac = HmacMd5::new_from_slice(key.as_bytes()).map_err(|e| {
        SdkError::ConfigurationError {
            message: format!("invalid signing key: {e}"),
        }
    })?;
    mac.update(data.as_bytes());
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}
