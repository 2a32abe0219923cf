use crate::{
    build_exponential_backoff, sign_hmac_md5, tsl::new_trace_id, DeviceIdentity, RetryPolicy,
    SdkError, SdkResult, SUCCESS_CODE,
};
use backoff::backoff::Backoff;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use tracing::{debug, info, warn};

/// Protocol version of the registration body
pub const REGISTER_VERSION: &str = "1.1.3";

const CONTENT_TYPE_JSON: &str = "application/json;charset=UTF-8";
const HEADER_SIGN: &str = "x-auth-sign";
const HEADER_TRACE_ID: &str = "x-auth-traceID";
const HEADER_TIMESTAMP: &str = "x-auth-ts";

/// HTTP device registration settings
#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Registration endpoint
    pub url: String,
    pub product_key: String,
    pub product_secret: String,
    /// Hardware identifiers by type, e.g. `mac -> [..]`
    #[serde(default)]
    pub identities: BTreeMap<String, Vec<String>>,
    /// Per-request timeout in milliseconds
    #[serde(default = "RegisterConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RegisterConfig {
    fn default_timeout_ms() -> u64 {
        10_000
    }

    /// Reject configurations that can never register.
    pub fn validate(&self) -> SdkResult<()> {
        if self.url.trim().is_empty() {
            return Err(SdkError::RegistrationFailed {
                reason: "registration url is empty".to_string(),
            });
        }
        if self.product_key.trim().is_empty() {
            return Err(SdkError::RegistrationFailed {
                reason: "product key is empty".to_string(),
            });
        }
        if self.identities.is_empty() {
            return Err(SdkError::RegistrationFailed {
                reason: "no device identifiers configured".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for RegisterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterConfig")
            .field("url", &self.url)
            .field("product_key", &self.product_key)
            .field("product_secret", &"***")
            .field("identities", &self.identities)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    product_key: &'a str,
    version: &'a str,
    identities: Vec<IdentityEntry<'a>>,
}

#[derive(Serialize)]
struct IdentityEntry<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    values: &'a [String],
}

#[derive(Deserialize)]
struct RegisterReply {
    code: String,
    #[serde(default)]
    message: String,
    data: Option<DeviceIdentity>,
}

/// Failure of a single registration attempt
enum AttemptError {
    /// Network failure or 5xx; worth another try
    Transient(SdkError),
    Fatal(SdkError),
}

/// Exchanges product credentials and hardware identifiers for a device
/// identity over HTTP.
pub struct DeviceRegistrar {
    http: Client,
    config: RegisterConfig,
    retry: RetryPolicy,
}

impl DeviceRegistrar {
    pub fn new(config: RegisterConfig, retry: RetryPolicy) -> SdkResult<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SdkError::RegistrationFailed {
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            http,
            config,
            retry,
        })
    }

    /// JSON body sent to the registration endpoint.
    pub fn build_body(&self) -> SdkResult<String> {
        let body = RegisterBody {
            product_key: &self.config.product_key,
            version: REGISTER_VERSION,
            identities: self
                .config
                .identities
                .iter()
                .map(|(kind, values)| IdentityEntry {
                    kind,
                    values: values.as_slice(),
                })
                .collect(),
        };
        serde_json::to_string(&body).map_err(|e| SdkError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    /// Register the device, retrying transient failures with the retry policy.
    pub async fn register(&self) -> SdkResult<DeviceIdentity> {
        let body = self.build_body()?;
        let mut bo = build_exponential_backoff(&self.retry);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let err = match self.attempt(&body).await {
                Ok(identity) => {
                    info!(
                        product_key = %identity.product_key,
                        device_id = %identity.device_id,
                        "Device registered"
                    );
                    return Ok(identity);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => e,
            };

            if !self.retry.allows_attempt(attempts) {
                warn!(attempts, error = %err, "Registration retries exhausted");
                return Err(err);
            }
            let Some(delay) = bo.next_backoff() else {
                warn!(attempts, error = %err, "Registration backoff exhausted");
                return Err(err);
            };
            warn!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Registration failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, body: &str) -> Result<DeviceIdentity, AttemptError> {
        let trace_id = new_trace_id();
        let sign = sign_hmac_md5(&self.config.product_secret, body).map_err(AttemptError::Fatal)?;
        let timestamp = chrono::Utc::now().timestamp_millis();

        debug!(url = %self.config.url, trace_id = %trace_id, "Calling registration endpoint");
        let response = self
            .http
            .post(&self.config.url)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .header(HEADER_SIGN, sign)
            .header(HEADER_TRACE_ID, &trace_id)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| AttemptError::Transient(registration_failed(e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AttemptError::Transient(registration_failed(e)))?;

        if !status.is_success() {
            let err = registration_failed(format!("http status {status}: {text}"));
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                AttemptError::Transient(err)
            } else {
                AttemptError::Fatal(err)
            });
        }

        parse_reply(&text).map_err(AttemptError::Fatal)
    }
}

fn registration_failed(reason: impl fmt::Display) -> SdkError {
    SdkError::RegistrationFailed {
        reason: reason.to_string(),
    }
}

/// Parse `{code, message, data: {productKey, deviceId, deviceSecret}}`.
fn parse_reply(text: &str) -> SdkResult<DeviceIdentity> {
    let reply: RegisterReply = serde_json::from_str(text)
        .map_err(|e| registration_failed(format!("invalid reply: {e}")))?;
    if reply.code != SUCCESS_CODE {
        return Err(registration_failed(format!(
            "platform rejected registration: {} {}",
            reply.code, reply.message
        )));
    }
    let identity = reply
        .data
        .ok_or_else(|| registration_failed("reply carries no device data"))?;
    if identity.device_id.is_empty() || identity.device_secret.is_empty() {
        return Err(registration_failed("reply carries incomplete device data"));
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegisterConfig {
        RegisterConfig {
            url: "http://127.0.0.1:9/register".to_string(),
            product_key: "PK".to_string(),
            product_secret: "secret".to_string(),
            identities: BTreeMap::from([(
                "mac".to_string(),
                vec!["AA:BB".to_string(), "CC:DD".to_string()],
            )]),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_build_body() {
        let registrar = DeviceRegistrar::new(config(), RetryPolicy::default()).unwrap();
        let body = registrar.build_body().unwrap();
        assert_eq!(
            body,
            r#"{"productKey":"PK","version":"1.1.3","identities":[{"type":"mac","values":["AA:BB","CC:DD"]}]}"#
        );
    }

    #[test]
    fn test_empty_identities_rejected() {
        let mut cfg = config();
        cfg.identities.clear();
        let err = DeviceRegistrar::new(cfg, RetryPolicy::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), "170010");
    }

    #[test]
    fn test_empty_product_key_rejected() {
        let mut cfg = config();
        cfg.product_key = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_reply_success() {
        let identity = parse_reply(
            r#"{"code":"000000","message":"ok","data":{"productKey":"PK","deviceId":"D1","deviceSecret":"S1"}}"#,
        )
        .unwrap();
        assert_eq!(identity, DeviceIdentity::new("PK", "D1", "S1"));
    }

    #[test]
    fn test_parse_reply_rejected_code() {
        let err = parse_reply(r#"{"code":"100001","message":"bad sign","data":null}"#).unwrap_err();
        assert!(matches!(err, SdkError::RegistrationFailed { ref reason } if reason.contains("bad sign")));
    }

    #[test]
    fn test_parse_reply_missing_data() {
        assert!(parse_reply(r#"{"code":"000000","message":"ok"}"#).is_err());
        assert!(parse_reply(
            r#"{"code":"000000","message":"ok","data":{"productKey":"PK","deviceId":"D1"}}"#
        )
        .is_err());
        assert!(parse_reply("not json").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_exhausts_retries() {
        let registrar =
            DeviceRegistrar::new(config(), RetryPolicy::with_max_attempts(1)).unwrap();
        let err = registrar.register().await.unwrap_err();
        assert_eq!(err.code(), "170010");
    }
}
