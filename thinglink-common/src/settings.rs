use config::{Config, Environment, File};
use serde::Deserialize;
use std::{ops::Deref, sync::Arc};
use thinglink_error::AppResult;
use thinglink_sdk::{ClientConfig, DeviceIdentity, RegisterConfig};

/// Prefix of environment overrides, e.g. `THINGLINK__CLIENT__CONNECTION__HOST`
pub const ENV_PREFIX: &str = "THINGLINK";

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Load `config_path` (optional, any format the `config` crate detects
    /// from the extension) layered under `THINGLINK__*` environment variables.
    pub fn new(config_path: &str) -> AppResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub device: DeviceSection,
    /// HTTP registration; used when the device has no secret yet
    #[serde(default)]
    pub register: Option<RegisterConfig>,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "General::log_level_default")]
    pub log_level: String,
    #[serde(default = "General::log_dir_default")]
    pub log_dir: String,
    #[serde(default = "General::log_file_default")]
    pub log_file: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            log_level: General::log_level_default(),
            log_dir: General::log_dir_default(),
            log_file: General::log_file_default(),
        }
    }
}

impl General {
    fn log_level_default() -> String {
        "info".into()
    }

    fn log_dir_default() -> String {
        "logs".into()
    }

    fn log_file_default() -> String {
        "thinglink.log".into()
    }
}

/// Device credentials as written in the settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_secret: String,
}

impl DeviceSection {
    /// True when the broker login can be derived without registering first.
    pub fn is_provisioned(&self) -> bool {
        !self.product_key.is_empty() && !self.device_id.is_empty() && !self.device_secret.is_empty()
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.product_key, &self.device_id, &self.device_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::new("/nonexistent/thinglink-settings").unwrap();
        assert_eq!(settings.general.log_level, "info");
        assert_eq!(settings.general.log_dir, "logs");
        assert!(settings.register.is_none());
        assert!(!settings.device.is_provisioned());
        assert_eq!(settings.client.connection.port, 1883);
    }

    #[test]
    fn test_toml_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("thinglink-settings-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[general]
log_level = "debug"

[device]
product_key = "PK"
device_id = "DEV"
device_secret = "S"

[register]
url = "https://iot.example.com/register"
product_key = "PK"
product_secret = "PS"
identities = {{ mac = ["AA:BB"] }}

[client.connection]
host = "broker.example.com"

[client.engine]
call_timeout_ms = 3000
"#
        )
        .unwrap();
        drop(file);

        let settings = Settings::new(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.general.log_level, "debug");
        assert!(settings.device.is_provisioned());
        assert_eq!(settings.device.identity().device_id, "DEV");
        let register = settings.register.as_ref().unwrap();
        assert_eq!(register.identities["mac"], vec!["AA:BB".to_string()]);
        assert_eq!(register.timeout_ms, 10_000);
        assert_eq!(settings.client.connection.host, "broker.example.com");
        assert_eq!(settings.client.engine.call_timeout_ms, 3000);
    }
}
