use crate::{config::ConnectionConfig, MqttCredentials, SdkError, SdkResult};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};
use std::time::Duration;

/// Create the rumqttc client and event loop for a device session.
///
/// TLS is enabled when `ca_cert_path` is configured.
pub(crate) fn connect_mqtt_client(
    config: &ConnectionConfig,
    credentials: &MqttCredentials,
) -> SdkResult<(AsyncClient, EventLoop)> {
    if credentials.client_id.trim().is_empty() {
        return Err(SdkError::ConfigurationError {
            message: "MQTT client id must not be empty".to_string(),
        });
    }
    if config.host.trim().is_empty() {
        return Err(SdkError::ConfigurationError {
            message: "MQTT host must not be empty".to_string(),
        });
    }

    let mut mqtt_options = MqttOptions::new(
        credentials.client_id.clone(),
        config.host.clone(),
        config.port,
    );
    mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_session(config.clean_session);

    if let Some(path) = config.ca_cert_path.as_deref() {
        let ca = std::fs::read(path).map_err(|e| SdkError::ConfigurationError {
            message: format!("Failed to read CA certificate '{path}': {e}"),
        })?;
        mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    let (client, event_loop) = AsyncClient::new(mqtt_options, config.request_capacity.max(1));
    Ok((client, event_loop))
}
