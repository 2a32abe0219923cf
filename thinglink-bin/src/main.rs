use clap::Parser;
use serde_json::{Map, Value};
use std::{
    env::current_dir,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use thinglink_common::{Logger, Settings};
use thinglink_error::{AppError, AppResult};
use thinglink_sdk::{
    ConfigKey, DeviceClient, DeviceIdentity, DeviceRegistrar, Response, RetryPolicy, SdkError,
};
use tokio::{signal::ctrl_c, task::JoinHandle};
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE_NAME: &str = "thinglink.toml";

/// thinglink - device agent speaking the thing request/response protocol
///
/// Connects one device to the platform broker, answers property and
/// service requests and reports its firmware version on every connect.
#[derive(Parser)]
#[command(name = "thinglink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "thinglink device agent", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, the agent looks for 'thinglink.toml'
    /// in the current working directory.
    #[arg(short, long, env = "THINGLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Register over HTTP even when device credentials are configured
    #[arg(long)]
    register: bool,

    /// Firmware version reported after each connect
    #[arg(long, env = "THINGLINK_FIRMWARE_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    firmware_version: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let dir = current_dir()
                .map_err(|e| AppError::from(format!("Failed to get current directory: {e}")))?;
            dir.join(DEFAULT_CONFIG_FILE_NAME)
        }
    };

    let settings = Settings::new(&config_path.to_string_lossy())?;
    let mut logger = Logger::from_level_name(&settings.general.log_level);
    logger.initialize(&settings.general.log_dir, &settings.general.log_file)?;
    info!(config = %config_path.display(), "Starting thinglink");

    let identity = resolve_identity(&settings, cli.register).await?;
    let client = DeviceClient::new(identity, settings.client.clone())?;
    install_handlers(&client);
    let announcer = spawn_announcer(client.clone(), cli.firmware_version);

    client.connect().await?;
    wait_for_shutdown().await;

    info!("Shutdown signal received");
    announcer.abort();
    client.shutdown().await;
    Ok(())
}

/// Use the configured credentials, registering over HTTP when they are
/// incomplete or when registration is forced.
async fn resolve_identity(settings: &Settings, force: bool) -> AppResult<DeviceIdentity> {
    if !force && settings.device.is_provisioned() {
        return Ok(settings.device.identity());
    }
    let Some(register) = settings.register.clone() else {
        return Err(AppError::ConfigurationError(
            "device credentials are incomplete and no [register] section is configured".into(),
        ));
    };

    info!(url = %register.url, product_key = %register.product_key, "Registering device");
    let registrar = DeviceRegistrar::new(register, RetryPolicy::default())?;
    let identity = registrar.register().await?;
    info!(
        device_id = %identity.device_id,
        "Registered; store the issued credentials in the [device] section to skip registration"
    );
    Ok(identity)
}

/// Property and service handlers backed by an in-memory property table.
fn install_handlers(client: &DeviceClient) {
    let properties: Arc<Mutex<Map<String, Value>>> = Arc::default();

    let table = Arc::clone(&properties);
    client.set_property_set_handler(move |envelope, request| {
        let table = Arc::clone(&table);
        async move {
            let update: Map<String, Value> = match serde_json::from_str(&request.params) {
                Ok(update) => update,
                Err(e) => return Response::from_error(&SdkError::from(e)),
            };
            info!(trace_id = %envelope.trace_id, keys = update.len(), "Property set");
            table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(update);
            Response::success()
        }
    });

    let table = Arc::clone(&properties);
    client.set_property_get_handler(move |_envelope, request| {
        let table = Arc::clone(&table);
        async move {
            let keys: Vec<String> = serde_json::from_str(&request.params).unwrap_or_default();
            let table = table.lock().unwrap_or_else(|e| e.into_inner());
            let selected: Map<String, Value> = table
                .iter()
                .filter(|(key, _)| keys.is_empty() || keys.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Response::success_with(Value::Object(selected).to_string())
        }
    });

    client.set_service_handler(|envelope, request| async move {
        info!(trace_id = %envelope.trace_id, method = %request.method, "Service invoked");
        match request.method.rsplit('.').next() {
            Some("ping") => Response::success_with(r#"{"pong":true}"#),
            _ => Response::from_error(&SdkError::MethodNotSupported {
                method: request.method.clone(),
            }),
        }
    });

    let reporter = client.clone();
    client.set_config_handler(move |items| {
        let reporter = reporter.clone();
        async move {
            let keys: Vec<ConfigKey> = items.iter().map(|item| item.key.clone()).collect();
            for item in &items {
                info!(key = %item.key.key, version = item.key.version, "Config pushed");
            }
            tokio::spawn(async move {
                if let Err(e) = reporter.post_config_version(&keys).await {
                    warn!(error = %e, "Failed to report config versions");
                }
            });
            Ok(())
        }
    });

    client.set_upgrade_handler(|descriptor| async move {
        warn!(version_code = %descriptor.version_code, "Upgrade requested but not supported");
        Err(SdkError::HandlerFailed {
            reason: "firmware upgrade is not supported by this agent".to_string(),
        })
    });
}

/// Report the firmware version every time the session comes up.
fn spawn_announcer(client: DeviceClient, version: String) -> JoinHandle<()> {
    let mut state = client.subscribe_connection_state();
    tokio::spawn(async move {
        loop {
            let connected = state.borrow_and_update().is_connected();
            if connected {
                if let Err(e) = client.post_device_version(&version).await {
                    warn!(error = %e, "Failed to report device version");
                }
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    })
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }
    if let Err(e) = ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
    }
}
