use super::DeviceClient;
use crate::{
    gateway::SubDeviceManager,
    registry::PendingGuard,
    tsl::{
        encode_request,
        methods::{
            UP_BASIC_POST, UP_CONFIG_POST, UP_EVENT_PREFIX, UP_PROPERTY_GET, UP_PROPERTY_POST,
            UP_SERVICE_PREFIX,
        },
        new_trace_id, qualify_method, ConfigKey, Envelope, Request, Response, Topics,
    },
    SdkError, SdkResult,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

impl DeviceClient {
    /// Envelope addressed to this device, with a fresh trace id.
    pub fn new_envelope(&self) -> Envelope {
        Envelope {
            version: self.inner.config.engine.version.clone(),
            trace_id: new_trace_id(),
            device_id: self.inner.identity.device_id.clone(),
        }
    }

    fn fill_envelope(&self, envelope: &mut Envelope) {
        if envelope.trace_id.is_empty() {
            envelope.trace_id = new_trace_id();
        }
        if envelope.version.is_empty() {
            envelope.version = self.inner.config.engine.version.clone();
        }
        if envelope.device_id.is_empty() {
            envelope.device_id = self.inner.identity.device_id.clone();
        }
    }

    /// Fire-and-forget upstream call. The method is qualified with
    /// `method_prefix` and the trace id doubles as the topic message id.
    pub async fn publish_call(
        &self,
        mut envelope: Envelope,
        request: Request,
        method_prefix: &str,
    ) -> SdkResult<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        self.fill_envelope(&mut envelope);
        let request = Request {
            method: qualify_method(method_prefix, &request.method),
            params: request.params,
        };
        let payload = encode_request(&envelope, &request)?;
        let topic = Topics::upstream_request_topic(
            &self.inner.identity.product_key,
            &envelope.device_id,
            &envelope.trace_id,
        );
        debug!(trace_id = %envelope.trace_id, method = %request.method, "Upstream call");
        self.inner
            .publish(&topic, payload, self.inner.qos, false)
            .await
    }

    /// Upstream call that waits for the platform's reply.
    ///
    /// Never returns an error: every failure (not connected, publish failure,
    /// timeout, shutdown) comes back as a failed [`Response`] carrying the
    /// SDK error code. `timeout` defaults to the configured call timeout.
    pub async fn call_and_wait(
        &self,
        mut envelope: Envelope,
        request: Request,
        method_prefix: &str,
        timeout: Option<Duration>,
    ) -> Response {
        if !self.inner.is_accepting() {
            return Response::from_error(&SdkError::Shutdown);
        }
        if !self.is_connected() {
            return Response::from_error(&SdkError::NotConnected);
        }
        self.fill_envelope(&mut envelope);

        let _permit = match Arc::clone(&self.inner.call_pool).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Response::from_error(&SdkError::Shutdown),
        };

        let trace_id = envelope.trace_id.clone();
        let timeout = timeout.unwrap_or_else(|| self.inner.config.engine.call_timeout());
        let deadline = Instant::now() + timeout;
        let mut rx = match self.inner.registry.register(&trace_id, deadline) {
            Ok(rx) => rx,
            Err(e) => return Response::from_error(&e),
        };
        let _guard = PendingGuard::new(Arc::clone(&self.inner.registry), trace_id.clone());

        if let Err(e) = self.publish_call(envelope, request, method_prefix).await {
            self.inner.registry.remove(&trace_id);
            return Response::from_error(&e);
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::from_error(&SdkError::Shutdown),
            Err(_) => {
                debug!(trace_id = %trace_id, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                // A reply that won the race is still delivered through rx
                self.inner.registry.expire(&trace_id);
                rx.await
                    .unwrap_or_else(|_| Response::from_error(&SdkError::Timeout { trace_id }))
            }
        }
    }

    /// Report the firmware version of this device.
    pub async fn post_device_version(&self, version: &str) -> SdkResult<()> {
        let request = Request::with_json("", &json!({ "version": version }))?;
        self.publish_call(self.new_envelope(), request, UP_BASIC_POST)
            .await
    }

    /// Report the display name of this device.
    pub async fn post_device_name(&self, name: &str) -> SdkResult<()> {
        let request = Request::with_json("", &json!({ "deviceName": name }))?;
        self.publish_call(self.new_envelope(), request, UP_BASIC_POST)
            .await
    }

    /// Report which configuration versions the device currently holds.
    pub async fn post_config_version(&self, keys: &[ConfigKey]) -> SdkResult<()> {
        let request = Request::with_json("", &keys)?;
        self.publish_call(self.new_envelope(), request, UP_CONFIG_POST)
            .await
    }

    pub async fn post_property(&self, params: impl Into<String>) -> SdkResult<()> {
        self.publish_call(
            self.new_envelope(),
            Request::new("", params),
            UP_PROPERTY_POST,
        )
        .await
    }

    /// Ask the platform for property values.
    pub async fn property_get(&self, params: impl Into<String>) -> Response {
        self.call_and_wait(
            self.new_envelope(),
            Request::new("", params),
            UP_PROPERTY_GET,
            None,
        )
        .await
    }

    pub async fn post_event(&self, event_id: &str, params: impl Into<String>) -> SdkResult<()> {
        self.publish_call(
            self.new_envelope(),
            Request::new(event_id, params),
            UP_EVENT_PREFIX,
        )
        .await
    }

    /// Invoke a platform service and wait for its result.
    pub async fn service_call(&self, service_id: &str, params: impl Into<String>) -> Response {
        self.call_and_wait(
            self.new_envelope(),
            Request::new(service_id, params),
            UP_SERVICE_PREFIX,
            None,
        )
        .await
    }

    /// Sub-device management for gateway devices.
    pub fn sub_devices(&self) -> SubDeviceManager {
        SubDeviceManager::new(self.clone())
    }
}
