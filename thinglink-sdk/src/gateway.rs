use crate::{
    tsl::{
        envelope::EMPTY_PARAMS,
        methods::{SUB_ADD, SUB_CONNECT, SUB_DEL, SUB_DISCONNECT, SUB_GET, THING_PREFIX},
        Request, Response, SubDeviceRecord,
    },
    DeviceClient, SdkResult,
};
use tracing::debug;

/// Gateway-side management of sub-devices.
///
/// Lifecycle calls are fire-and-forget; listing waits for the reply.
#[derive(Clone)]
pub struct SubDeviceManager {
    client: DeviceClient,
}

impl SubDeviceManager {
    pub fn new(client: DeviceClient) -> Self {
        Self { client }
    }

    async fn lifecycle(&self, method: &str, record: &SubDeviceRecord) -> SdkResult<()> {
        debug!(method, device_id = %record.0.device_id, "Sub-device lifecycle");
        let request = Request::with_json(method, record)?;
        self.client
            .publish_call(self.client.new_envelope(), request, THING_PREFIX)
            .await
    }

    /// Mark a sub-device online
    pub async fn online_sub_device(&self, record: &SubDeviceRecord) -> SdkResult<()> {
        self.lifecycle(SUB_CONNECT, record).await
    }

    /// Mark a sub-device offline
    pub async fn offline_sub_device(&self, record: &SubDeviceRecord) -> SdkResult<()> {
        self.lifecycle(SUB_DISCONNECT, record).await
    }

    /// Bind a sub-device to this gateway
    pub async fn add_sub_device(&self, record: &SubDeviceRecord) -> SdkResult<()> {
        self.lifecycle(SUB_ADD, record).await
    }

    /// Unbind a sub-device from this gateway
    pub async fn remove_sub_device(&self, record: &SubDeviceRecord) -> SdkResult<()> {
        self.lifecycle(SUB_DEL, record).await
    }

    /// Query bound sub-devices, returning the platform reply as is.
    pub async fn list_sub_devices_raw(&self) -> Response {
        self.client
            .call_and_wait(
                self.client.new_envelope(),
                Request::new(SUB_GET, EMPTY_PARAMS),
                THING_PREFIX,
                None,
            )
            .await
    }

    /// Query bound sub-devices. A failed reply surfaces as `SdkError::Remote`
    /// (or the local error the reply carries).
    pub async fn list_sub_devices(&self) -> SdkResult<Vec<SubDeviceRecord>> {
        let response = self.list_sub_devices_raw().await.into_result()?;
        if response.data.is_none() {
            return Ok(Vec::new());
        }
        response.data_as()
    }
}
