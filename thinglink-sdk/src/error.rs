use thiserror::Error;

/// Response code reported for a successful operation.
pub const SUCCESS_CODE: &str = "000000";

/// Base of the SDK segment of the response code space.
///
/// SDK errors are reported as `SDK_CODE_BASE + offset`. The range
/// `171000..=179999` is reserved for device-originated application codes.
pub const SDK_CODE_BASE: u32 = 170_000;

/// Errors raised by the device SDK.
///
/// Every variant maps to a stable response code (see [`SdkError::code`]) so a
/// failure can always be reported to the peer or to a synchronous caller as a
/// [`Response`](crate::Response) instead of surfacing as a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// Envelope or payload could not be encoded
    #[error("Serialization failed: {reason}")]
    SerializeFailed { reason: String },

    /// Transport refused or failed to publish a message
    #[error("Failed to publish message to '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },

    /// No reply arrived before the call deadline
    #[error("Request timeout: {trace_id}")]
    Timeout { trace_id: String },

    /// Inbound payload could not be decoded
    #[error("Deserialization failed: {reason}")]
    DeserializeFailed { reason: String },

    /// No handler is registered for the requested method
    #[error("Method not supported: {method}")]
    MethodNotSupported { method: String },

    /// Topic does not have the expected `/sys/{pk}/{did}/{dir}/{kind}/{id}` shape
    #[error("Malformed topic: '{topic}'")]
    MalformedTopic { topic: String },

    /// Not connected to the broker
    #[error("Not connected to broker - operation requires active connection")]
    NotConnected,

    /// Transport reported an unexpected failure
    #[error("Transport error: {reason}")]
    TransportException { reason: String },

    /// HTTP device registration failed
    #[error("Device registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// Engine shut down while the operation was outstanding
    #[error("Engine is shutting down")]
    Shutdown,

    /// Publish rejected locally because of an invalid QoS level
    #[error("Invalid QoS level {qos}, expected 0, 1 or 2")]
    BadQos { qos: u8 },

    /// A pending call with the same trace id is already registered
    #[error("Trace id '{trace_id}' already has a pending call")]
    DuplicateTraceId { trace_id: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// A config-push or upgrade handler reported a failure
    #[error("Handler failed: {reason}")]
    HandlerFailed { reason: String },

    /// Failure code returned by the platform for an upstream call
    #[error("Platform returned {code}: {message}")]
    Remote { code: String, message: String },
}

impl SdkError {
    /// Offset of this error inside the SDK code segment.
    ///
    /// Returns `None` for [`SdkError::Remote`], which carries the platform's own code.
    pub fn code_offset(&self) -> Option<u32> {
        let offset = match self {
            SdkError::SerializeFailed { .. } => 1,
            SdkError::PublishFailed { .. } => 2,
            SdkError::Timeout { .. } => 4,
            SdkError::DeserializeFailed { .. } => 5,
            SdkError::MethodNotSupported { .. } => 6,
            SdkError::MalformedTopic { .. } => 7,
            SdkError::NotConnected => 8,
            SdkError::TransportException { .. } => 9,
            SdkError::RegistrationFailed { .. } => 10,
            SdkError::Shutdown => 12,
            SdkError::BadQos { .. } => 13,
            SdkError::DuplicateTraceId { .. } => 14,
            SdkError::ConfigurationError { .. } => 15,
            SdkError::HandlerFailed { .. } => 16,
            SdkError::Remote { .. } => return None,
        };
        Some(offset)
    }

    /// Wire response code for this error.
    pub fn code(&self) -> String {
        match self {
            SdkError::Remote { code, .. } => code.clone(),
            other => (SDK_CODE_BASE + other.code_offset().unwrap_or(0)).to_string(),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::DeserializeFailed {
            reason: err.to_string(),
        }
    }
}
