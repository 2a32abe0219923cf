//! TSL envelope codec.
//!
//! Requests travel as `{version, traceId, method, params}` and responses as
//! `{version, traceId, code, message, data}`. `params` must be a JSON object or
//! array. `data` is embedded as JSON when it parses and as a JSON string
//! otherwise. On decode both fields accept either raw JSON or a JSON-encoded
//! string.

use crate::{SdkError, SdkResult, SUCCESS_CODE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Protocol version stamped on outbound envelopes
pub const DEFAULT_VERSION: &str = "1.0.1";
/// Message attached to successful responses
pub const SUCCESS_MESSAGE: &str = "success";
/// Params used when a request carries none
pub const EMPTY_PARAMS: &str = "{}";

/// Correlation header shared by requests and responses
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub version: String,
    /// Correlation key, echoed by the peer on the reply
    pub trace_id: String,
    /// Addressed device. Filled from the topic on inbound messages and
    /// defaulted to the engine's own device on outbound ones.
    pub device_id: String,
}

impl Envelope {
    /// Envelope with the default version and a fresh trace id.
    pub fn new() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            trace_id: new_trace_id(),
            device_id: String::new(),
        }
    }

    /// Envelope addressed to another device (e.g. a sub-device).
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::new()
        }
    }
}

/// Generate a trace id for an outbound call.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Method invocation carried by a request envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Raw JSON text of the params
    pub params: String,
}

impl Request {
    pub fn new(method: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: params.into(),
        }
    }

    /// Request whose params are serialized from `value`.
    pub fn with_json<T: Serialize>(method: impl Into<String>, value: &T) -> SdkResult<Self> {
        let params = serde_json::to_string(value).map_err(|e| SdkError::SerializeFailed {
            reason: e.to_string(),
        })?;
        Ok(Self::new(method, params))
    }
}

/// Outcome carried by a response envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: String,
    pub message: String,
    /// Raw JSON text or plain string; `None` when absent
    pub data: Option<String>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            message: SUCCESS_MESSAGE.to_string(),
            data: None,
        }
    }

    pub fn success_with(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::success()
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn from_error(err: &SdkError) -> Self {
        Self::failure(err.code(), err.to_string())
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Decode `data` into `T`. Absent data decodes as JSON `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> SdkResult<T> {
        let raw = self.data.as_deref().unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }

    /// Convert a failure response into an error.
    pub fn into_result(self) -> SdkResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SdkError::Remote {
                code: self.code,
                message: self.message,
            })
        }
    }
}

impl From<SdkResult<()>> for Response {
    fn from(result: SdkResult<()>) -> Self {
        match result {
            Ok(()) => Response::success(),
            Err(e) => Response::from_error(&e),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestFrame<'a> {
    version: &'a str,
    trace_id: &'a str,
    method: &'a str,
    params: &'a RawValue,
}

#[derive(Serialize)]
#[serde(untagged)]
enum DataField<'a> {
    Json(&'a RawValue),
    Text(&'a str),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseFrame<'a> {
    version: &'a str,
    trace_id: &'a str,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<DataField<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame<'a> {
    #[serde(default, borrow)]
    version: Option<&'a RawValue>,
    #[serde(default, borrow)]
    trace_id: Option<&'a RawValue>,
    #[serde(default, borrow)]
    method: Option<&'a RawValue>,
    #[serde(default, borrow)]
    params: Option<&'a RawValue>,
    #[serde(default, borrow)]
    code: Option<&'a RawValue>,
    #[serde(default, borrow)]
    message: Option<&'a RawValue>,
    #[serde(default, borrow)]
    data: Option<&'a RawValue>,
}

fn is_structured(raw: &RawValue) -> bool {
    raw.get().trim_start().starts_with(['{', '['])
}

/// Text of a raw field: JSON strings are unwrapped, `null` is absent and
/// everything else keeps its JSON text.
fn field_text(raw: Option<&RawValue>) -> Option<String> {
    let text = raw?.get().trim();
    if text == "null" {
        return None;
    }
    if text.starts_with('"') {
        return serde_json::from_str::<String>(text).ok();
    }
    Some(text.to_string())
}

fn parse_frame(payload: &[u8]) -> SdkResult<InboundFrame<'_>> {
    let text = std::str::from_utf8(payload).map_err(|e| SdkError::DeserializeFailed {
        reason: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Err(SdkError::DeserializeFailed {
            reason: "empty payload".to_string(),
        });
    }
    if !text.trim_start().starts_with('{') {
        return Err(SdkError::DeserializeFailed {
            reason: "payload is not a JSON object".to_string(),
        });
    }
    Ok(serde_json::from_str(text)?)
}

fn decode_envelope(frame: &InboundFrame<'_>) -> Envelope {
    Envelope {
        version: field_text(frame.version).unwrap_or_default(),
        trace_id: field_text(frame.trace_id).unwrap_or_default(),
        device_id: String::new(),
    }
}

/// Encode a request envelope.
///
/// Fails with `SerializeFailed` unless `params` is a JSON object or array;
/// empty params are sent as `{}`.
pub fn encode_request(envelope: &Envelope, request: &Request) -> SdkResult<Vec<u8>> {
    let params = if request.params.trim().is_empty() {
        EMPTY_PARAMS
    } else {
        request.params.as_str()
    };
    let params: &RawValue = serde_json::from_str(params).map_err(|e| SdkError::SerializeFailed {
        reason: format!("params are not valid JSON: {e}"),
    })?;
    if !is_structured(params) {
        return Err(SdkError::SerializeFailed {
            reason: "params must be a JSON object or array".to_string(),
        });
    }

    let frame = RequestFrame {
        version: &envelope.version,
        trace_id: &envelope.trace_id,
        method: &request.method,
        params,
    };
    serde_json::to_vec(&frame).map_err(|e| SdkError::SerializeFailed {
        reason: e.to_string(),
    })
}

/// Encode a response envelope. `data` is omitted when absent or empty.
pub fn encode_response(envelope: &Envelope, response: &Response) -> SdkResult<Vec<u8>> {
    let data = response
        .data
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(|d| match serde_json::from_str::<&RawValue>(d) {
            Ok(raw) => DataField::Json(raw),
            Err(_) => DataField::Text(d),
        });

    let frame = ResponseFrame {
        version: &envelope.version,
        trace_id: &envelope.trace_id,
        code: &response.code,
        message: &response.message,
        data,
    };
    serde_json::to_vec(&frame).map_err(|e| SdkError::SerializeFailed {
        reason: e.to_string(),
    })
}

/// Decode a request envelope. Missing `params` default to `{}` and a missing
/// `method` to the empty string.
pub fn decode_request(payload: &[u8]) -> SdkResult<(Envelope, Request)> {
    let frame = parse_frame(payload)?;
    let request = Request {
        method: field_text(frame.method).unwrap_or_default(),
        params: field_text(frame.params).unwrap_or_else(|| EMPTY_PARAMS.to_string()),
    };
    Ok((decode_envelope(&frame), request))
}

/// Decode a response envelope. A missing `code` is reported as a
/// deserialize failure.
pub fn decode_response(payload: &[u8]) -> SdkResult<(Envelope, Response)> {
    let frame = parse_frame(payload)?;
    let code = field_text(frame.code).unwrap_or_else(|| {
        SdkError::DeserializeFailed {
            reason: String::new(),
        }
        .code()
    });
    let response = Response {
        code,
        message: field_text(frame.message).unwrap_or_default(),
        data: field_text(frame.data),
    };
    Ok((decode_envelope(&frame), response))
}
