//! JSON-RPC 2.0 frame codec
//!
//! A [`Frame`] is one complete JSON-RPC 2.0 message: a request, a
//! notification, a response, or an error response. [`Frame::decode`] turns a
//! raw JSON string into the tagged union and [`Frame::encode`] produces
//! canonical UTF-8 JSON with no trailing newline; transports add their own
//! framing (e.g. a newline for stdio).
//!
//! Decoding is tolerant of unknown fields for forward compatibility, and
//! request IDs survive a round trip byte-for-byte, including the distinction
//! between string and integer IDs. Values inside `params` and `result` are
//! carried as [`serde_json::Value`] and never coerced to a narrower numeric
//! type.
//!
//! Setting `XZMCP_LENIENT_FRAMES=1` disables the optional strict checks
//! (the `jsonrpc` version marker and the exactly-one-of-`result`/`error`
//! rule); the required structural shape is always enforced.

use serde::{Deserialize, Serialize};

use crate::error::{Result, XzmcpError};

/// Environment variable that switches [`Frame::decode`] to lenient mode.
pub const LENIENT_FRAMES_ENV: &str = "XZMCP_LENIENT_FRAMES";

/// A JSON-RPC request ID.
///
/// Opaque to callers; the correlator generates integer IDs, but servers may
/// echo IDs of either type in responses and use string IDs in their own
/// requests. The wire type (string vs integer) is preserved exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer ID
    Number(i64),
    /// String ID
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC 2.0 error object (the `error` member of an error response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// JSON-RPC error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One complete JSON-RPC 2.0 message.
///
/// The four shapes share `jsonrpc = "2.0"`; classification follows the
/// presence of `method`, `id`, `result`, and `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client- or server-originated request; `id` is unique per connection.
    Request {
        /// Request ID, preserved byte-for-byte in the response
        id: RequestId,
        /// Method name
        method: String,
        /// Optional parameters
        params: Option<serde_json::Value>,
    },
    /// Fire-and-forget message; no `id`, no response expected.
    Notification {
        /// Method name
        method: String,
        /// Optional parameters
        params: Option<serde_json::Value>,
    },
    /// Successful response to a prior request.
    Response {
        /// ID of the originating request
        id: RequestId,
        /// Result payload (may be `Value::Null`)
        result: serde_json::Value,
    },
    /// Error response to a prior request. `id` is `None` when the server
    /// could not associate the failure with a request (e.g. a parse error).
    Error {
        /// ID of the originating request, if known
        id: Option<RequestId>,
        /// The error object
        error: ErrorObject,
    },
}

impl Frame {
    /// Build a request frame.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Frame::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a notification frame.
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Frame::Notification {
            method: method.into(),
            params,
        }
    }

    /// Encode this frame as canonical JSON (UTF-8, no trailing newline).
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            Frame::Request { id, method, params } => {
                let mut obj = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                });
                if let Some(p) = params {
                    obj["params"] = p.clone();
                }
                obj
            }
            Frame::Notification { method, params } => {
                let mut obj = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": method,
                });
                if let Some(p) = params {
                    obj["params"] = p.clone();
                }
                obj
            }
            Frame::Response { id, result } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Frame::Error { id, error } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        };
        serde_json::to_string(&value).map_err(|e| XzmcpError::Serialization(e).into())
    }

    /// Decode a raw JSON string into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`XzmcpError::Parse`] on malformed JSON, a missing or
    /// non-`"2.0"` `jsonrpc` marker, an unclassifiable shape, or a response
    /// that does not carry exactly one of `result`/`error`. The strict
    /// checks are skipped when [`LENIENT_FRAMES_ENV`] is set to `1`.
    pub fn decode(raw: &str) -> Result<Frame> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| XzmcpError::Parse(format!("malformed JSON: {e}")))?;

        let lenient = lenient_mode();
        match value.get("jsonrpc").and_then(|v| v.as_str()) {
            Some("2.0") => {}
            other => {
                if lenient {
                    tracing::warn!("lenient decode: jsonrpc marker is {other:?}");
                } else {
                    return Err(XzmcpError::Parse(format!(
                        "jsonrpc field missing or not \"2.0\" (got {other:?})"
                    ))
                    .into());
                }
            }
        }

        let id = parse_id(value.get("id"))?;
        let method = value.get("method").and_then(|m| m.as_str());
        let has_result = value.get("result").is_some();
        let has_error = value.get("error").is_some();

        if let Some(method) = method {
            // Request or notification. A server-originated request carries
            // an id; a notification does not.
            let params = value.get("params").cloned();
            return Ok(match id {
                Some(id) => Frame::Request {
                    id,
                    method: method.to_string(),
                    params,
                },
                None => Frame::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        // No method: must be a response of one of the two kinds.
        if has_result && has_error && !lenient {
            return Err(
                XzmcpError::Parse("response carries both result and error".to_string()).into(),
            );
        }

        if has_error {
            let error: ErrorObject = serde_json::from_value(value["error"].clone())
                .map_err(|e| XzmcpError::Parse(format!("malformed error object: {e}")))?;
            return Ok(Frame::Error { id, error });
        }

        if has_result {
            let id = id.ok_or_else(|| {
                XzmcpError::Parse("response is missing an id".to_string())
            })?;
            return Ok(Frame::Response {
                id,
                result: value["result"].clone(),
            });
        }

        Err(XzmcpError::Parse(
            "response carries neither result nor error".to_string(),
        )
        .into())
    }
}

/// Parse the `id` member. Absent and `null` both mean "no id"; anything
/// other than a string or integer is a parse error.
fn parse_id(id: Option<&serde_json::Value>) -> Result<Option<RequestId>> {
    match id {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| XzmcpError::Parse(format!("non-integer id: {n}")).into()),
        Some(serde_json::Value::String(s)) => Ok(Some(RequestId::String(s.clone()))),
        Some(other) => Err(XzmcpError::Parse(format!("invalid id type: {other}")).into()),
    }
}

fn lenient_mode() -> bool {
    std::env::var(LENIENT_FRAMES_ENV)
        .map(|v| v == "1")
        .unwrap_or(false)
}
