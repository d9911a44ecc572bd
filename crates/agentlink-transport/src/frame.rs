//! JSON-RPC 2.0 frame types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentlink_core::{Error, Result, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound call.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> Request<'a> {
    #[must_use]
    pub const fn new(id: &'a str, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Reply to a server→client request.
#[derive(Debug, Serialize)]
pub struct Response<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a RpcError>,
}

impl<'a> Response<'a> {
    #[must_use]
    pub fn new(id: &'a Value, outcome: &'a std::result::Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
            error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Server→client request awaiting a reply.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Reply to one of our calls.
    Response {
        id: Value,
        outcome: std::result::Result<Value, RpcError>,
    },
    Notification { method: String, params: Value },
}

impl Incoming {
    /// Classify a frame body.
    ///
    /// # Errors
    /// Fails on invalid JSON or a frame with neither `id` nor `method`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw: RawFrame = serde_json::from_slice(body)?;
        let params = raw.params.unwrap_or(Value::Null);
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (Some(id), None) => {
                let outcome = match raw.error {
                    Some(err) => Err(err),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (None, None) => Err(Error::Protocol("frame has neither id nor method".into())),
        }
    }
}

/// Correlation key for a response id. Ids we issue are strings; numeric
/// ids from other peers are compared by their JSON text.
#[must_use]
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
