use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClusterError, RpcError};

/// Body of a `POST /rpc` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub module: String,
    pub method: String,
    /// Handler arguments. Absent on the wire means `null`.
    #[serde(default)]
    pub data: Value,
}

/// Body of a `POST /rpc` response: either `{module, method, data}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(module: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            module: Some(module.into()),
            method: Some(method.into()),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: RpcError) -> Self {
        Self {
            module: None,
            method: None,
            data: None,
            error: Some(error),
        }
    }

    /// The call outcome this response carries. An `error` field wins over `data`.
    pub fn into_result(self) -> Result<Value, ClusterError> {
        match self.error {
            Some(error) => Err(ClusterError::Remote(error)),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Decode a 200 response body. An empty body is a successful `null`.
pub fn decode_response(body: &[u8]) -> Result<Value, ClusterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    let response: RpcResponse =
        serde_json::from_slice(body).map_err(|e| ClusterError::InvalidPayload {
            reason: "malformed rpc response".into(),
            source: Some(Box::new(e)),
        })?;
    response.into_result()
}

/// Parse an inbound request body.
pub fn decode_request(body: &[u8]) -> Result<RpcRequest, ClusterError> {
    serde_json::from_slice(body).map_err(|e| ClusterError::InvalidPayload {
        reason: format!("malformed rpc request: {e}"),
        source: Some(Box::new(e)),
    })
}
