use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::PeerAddress;

/// Code used on the wire for local-only errors that reach the RPC boundary.
pub const INTERNAL_CODE: &str = "Internal";

/// Structured error carried across the network as `{"code": ..., "message": ...}`.
///
/// Handlers return this for domain errors; the code and message reach the
/// remote caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
        }
    }

    /// An error with a code and no diagnostic message.
    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => f.write_str(&self.code),
        }
    }
}

impl std::error::Error for RpcError {}

/// Errors that can occur in the cluster system.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no instance available for service {service_id}")]
    NoInstanceAvailable { service_id: String },

    #[error("node unavailable: {address}")]
    NodeNotAvailable {
        address: PeerAddress,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("connection pool for service {service_id} has {max_pending} pending requests")]
    PoolSaturated {
        service_id: String,
        max_pending: usize,
    },

    #[error("unexpected status {status} from {address}")]
    UnexpectedStatus { address: PeerAddress, status: u16 },

    #[error("invalid payload: {reason}")]
    InvalidPayload {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("no handler for {module}/{method}")]
    NoHandler { module: String, method: String },

    #[error("remote error {0}")]
    Remote(#[from] RpcError),

    #[error("handler {module}/{method} panicked: {info}")]
    HandlerPanicked {
        module: String,
        method: String,
        info: String,
    },

    #[error("duplicate handler registered for {key}")]
    DuplicateHandler { key: String },

    #[error("coordination service did not connect within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("no non-loopback IPv4 address found on any interface")]
    NoLocalAddress,

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("coordination error: {reason}")]
    Coordination {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("rpc listener error: {0}")]
    Listener(#[from] std::io::Error),

    #[error("cluster is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Stable code callers branch on. Domain errors keep the handler's code.
    pub fn code(&self) -> &str {
        match self {
            ClusterError::NoInstanceAvailable { .. } => "NoInstanceAvailable",
            ClusterError::NodeNotAvailable { .. } => "NodeNotAvailable",
            ClusterError::PoolSaturated { .. } => "PoolSaturated",
            ClusterError::UnexpectedStatus { .. } => "UnexpectedStatus",
            ClusterError::InvalidPayload { .. } => "InvalidPayload",
            ClusterError::NoHandler { .. } => "NoHandler",
            ClusterError::Remote(err) => &err.code,
            ClusterError::HandlerPanicked { .. }
            | ClusterError::DuplicateHandler { .. }
            | ClusterError::ConnectTimeout { .. }
            | ClusterError::NoLocalAddress
            | ClusterError::NodeExists { .. }
            | ClusterError::Coordination { .. }
            | ClusterError::InvalidConfig { .. }
            | ClusterError::Listener(_)
            | ClusterError::ShuttingDown => INTERNAL_CODE,
        }
    }

    /// Diagnostic message, if any. Domain errors pass theirs through as-is.
    pub fn message(&self) -> Option<String> {
        match self {
            ClusterError::Remote(err) => err.message.clone(),
            other => Some(other.to_string()),
        }
    }

    /// Convert into the wire error envelope.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code().to_string(),
            message: self.message(),
        }
    }

    pub(crate) fn invalid_payload(reason: impl Into<String>) -> Self {
        ClusterError::InvalidPayload {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn coordination(reason: impl Into<String>) -> Self {
        ClusterError::Coordination {
            reason: reason.into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ClusterError::NoInstanceAvailable {
            service_id: "901".into(),
        };
        assert_eq!(err.to_string(), "no instance available for service 901");

        let err = ClusterError::NoHandler {
            module: "commons".into(),
            method: "time".into(),
        };
        assert_eq!(err.to_string(), "no handler for commons/time");

        let err = ClusterError::Remote(RpcError::new("998", "x"));
        assert_eq!(err.to_string(), "remote error 998: x");
    }

    #[test]
    fn codes_are_stable() {
        let addr = PeerAddress::new("10.0.0.1", 9000);
        assert_eq!(
            ClusterError::NodeNotAvailable {
                address: addr.clone(),
                source: None
            }
            .code(),
            "NodeNotAvailable"
        );
        assert_eq!(
            ClusterError::UnexpectedStatus {
                address: addr,
                status: 500
            }
            .code(),
            "UnexpectedStatus"
        );
        assert_eq!(
            ClusterError::invalid_payload("bad json").code(),
            "InvalidPayload"
        );
        assert_eq!(ClusterError::ShuttingDown.code(), INTERNAL_CODE);
        assert_eq!(
            ClusterError::HandlerPanicked {
                module: "test".into(),
                method: "boom".into(),
                info: "index out of bounds".into(),
            }
            .code(),
            INTERNAL_CODE
        );
    }

    #[test]
    fn remote_error_passes_through_verbatim() {
        let err = ClusterError::Remote(RpcError::new("998", "x"));
        assert_eq!(err.code(), "998");
        assert_eq!(err.to_rpc_error(), RpcError::new("998", "x"));

        let err = ClusterError::Remote(RpcError::from_code("1001"));
        assert_eq!(err.to_rpc_error().message, None);
    }

    #[test]
    fn rpc_error_omits_missing_message() {
        let json = serde_json::to_string(&RpcError::from_code("NoHandler")).unwrap();
        assert_eq!(json, r#"{"code":"NoHandler"}"#);

        let parsed: RpcError = serde_json::from_str(r#"{"code":"998"}"#).unwrap();
        assert_eq!(parsed, RpcError::from_code("998"));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClusterError>();
    }
}
