//! RPC error codes
//!
//! The JSON-RPC 2.0 protocol codes plus the handful of Bitcoin Core codes
//! that peer and ban commands report.

use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    /// Bad value for a named parameter: unknown setting path or list (-8)
    InvalidParameter,
    /// Subnet already banned (-23)
    NodeAlreadyAdded,
    /// Unban of a subnet that is not banned (-24)
    NodeNotAdded,
    /// Disconnect target not among live peers (-29)
    NodeNotConnected,
    /// Unparsable IP or CIDR subnet (-30)
    InvalidIpOrSubnet,
}

impl RpcErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InvalidParameter => -8,
            RpcErrorCode::NodeAlreadyAdded => -23,
            RpcErrorCode::NodeNotAdded => -24,
            RpcErrorCode::NodeNotConnected => -29,
            RpcErrorCode::InvalidIpOrSubnet => -30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParameter, message)
    }

    pub fn invalid_subnet(subnet: &str) -> Self {
        Self::new(
            RpcErrorCode::InvalidIpOrSubnet,
            format!("Error: Invalid IP/Subnet: {}", subnet),
        )
    }

    pub fn already_banned() -> Self {
        Self::new(RpcErrorCode::NodeAlreadyAdded, "Error: IP/Subnet already banned")
    }

    pub fn not_banned() -> Self {
        Self::new(
            RpcErrorCode::NodeNotAdded,
            "Error: Unban failed. Requested address/subnet was not previously manually banned.",
        )
    }

    pub fn node_not_connected() -> Self {
        Self::new(
            RpcErrorCode::NodeNotConnected,
            "Node not found in connected nodes",
        )
    }

    /// JSON-RPC 2.0 error response carrying `id`
    pub fn to_json(&self, id: Option<Value>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.code.code(),
                "message": self.message,
            },
            "id": id
        })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for RpcError {}

pub type RpcResult<T> = Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}
