use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod codec;
mod connection;
mod transport;

pub use codec::{read_message, write_message, DEFAULT_MAX_MESSAGE_SIZE};
pub use connection::{
    Connection, ConnectionHandlers, ConnectionOptions, ConnectionOptionsBuilder,
};
pub use transport::{
    GrpcTransport, MessageReceiver, MessageSender, PipeTransport, StdioTransport, Transport,
};

pub mod proto {
    tonic::include_proto!("lsplint.rpc");
}

pub const JSONRPC_VERSION: &str = "2.0";

/// A single JSON-RPC 2.0 message. One struct covers all three wire kinds
/// (request, notification, response); [`Message::kind`] tells them apart.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Value, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            _ => MessageKind::Response,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const ERROR_CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_CODE_INTERNAL: i64 = -32603;

impl ResponseError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: ERROR_CODE_METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ERROR_CODE_INTERNAL,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message of {size} bytes exceeds the {limit} byte ceiling")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("message header is missing Content-Length")]
    MissingContentLength,

    #[error("unparseable message header: {0:?}")]
    InvalidHeader(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("remote error: {0}")]
    Remote(ResponseError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Oversize payloads fail the call they belong to, never the connection.
    pub fn is_call_scoped(&self) -> bool {
        matches!(
            self,
            RpcError::MessageTooLarge { .. } | RpcError::Timeout | RpcError::Remote(_)
        )
    }
}
