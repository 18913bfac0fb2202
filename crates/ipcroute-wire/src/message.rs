use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WireError};

/// Which of the three JSON-RPC shapes a message has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Request,
    Response,
    Notification,
}

/// Reserved JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ConnectionBroken,
    ServerException,
}

impl ErrorCode {
    /// Numeric code as carried in `error.code`.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ConnectionBroken => -32604,
            ErrorCode::ServerException => -32000,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32604 => ErrorCode::ConnectionBroken,
            -32000 => ErrorCode::ServerException,
            _ => return None,
        })
    }

    /// Name used as the default `error.message`.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "ParseError",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::MethodNotFound => "MethodNotFound",
            ErrorCode::InvalidParams => "InvalidParams",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ConnectionBroken => "ConnectionBroken",
            ErrorCode::ServerException => "ServerException",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// The reserved code, if `code` is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// One JSON-RPC message.
///
/// `method` is empty when the message has none. `params` and `result` are
/// `None` when absent or JSON `null`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id: i32,
    pub method: String,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub kind: MessageKind,
}

impl Message {
    /// New request with a freshly generated id.
    pub fn request(method: impl Into<String>) -> Self {
        Self::request_with_id(method, generate_id())
    }

    pub fn request_with_id(method: impl Into<String>, id: i32) -> Self {
        Self {
            id,
            method: method.into(),
            kind: MessageKind::Request,
            ..Self::default()
        }
    }

    /// Notification: has a method, id 0.
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kind: MessageKind::Notification,
            ..Self::default()
        }
    }

    /// Successful response to `request`.
    pub fn response(request: &Message, result: impl Into<Value>) -> Self {
        Self {
            id: request.id,
            result: non_null(result.into()),
            kind: MessageKind::Response,
            ..Self::default()
        }
    }

    /// Failed response with the code's name as the error message.
    ///
    /// Without a request the response has id 0 and no method.
    pub fn failed_response(request: Option<&Message>, code: ErrorCode) -> Self {
        Self::failed_response_with_message(request, code, code.as_str())
    }

    pub fn failed_response_with_message(
        request: Option<&Message>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::failed_response_with_error(request, RpcError::new(code, message))
    }

    pub fn failed_response_with_error(request: Option<&Message>, error: RpcError) -> Self {
        Self {
            id: request.map_or(0, |r| r.id),
            method: request.map(|r| r.method.clone()).unwrap_or_default(),
            error: Some(error),
            kind: MessageKind::Response,
            ..Self::default()
        }
    }

    /// `ServerException` response carrying a handler failure.
    pub fn server_exception(
        request: &Message,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        let mut error = RpcError::new(ErrorCode::ServerException, message);
        error.data = Some(detail.into());
        Self::failed_response_with_error(Some(request), error)
    }

    /// Attach `params`. JSON `null` clears them.
    pub fn with_params(mut self, params: impl Into<Value>) -> Self {
        self.params = non_null(params.into());
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MessageKind::Notification
    }

    /// True for a response carrying `code`.
    pub fn is_error(&self, code: ErrorCode) -> bool {
        self.error.as_ref().is_some_and(|e| e.is(code))
    }

    /// Decode `params` into `T`; absent params decode from `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_member("params", self.params.as_ref())
    }

    /// Decode `result` into `T`; an absent result decodes from `null`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_member("result", self.result.as_ref())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::serializer::serialize(self))
    }
}

fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}

fn decode_member<T: DeserializeOwned>(field: &'static str, value: Option<&Value>) -> Result<T> {
    let value = value.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| WireError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// Next request id: positive, never 0.
///
/// Ids come from a process-wide counter seeded with the wall-clock
/// milliseconds, so two processes started at different times rarely overlap.
pub fn generate_id() -> i32 {
    static NEXT_ID: OnceLock<AtomicU32> = OnceLock::new();
    let counter = NEXT_ID.get_or_init(|| {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(1);
        AtomicU32::new(millis)
    });
    loop {
        let id = (counter.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF) as i32;
        if id != 0 {
            return id;
        }
    }
}
