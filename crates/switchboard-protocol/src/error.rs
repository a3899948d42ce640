//! Per-request error values as seen by callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kind of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// Connection lost, timed out, or the reply could not be decoded.
    Transport,
    /// The node stopped before processing the request; always safe to reissue.
    DispatcherShutdown,
    /// Not authenticated.
    Authn,
    /// Not authorized.
    Authz,
    /// Any other server-declared code, passed through untouched.
    Server(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Transport => "transport",
            ErrorCode::DispatcherShutdown => "dispatcher_shutdown",
            ErrorCode::Authn => "authn",
            ErrorCode::Authz => "authz",
            ErrorCode::Server(code) => code,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "transport" => ErrorCode::Transport,
            "dispatcher_shutdown" => ErrorCode::DispatcherShutdown,
            "authn" => ErrorCode::Authn,
            "authz" => ErrorCode::Authz,
            _ => ErrorCode::Server(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call: code, human readable message, optional structured detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Transport, message)
    }

    pub fn connection_lost() -> Self {
        Self::transport("Connection lost")
    }

    pub fn timed_out() -> Self {
        Self::transport("Request timed out")
    }

    pub fn dispatcher_shutdown() -> Self {
        Self::new(ErrorCode::DispatcherShutdown, "")
    }

    /// The request reached a node that cannot route it; another node might.
    ///
    /// Any truthy `dispatch_failure` value counts: not null, false, 0 or "".
    pub fn is_dispatch_failure(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("dispatch_failure"))
            .is_some_and(truthy)
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
