//! JSON-RPC 2.0 message model used on the LSP wire.
//!
//! Messages never carry an explicit kind tag. The variant is decided by which
//! fields are present:
//!
//! | `method` | `id` | variant        |
//! |----------|------|----------------|
//! | yes      | yes  | `Request`      |
//! | yes      | no   | `Notification` |
//! | no       | yes  | `Response`     |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Request identifier.
///
/// Compared structurally: `Number(1)` and `String("1")` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Extract an id from a raw JSON value, if it has a valid id shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
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

/// JSON-RPC and LSP error codes understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    MethodNotFound,
    InternalError,
    /// A request arrived before `initialize`.
    ServerNotInitialized,
    /// The request was well formed but could not be completed.
    RequestFailed,
    ServerCancelled,
    ContentModified,
    /// The client cancelled the request and the server noticed.
    RequestCancelled,
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerNotInitialized => -32002,
            ErrorCode::RequestFailed => -32803,
            ErrorCode::ServerCancelled => -32802,
            ErrorCode::ContentModified => -32801,
            ErrorCode::RequestCancelled => -32800,
        }
    }

    /// Human readable message sent alongside the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method Not Found",
            ErrorCode::InternalError => "Internal Error",
            ErrorCode::ServerNotInitialized => "Server Not Initialized",
            ErrorCode::RequestFailed => "Request Failed",
            ErrorCode::ServerCancelled => "Server Cancelled",
            ErrorCode::ContentModified => "Content Modified",
            ErrorCode::RequestCancelled => "Request Cancelled",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32603 => Some(ErrorCode::InternalError),
            -32002 => Some(ErrorCode::ServerNotInitialized),
            -32803 => Some(ErrorCode::RequestFailed),
            -32802 => Some(ErrorCode::ServerCancelled),
            -32801 => Some(ErrorCode::ContentModified),
            -32800 => Some(ErrorCode::RequestCancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ErrorCode> for ResponseError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }
}

/// A request expecting exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message. Never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to a request. Exactly one of `result` and `error` is sent.
///
/// A `None` id serializes as `null`, which is what JSON-RPC requires when
/// the offending request's id could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Skeleton response echoing `id`, with neither result nor error yet.
    pub fn new(id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: ErrorCode) -> Self {
        let mut rsp = Self::new(id);
        rsp.set_error(code);
        rsp
    }

    pub fn set_result(&mut self, result: Value) {
        self.error = None;
        self.result = Some(result);
    }

    pub fn set_error(&mut self, code: ErrorCode) {
        self.set_response_error(code.into());
    }

    pub fn set_response_error(&mut self, error: ResponseError) {
        self.result = None;
        self.error = Some(error);
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error code of a failed response, if it is one the engine knows.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().and_then(|e| ErrorCode::from_code(e.code))
    }

    /// Take ownership of this response, leaving a fresh skeleton in place.
    ///
    /// Handlers that answer asynchronously call this and return
    /// [`Outcome::Async`](crate::registry::Outcome::Async).
    pub fn take(&mut self) -> Response {
        let fresh = Response::new(self.id.clone());
        std::mem::replace(self, fresh)
    }

    /// Fill in `result: null` if the handler left both fields empty.
    pub(crate) fn finalize(&mut self) {
        if self.result.is_none() && self.error.is_none() {
            self.result = Some(Value::Null);
        }
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why a JSON value could not be turned into a [`Message`].
#[derive(Debug, Error)]
pub enum InvalidMessage {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has neither `method` nor `id`")]
    Unclassifiable,

    #[error("malformed {kind}: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Message {
    /// Classify a JSON value by structure. Field order is irrelevant.
    pub fn from_value(value: Value) -> Result<Self, InvalidMessage> {
        let obj = value.as_object().ok_or(InvalidMessage::NotAnObject)?;
        let has_method = obj.contains_key("method");
        let has_id = obj.contains_key("id");

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|source| InvalidMessage::Malformed {
                    kind: "request",
                    source,
                }),
            (true, false) => serde_json::from_value(value)
                .map(Message::Notification)
                .map_err(|source| InvalidMessage::Malformed {
                    kind: "notification",
                    source,
                }),
            (false, true) => serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|source| InvalidMessage::Malformed {
                    kind: "response",
                    source,
                }),
            (false, false) => Err(InvalidMessage::Unclassifiable),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "initialize",
            "params": {}
        }))
        .unwrap();

        match msg {
            Message::Request(req) => {
                assert_eq!(req.id, RequestId::Number(7));
                assert_eq!(req.method, "initialize");
                assert_eq!(req.params, Some(json!({})));
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_ignores_field_order() {
        let request = r#"{"params":null,"method":"m","id":"a","jsonrpc":"2.0"}"#;
        let notification = r#"{"params":[1],"method":"m","jsonrpc":"2.0"}"#;
        let response = r#"{"result":{"ok":true},"id":3,"jsonrpc":"2.0"}"#;

        let parse = |s: &str| Message::from_value(serde_json::from_str(s).unwrap()).unwrap();

        assert!(matches!(parse(request), Message::Request(_)));
        assert!(matches!(parse(notification), Message::Notification(_)));
        assert!(matches!(parse(response), Message::Response(_)));
    }

    #[test]
    fn test_classify_notification_has_no_id() {
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "method": "exit"})).unwrap();
        assert_eq!(msg.method(), Some("exit"));
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn test_classify_error_response() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method Not Found"}
        }))
        .unwrap();

        match msg {
            Message::Response(rsp) => {
                assert!(rsp.is_error());
                assert_eq!(rsp.error_code(), Some(ErrorCode::MethodNotFound));
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_rejects_unclassifiable() {
        assert!(matches!(
            Message::from_value(json!({"jsonrpc": "2.0"})),
            Err(InvalidMessage::Unclassifiable)
        ));
        assert!(matches!(
            Message::from_value(json!([1, 2, 3])),
            Err(InvalidMessage::NotAnObject)
        ));
        assert!(matches!(
            Message::from_value(json!({"id": 1, "method": 42})),
            Err(InvalidMessage::Malformed { kind: "request", .. })
        ));
    }

    #[test]
    fn test_request_id_is_structural() {
        assert_ne!(RequestId::Number(1), RequestId::String("1".to_string()));
        assert_eq!(RequestId::from_value(&json!(1)), Some(RequestId::Number(1)));
        assert_eq!(RequestId::from_value(&json!("1")), Some(RequestId::from("1")));
        assert_eq!(RequestId::from_value(&json!(1.5)), None);
        assert_eq!(RequestId::from_value(&json!(null)), None);
    }

    #[test]
    fn test_response_serialization() {
        let mut rsp = Response::new(Some(RequestId::Number(4)));
        rsp.finalize();
        assert_eq!(
            serde_json::to_value(&rsp).unwrap(),
            json!({"jsonrpc": "2.0", "id": 4, "result": null})
        );

        let rsp = Response::error(None, ErrorCode::InvalidRequest);
        assert_eq!(
            serde_json::to_value(&rsp).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32600, "message": "Invalid Request"}
            })
        );
    }

    #[test]
    fn test_set_error_clears_result() {
        let mut rsp = Response::new(Some(RequestId::from("x")));
        rsp.set_result(json!(1));
        rsp.set_error(ErrorCode::RequestCancelled);
        assert_eq!(rsp.result, None);
        assert_eq!(rsp.error_code(), Some(ErrorCode::RequestCancelled));
    }

    #[test]
    fn test_take_leaves_skeleton() {
        let mut rsp = Response::new(Some(RequestId::Number(9)));
        rsp.set_result(json!("done"));
        let owned = rsp.take();
        assert_eq!(owned.result, Some(json!("done")));
        assert_eq!(rsp.id, Some(RequestId::Number(9)));
        assert_eq!(rsp.result, None);
    }

    #[test]
    fn test_error_code_table() {
        let codes = [
            (ErrorCode::MethodNotFound, -32601, "Method Not Found"),
            (ErrorCode::InvalidRequest, -32600, "Invalid Request"),
            (ErrorCode::InternalError, -32603, "Internal Error"),
            (ErrorCode::ServerNotInitialized, -32002, "Server Not Initialized"),
            (ErrorCode::RequestFailed, -32803, "Request Failed"),
            (ErrorCode::ServerCancelled, -32802, "Server Cancelled"),
            (ErrorCode::ContentModified, -32801, "Content Modified"),
            (ErrorCode::RequestCancelled, -32800, "Request Cancelled"),
        ];

        for (code, value, message) in codes {
            assert_eq!(code.code(), value);
            assert_eq!(code.message(), message);
            assert_eq!(ErrorCode::from_code(value), Some(code));
        }
        assert_eq!(ErrorCode::from_code(-1), None);
    }
}
