//! JSON-RPC 2.0 wire envelope and classification (spec §4.5).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request/response correlation id. Locally minted ids are always
/// [`RequestId::Str`] (a UUID string); inbound ids may be either variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Str(String),
    Int(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Str(s) => write!(f, "{s}"),
            RequestId::Int(i) => write!(f, "{i}"),
        }
    }
}

/// A JSON-RPC error object, wire-compatible with the standard envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC error codes used by this system (spec §4.5.3/§7).
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

impl RpcErrorObject {
    #[must_use]
    pub fn internal_error() -> Self {
        Self {
            code: error_codes::INTERNAL_ERROR,
            message: "unknown error".to_owned(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::INVALID_REQUEST,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::PARSE_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

/// Raw on-the-wire JSON-RPC message: every field optional except `jsonrpc`.
///
/// This is the type deserialized directly off the transport; use
/// [`classify`] to turn it into a [`Classified`] before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

fn protocol_version() -> String {
    "2.0".to_owned()
}

impl RawMessage {
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn response_ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn response_err(id: RequestId, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }
}

/// The four message roles, post-classification (spec §4.5).
#[derive(Debug, Clone)]
pub enum Classified {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    ResponseOk {
        id: RequestId,
        result: Value,
    },
    ResponseErr {
        id: RequestId,
        error: RpcErrorObject,
    },
    /// Does not satisfy any role; the caller must drop it.
    Malformed,
}

/// Classify a raw message per the table in spec §4.5.
#[must_use]
pub fn classify(msg: RawMessage) -> Classified {
    let has_method = msg.method.is_some();
    let has_result_or_error = msg.result.is_some() || msg.error.is_some();

    if has_method && has_result_or_error {
        return Classified::Malformed;
    }
    if has_method {
        let method = msg.method.expect("checked above");
        return match msg.id {
            Some(id) => Classified::Request {
                id,
                method,
                params: msg.params,
            },
            None => Classified::Notification {
                method,
                params: msg.params,
            },
        };
    }
    if has_result_or_error {
        if let Some(id) = msg.id {
            return match (msg.result, msg.error) {
                (Some(result), None) => Classified::ResponseOk { id, result },
                (None, Some(error)) => Classified::ResponseErr { id, error },
                // result and error both present, or both absent: unreachable
                // given has_result_or_error, but treat conservatively.
                _ => Classified::Malformed,
            };
        }
        return Classified::Malformed;
    }
    Classified::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request() {
        let msg = RawMessage::request(RequestId::Str("1".into()), "join", Some(json!({})));
        assert!(matches!(classify(msg), Classified::Request { .. }));
    }

    #[test]
    fn classifies_notification() {
        let msg = RawMessage::notification("room_closed", None);
        assert!(matches!(classify(msg), Classified::Notification { .. }));
    }

    #[test]
    fn classifies_response_ok() {
        let msg = RawMessage::response_ok(RequestId::Int(5), json!({"ok": true}));
        assert!(matches!(classify(msg), Classified::ResponseOk { .. }));
    }

    #[test]
    fn classifies_response_err() {
        let msg = RawMessage::response_err(RequestId::Int(5), RpcErrorObject::internal_error());
        assert!(matches!(classify(msg), Classified::ResponseErr { .. }));
    }

    #[test]
    fn method_with_result_is_malformed() {
        let mut msg = RawMessage::request(RequestId::Int(1), "join", None);
        msg.result = Some(json!({}));
        assert!(matches!(classify(msg), Classified::Malformed));
    }

    #[test]
    fn neither_method_nor_result_nor_error_is_malformed() {
        let msg = RawMessage {
            jsonrpc: "2.0".to_owned(),
            id: Some(RequestId::Int(1)),
            method: None,
            params: None,
            result: None,
            error: None,
        };
        assert!(matches!(classify(msg), Classified::Malformed));
    }

    #[test]
    fn response_without_id_is_malformed() {
        let msg = RawMessage {
            jsonrpc: "2.0".to_owned(),
            id: None,
            method: None,
            params: None,
            result: Some(json!({})),
            error: None,
        };
        assert!(matches!(classify(msg), Classified::Malformed));
    }
}
