//! Wire envelopes shared by the agent connection and pool workers.
//!
//! Outgoing: `{"id":N,"method":..,"params":..}` for a request,
//! the same without `id` for a notification.
//! Incoming: `{"id":N,"message":..}` (progress push, zero or more per id)
//! followed by exactly one `{"id":N,"result":..}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::diagnostics::Parameters;

/// Dialect marker carried by every envelope the agent speaks.
pub const DIALECT: &str = "2.0+push";

fn dialect() -> String {
    DIALECT.to_string()
}

/// A request (with `id`) or a notification (without).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "dialect")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn call(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: dialect(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: dialect(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An incoming record correlated by request id.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Non-terminal push for a still-pending id.
    Progress { id: u64, message: Value },
    /// Terminal value; settles the id.
    Result { id: u64, result: Value },
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    #[serde(default = "dialect")]
    jsonrpc: String,
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Value>,
    // `"result": null` is still a terminal result, so presence matters.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Response {
    pub fn progress(id: u64, message: impl Into<Value>) -> Self {
        Self::Progress {
            id,
            message: message.into(),
        }
    }

    pub fn result(id: u64, result: Value) -> Self {
        Self::Result { id, result }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Progress { id, .. } | Self::Result { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Parse one protocol line.
    ///
    /// Returns `None` for blank lines, malformed JSON, ids that are not
    /// unsigned integers, and records carrying neither `message` nor `result`.
    /// The reader skips those instead of failing the connection.
    pub fn parse(line: &str) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }

        let raw: RawResponse = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, line_len = line.len(), "Ignoring malformed protocol line");
                return None;
            }
        };

        if let Some(message) = raw.message {
            return Some(Self::Progress {
                id: raw.id,
                message,
            });
        }
        if let Some(result) = raw.result {
            return Some(Self::Result { id: raw.id, result });
        }

        tracing::trace!(id = raw.id, "Ignoring record without message or result");
        None
    }
}

impl Serialize for Response {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            Self::Progress { id, message } => RawResponse {
                jsonrpc: dialect(),
                id: *id,
                message: Some(message.clone()),
                result: None,
            },
            Self::Result { id, result } => RawResponse {
                jsonrpc: dialect(),
                id: *id,
                message: None,
                result: Some(result.clone()),
            },
        };
        raw.serialize(serializer)
    }
}

/// Domain payload of the `check` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub source: String,
    pub flags: String,
    #[serde(default)]
    pub params: Parameters,
}

impl CheckRequest {
    pub fn new(source: impl Into<String>, flags: impl Into<String>, params: Parameters) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
            params,
        }
    }
}

/// A `check` request addressed to a pool worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    #[serde(flatten)]
    pub check: CheckRequest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes() {
        let req = Request::call(3, "check", json!({"source": "^a$", "flags": ""}));
        insta::assert_json_snapshot!(req, @r#"
        {
          "jsonrpc": "2.0+push",
          "id": 3,
          "method": "check",
          "params": {
            "flags": "",
            "source": "^a$"
          }
        }
        "#);
    }

    #[test]
    fn notification_serializes_without_id() {
        let req = Request::notification("cancel", json!({"id": 3}));
        insta::assert_json_snapshot!(req, @r#"
        {
          "jsonrpc": "2.0+push",
          "method": "cancel",
          "params": {
            "id": 3
          }
        }
        "#);
        assert!(req.is_notification());
    }

    #[test]
    fn parse_progress() {
        let resp = Response::parse(r#"{"jsonrpc":"2.0+push","id":4,"message":"tick"}"#);
        assert_eq!(resp, Some(Response::progress(4, "tick")));
    }

    #[test]
    fn parse_result() {
        let resp = Response::parse(r#"{"id":4,"result":{"status":"safe"}}"#).unwrap();
        assert!(resp.is_terminal());
        assert_eq!(resp.id(), 4);
    }

    #[test]
    fn null_result_is_terminal() {
        let resp = Response::parse(r#"{"id":2,"result":null}"#);
        assert_eq!(resp, Some(Response::result(2, Value::Null)));
    }

    #[test]
    fn null_message_is_not_progress() {
        let resp = Response::parse(r#"{"id":2,"message":null,"result":1}"#);
        assert_eq!(resp, Some(Response::result(2, json!(1))));
    }

    #[test]
    fn message_takes_precedence_over_result() {
        let resp = Response::parse(r#"{"id":2,"message":"m","result":1}"#);
        assert_eq!(resp, Some(Response::progress(2, "m")));
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(Response::parse(""), None);
        assert_eq!(Response::parse("   "), None);
        assert_eq!(Response::parse("not json"), None);
        assert_eq!(Response::parse(r#"{"id":-1,"result":{}}"#), None);
        assert_eq!(Response::parse(r#"{"result":{}}"#), None);
        assert_eq!(Response::parse(r#"{"id":1}"#), None);
    }

    #[test]
    fn response_round_trips_through_serialize() {
        let resp = Response::result(9, json!({"status": "unknown"}));
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(Response::parse(&line), Some(resp));
    }

    #[test]
    fn worker_request_flattens_check_payload() {
        let req = WorkerRequest {
            id: 1,
            check: CheckRequest::new("^(a|a)*$", "u", Parameters::default()),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"id": 1, "source": "^(a|a)*$", "flags": "u", "params": {}}));
    }
}
