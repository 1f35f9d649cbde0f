//! Wire models for the RPC protocol.
//!
//! Outbound requests are `{id, method, params}` objects. Inbound frames are
//! decoded into [`Frame`], a closed union of responses and live-query
//! notifications; anything outside that union is rejected with a
//! [`FrameError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Method that opens a live query. A successful result is the subscription token.
pub const LIVE_METHOD: &str = "live";

/// Method that kills a live query. `params[0]` is the subscription token.
pub const KILL_METHOD: &str = "kill";

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl Request {
    /// Build a request with a fresh random identifier.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    /// Whether this request opens a live query.
    pub fn is_live(&self) -> bool {
        self.method == LIVE_METHOD
    }

    /// Whether this request kills a live query.
    pub fn is_kill(&self) -> bool {
        self.method == KILL_METHOD
    }

    /// Token targeted by a `kill` request.
    pub fn kill_token(&self) -> Option<&str> {
        self.params.first().and_then(Value::as_str)
    }
}

/// Error object carried by a well-formed response.
///
/// This is a remote failure, not a local fault: it is handed back to the
/// caller inside [`RpcResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// A response correlated to one request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Change kind reported by a live query.
///
/// Includes `Unknown` for forward-compatibility with new server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveAction {
    Create,
    Update,
    Delete,
    #[default]
    #[serde(other)]
    Unknown,
}

impl LiveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveAction::Create => "CREATE",
            LiveAction::Update => "UPDATE",
            LiveAction::Delete => "DELETE",
            LiveAction::Unknown => "UNKNOWN",
        }
    }
}

/// Push notification for a live query, routed by subscription token.
///
/// `result` is the changed record, or a JSON-patch list when the live query
/// was opened with diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Subscription token.
    pub id: String,
    #[serde(default)]
    pub action: LiveAction,
    #[serde(default)]
    pub result: Value,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("response {id} has a malformed error object: {source}")]
    InvalidError {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("live notification is malformed: {0}")]
    InvalidNotification(#[source] serde_json::Error),

    #[error("frame has neither a request id nor a subscription token")]
    Unroutable,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Response),
    Push(Notification),
}

impl Frame {
    /// Decode and classify one inbound text frame.
    ///
    /// A non-null top-level `id` makes the frame a response. Otherwise a
    /// `result` object carrying its own `id` makes it a push notification.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
        let Value::Object(mut object) = value else {
            return Err(FrameError::NotAnObject);
        };

        if let Some(id) = object.get("id").and_then(id_to_string) {
            return Self::decode_response(id, &mut object);
        }

        match object.remove("result") {
            Some(Value::Object(inner)) if inner.get("id").is_some_and(Value::is_string) => {
                serde_json::from_value(Value::Object(inner))
                    .map(Frame::Push)
                    .map_err(FrameError::InvalidNotification)
            }
            _ => Err(FrameError::Unroutable),
        }
    }

    fn decode_response(id: String, object: &mut Map<String, Value>) -> Result<Self, FrameError> {
        let outcome = match object.remove("error") {
            Some(error) if !error.is_null() => {
                let error: RpcError = serde_json::from_value(error).map_err(|source| {
                    FrameError::InvalidError {
                        id: id.clone(),
                        source,
                    }
                })?;
                Err(error)
            }
            _ => Ok(object.remove("result").unwrap_or(Value::Null)),
        };
        Ok(Frame::Response(Response { id, outcome }))
    }
}

/// Request ids we generate are strings; tolerate numeric echoes.
fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Caller-visible outcome of a request: a success payload or a structured
/// server error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResult {
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Convert to a `Result`, for callers that prefer `?`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

impl From<Response> for RpcResult {
    fn from(response: Response) -> Self {
        match response.outcome {
            Ok(result) => RpcResult {
                result,
                error: None,
            },
            Err(error) => RpcResult {
                result: Value::Null,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_serializes_id_method_params() {
        let request = Request::new("select", vec![json!("article")]);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["method"], "select");
        assert_eq!(value["params"], json!(["article"]));
        assert_eq!(value["id"], json!(request.id));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::new("ping", vec![]);
        let b = Request::new("ping", vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_kill_token_is_first_param() {
        let request = Request::new(KILL_METHOD, vec![json!("tok-1")]);
        assert!(request.is_kill());
        assert!(!request.is_live());
        assert_eq!(request.kill_token(), Some("tok-1"));

        let empty = Request::new(KILL_METHOD, vec![]);
        assert_eq!(empty.kill_token(), None);
    }

    #[test]
    fn test_decode_success_response() {
        let frame = Frame::decode(r#"{"id":"abc","result":[{"id":"article:1"}]}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response {
                id: "abc".into(),
                outcome: Ok(json!([{"id": "article:1"}])),
            })
        );
    }

    #[test]
    fn test_decode_response_without_result_is_null() {
        let frame = Frame::decode(r#"{"id":"abc"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response {
                id: "abc".into(),
                outcome: Ok(Value::Null),
            })
        );
    }

    #[test]
    fn test_decode_error_response() {
        let frame = Frame::decode(
            r#"{"id":"abc","error":{"code":-32000,"message":"There was a problem with authentication"}}"#,
        )
        .unwrap();
        match frame {
            Frame::Response(Response { id, outcome: Err(err) }) => {
                assert_eq!(id, "abc");
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "There was a problem with authentication");
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_numeric_id() {
        let frame = Frame::decode(r#"{"id":7,"result":null}"#).unwrap();
        assert!(matches!(frame, Frame::Response(Response { ref id, .. }) if id == "7"));
    }

    #[test]
    fn test_decode_push_frame() {
        let frame = Frame::decode(
            r#"{"result":{"id":"tok-1","action":"CREATE","result":{"id":"article:1","title":"t"}}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Push(Notification {
                id: "tok-1".into(),
                action: LiveAction::Create,
                result: json!({"id": "article:1", "title": "t"}),
            })
        );
    }

    #[test]
    fn test_decode_push_with_unknown_action() {
        let frame = Frame::decode(r#"{"result":{"id":"tok-1","action":"KILLED"}}"#).unwrap();
        match frame {
            Frame::Push(n) => {
                assert_eq!(n.action, LiveAction::Unknown);
                assert_eq!(n.result, Value::Null);
            }
            other => panic!("Expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_null_id_is_not_a_response() {
        let err = Frame::decode(r#"{"id":null,"error":{"code":-32700,"message":"Parse error"}}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::Unroutable));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            Frame::decode("not json").unwrap_err(),
            FrameError::InvalidJson(_)
        ));
        assert!(matches!(
            Frame::decode("[1,2]").unwrap_err(),
            FrameError::NotAnObject
        ));
    }

    #[test]
    fn test_decode_rejects_unroutable_object() {
        assert!(matches!(
            Frame::decode(r#"{"result":42}"#).unwrap_err(),
            FrameError::Unroutable
        ));
        assert!(matches!(
            Frame::decode(r#"{"method":"ping"}"#).unwrap_err(),
            FrameError::Unroutable
        ));
    }

    #[test]
    fn test_decode_rejects_bad_error_object() {
        let err = Frame::decode(r#"{"id":"abc","error":"boom"}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidError { ref id, .. } if id == "abc"));
    }

    #[test]
    fn test_rpc_result_from_response() {
        let ok: RpcResult = Response {
            id: "a".into(),
            outcome: Ok(json!("tok-1")),
        }
        .into();
        assert!(!ok.is_error());
        assert_eq!(ok.into_result().unwrap(), json!("tok-1"));

        let failed: RpcResult = Response {
            id: "b".into(),
            outcome: Err(RpcError {
                code: -32000,
                message: "Can not execute KILL statement".into(),
            }),
        }
        .into();
        assert!(failed.is_error());
        assert_eq!(failed.result, Value::Null);
        assert_eq!(
            failed.into_result().unwrap_err().to_string(),
            "RPC error -32000: Can not execute KILL statement"
        );
    }

    #[test]
    fn test_rpc_result_serialization_skips_missing_error() {
        let ok = RpcResult {
            result: json!(1),
            error: None,
        };
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"result": 1}));
    }
}
