use serde_json::{Map, Value};

use crate::error::{Result, WireError};
use crate::message::{Message, MessageKind, RpcError};

/// JSON object for `message`, with members in wire order.
///
/// Members irrelevant to the message kind are omitted; relevant but absent
/// members are written as `null`.
pub fn to_object(message: &Message) -> Map<String, Value> {
    let mut object = Map::new();
    object.insert("jsonrpc".into(), Value::from("2.0"));
    match message.kind {
        MessageKind::Request => {
            object.insert("method".into(), Value::from(message.method.as_str()));
            object.insert("id".into(), Value::from(message.id));
            object.insert("params".into(), or_null(message.params.as_ref()));
        }
        MessageKind::Response => {
            object.insert("id".into(), Value::from(message.id));
            object.insert("result".into(), or_null(message.result.as_ref()));
            let error = match &message.error {
                Some(error) => serde_json::to_value(error).unwrap_or(Value::Null),
                None => Value::Null,
            };
            object.insert("error".into(), error);
        }
        MessageKind::Notification => {
            object.insert("method".into(), Value::from(message.method.as_str()));
            object.insert("params".into(), or_null(message.params.as_ref()));
        }
    }
    object
}

/// Wire text of `message`: the JSON object with every space, tab, carriage
/// return and line feed removed, including those inside string values.
pub fn serialize(message: &Message) -> String {
    strip_whitespace(&Value::Object(to_object(message)).to_string())
}

/// Remove `[\r\n\t ]` from `text`.
pub fn strip_whitespace(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\t' | ' '))
        .collect()
}

/// Parse wire text into a message. See [`from_object`].
pub fn deserialize(text: &str) -> Result<Message> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => from_object(&object),
        _ => Err(WireError::NotAnObject("message")),
    }
}

/// Build a message from a JSON object, inferring its kind from which members
/// are present (a `null` value still counts as present):
///
/// 1. `result` or `error` present: response.
/// 2. otherwise `params` present: request if `id` is non-zero, else notification.
/// 3. otherwise: request.
///
/// A missing or `null` id reads as 0.
pub fn from_object(object: &Map<String, Value>) -> Result<Message> {
    let mut message = Message {
        id: parse_id(object.get("id"))?,
        ..Message::default()
    };

    match object.get("method") {
        None | Some(Value::Null) => {}
        Some(Value::String(method)) => message.method = method.clone(),
        Some(other) => message.method = other.to_string(),
    }

    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if has_result || has_error {
        message.kind = MessageKind::Response;
        message.result = object.get("result").filter(|v| !v.is_null()).cloned();
        message.error = match object.get("error") {
            None | Some(Value::Null) => None,
            Some(error) => Some(serde_json::from_value::<RpcError>(error.clone()).map_err(
                |e| WireError::InvalidField {
                    field: "error",
                    reason: e.to_string(),
                },
            )?),
        };
    }

    if let Some(params) = object.get("params") {
        message.params = Some(params.clone()).filter(|v| !v.is_null());
        if !(has_result || has_error) {
            message.kind = if message.id == 0 {
                MessageKind::Notification
            } else {
                MessageKind::Request
            };
        }
    }

    Ok(message)
}

fn or_null(value: Option<&Value>) -> Value {
    value.cloned().unwrap_or(Value::Null)
}

fn parse_id(value: Option<&Value>) -> Result<i32> {
    let invalid = |reason: &str| WireError::InvalidField {
        field: "id",
        reason: reason.to_string(),
    };
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| invalid("not a 32-bit integer")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i32>()
            .map_err(|_| invalid("not a 32-bit integer")),
        Some(_) => Err(invalid("not a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use serde_json::json;

    #[test]
    fn serialize_request_without_params() {
        let message = Message::request("test");
        assert_eq!(
            serialize(&message),
            format!(
                r#"{{"jsonrpc":"2.0","method":"test","id":{},"params":null}}"#,
                message.id
            )
        );
    }

    #[test]
    fn serialize_request_with_params() {
        let message = Message::request_with_id("test", 11).with_params(json!({"xx": "val"}));
        assert_eq!(
            serialize(&message),
            r#"{"jsonrpc":"2.0","method":"test","id":11,"params":{"xx":"val"}}"#
        );
    }

    #[test]
    fn serialize_keeps_param_insertion_order() {
        let message = Message::notification("Svc/changed").with_params(json!({"z": 1, "a": 2}));
        assert_eq!(
            serialize(&message),
            r#"{"jsonrpc":"2.0","method":"Svc/changed","params":{"z":1,"a":2}}"#
        );
    }

    #[test]
    fn serialize_response_fields() {
        let request = Message::request_with_id("x", 3);
        assert_eq!(
            serialize(&Message::response(&request, "OK")),
            r#"{"jsonrpc":"2.0","id":3,"result":"OK","error":null}"#
        );
        assert_eq!(
            serialize(&Message::failed_response(Some(&request), ErrorCode::MethodNotFound)),
            r#"{"jsonrpc":"2.0","id":3,"result":null,"error":{"code":-32601,"message":"MethodNotFound"}}"#
        );
    }

    #[test]
    fn serialize_strips_whitespace_inside_strings() {
        let message = Message::notification("a b").with_params(json!("tab\there"));
        assert_eq!(
            serialize(&message),
            r#"{"jsonrpc":"2.0","method":"ab","params":"tab\there"}"#
        );
        assert_eq!(strip_whitespace(" a\r\n\tb "), "ab");
    }

    #[test]
    fn deserialize_response_with_null_id_and_error() {
        let message =
            deserialize(r#"{"jsonrpc":"2.0","result":"-3","id":null,"error":null}"#).unwrap();
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.id, 0);
        assert_eq!(message.result, Some(json!("-3")));
        assert!(message.error.is_none());
    }

    #[test]
    fn deserialize_response_with_stray_params_stays_response() {
        let message =
            deserialize(r#"{"id":4,"params":{"a":1},"error":{"code":-32000,"message":"x"}}"#)
                .unwrap();
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.params, Some(json!({"a": 1})));
        assert!(message.is_error(ErrorCode::ServerException));
    }

    #[test]
    fn deserialize_classifies_by_id_when_params_present() {
        let request = deserialize(r#"{"method":"m","id":8,"params":null}"#).unwrap();
        assert_eq!(request.kind, MessageKind::Request);
        let notification = deserialize(r#"{"method":"m","params":[1,2]}"#).unwrap();
        assert_eq!(notification.kind, MessageKind::Notification);
        let zero_id = deserialize(r#"{"method":"m","id":0,"params":{}}"#).unwrap();
        assert_eq!(zero_id.kind, MessageKind::Notification);
    }

    #[test]
    fn deserialize_bare_message_defaults_to_request() {
        let message = deserialize(r#"{"jsonrpc":"2.0","method":"m","id":5}"#).unwrap();
        assert_eq!(message.kind, MessageKind::Request);
        assert_eq!(message.id, 5);
    }

    #[test]
    fn deserialize_rejects_bad_input() {
        assert!(matches!(deserialize("not json"), Err(WireError::Json(_))));
        assert!(matches!(deserialize("[1]"), Err(WireError::NotAnObject(_))));
        assert!(matches!(
            deserialize(r#"{"id":{},"params":1}"#),
            Err(WireError::InvalidField { field: "id", .. })
        ));
        assert!(matches!(
            deserialize(r#"{"id":1,"error":"bad"}"#),
            Err(WireError::InvalidField { field: "error", .. })
        ));
    }

    #[test]
    fn serialized_messages_parse_back_to_equal_messages() {
        let request = Message::request_with_id("Svc/do", 21).with_params(json!({"n": [1, 2]}));
        let notification = Message::notification("Svc/event").with_params(json!(true));
        let response = Message::response(&request, json!({"ok": 1}));
        let mut failed = Message::server_exception(&request, "boom", "detail");
        // Responses do not carry the method on the wire.
        failed.method.clear();

        for message in [request, notification, response, failed] {
            assert_eq!(deserialize(&serialize(&message)).unwrap(), message);
        }
    }
}
