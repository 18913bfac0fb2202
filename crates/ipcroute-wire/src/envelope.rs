use serde_json::{Map, Value};

use crate::error::{Result, WireError};
use crate::message::Message;
use crate::serializer::{from_object, to_object};

/// The unit placed on the wire.
///
/// `service` names the destination service. HostRouter reads it as a host
/// name instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Message { service: String, message: Message },
    Subscribe { service: String, command: String },
    Unsubscribe { service: String, command: String },
}

impl Envelope {
    pub fn message(service: impl Into<String>, message: Message) -> Self {
        Envelope::Message {
            service: service.into(),
            message,
        }
    }

    pub fn subscribe(service: impl Into<String>, command: impl Into<String>) -> Self {
        Envelope::Subscribe {
            service: service.into(),
            command: command.into(),
        }
    }

    pub fn unsubscribe(service: impl Into<String>, command: impl Into<String>) -> Self {
        Envelope::Unsubscribe {
            service: service.into(),
            command: command.into(),
        }
    }

    pub fn service(&self) -> &str {
        match self {
            Envelope::Message { service, .. }
            | Envelope::Subscribe { service, .. }
            | Envelope::Unsubscribe { service, .. } => service,
        }
    }

    /// Compact JSON text of this envelope.
    ///
    /// ```text
    /// {"message":{...},"service":S}
    /// {"service":S,"subscribe":CMD}
    /// {"service":S,"unsubscribe":CMD}
    /// ```
    pub fn pack(&self) -> String {
        let mut object = Map::new();
        match self {
            Envelope::Message { service, message } => {
                object.insert("message".into(), Value::Object(to_object(message)));
                object.insert("service".into(), Value::from(service.as_str()));
            }
            Envelope::Subscribe { service, command } => {
                object.insert("service".into(), Value::from(service.as_str()));
                object.insert("subscribe".into(), Value::from(command.as_str()));
            }
            Envelope::Unsubscribe { service, command } => {
                object.insert("service".into(), Value::from(service.as_str()));
                object.insert("unsubscribe".into(), Value::from(command.as_str()));
            }
        }
        Value::Object(object).to_string()
    }

    /// Parse envelope text.
    ///
    /// A non-empty `subscribe` wins over `unsubscribe`, which wins over
    /// `message`. `service` must be present.
    pub fn unpack(text: &str) -> Result<Self> {
        let object = match serde_json::from_str::<Value>(text)? {
            Value::Object(object) => object,
            _ => return Err(WireError::NotAnObject("envelope")),
        };

        let service = match object.get("service") {
            None => return Err(WireError::MissingField("service")),
            Some(value) => text_of(value),
        };

        let subscribe = object.get("subscribe").map(text_of).unwrap_or_default();
        if !subscribe.is_empty() {
            return Ok(Envelope::Subscribe {
                service,
                command: subscribe,
            });
        }

        let unsubscribe = object.get("unsubscribe").map(text_of).unwrap_or_default();
        if !unsubscribe.is_empty() {
            return Ok(Envelope::Unsubscribe {
                service,
                command: unsubscribe,
            });
        }

        match object.get("message") {
            Some(Value::Object(message)) => Ok(Envelope::Message {
                service,
                message: from_object(message)?,
            }),
            None | Some(Value::Null) => Err(WireError::EmptyEnvelope),
            Some(_) => Err(WireError::NotAnObject("message")),
        }
    }
}

/// Convenience for `Envelope::message(service, message).pack()`.
pub fn pack(message: &Message, service: &str) -> String {
    Envelope::message(service, message.clone()).pack()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
