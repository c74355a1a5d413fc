//! Envelope codec.
//!
//! Every frame on the wire is a two-element MessagePack array
//! `[action, payload]`. Two actions have a fixed payload shape:
//!
//! - `["req", [inner_action, correlation_id, inner_payload]]`
//! - `["reply", [correlation_id, result_or_error]]`
//!
//! An error result is a map carrying the [`ERROR_KEY`] plus arbitrary fields.

use std::fmt;

use bytes::Bytes;
use rmpv::Value;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Message payload. Any MessagePack value: nested maps, arrays, scalars, binary blobs.
pub type Payload = Value;

/// Map key marking a reply as a client-side error.
pub const ERROR_KEY: &str = "_error";

/// Well-known action names.
pub mod actions {
    /// Handshake, sent by the client on connect and echoed back as acknowledgement.
    pub const SETUP: &str = "setup";
    /// Tells the client to discard its state and reload the page.
    pub const RELOAD: &str = "reload";
    /// Last message before the server drops a failed session.
    pub const FATAL: &str = "fatal";
    /// Request awaiting a reply.
    pub const REQUEST: &str = "req";
    /// Reply to a request.
    pub const REPLY: &str = "reply";
    /// Token sync; the client echoes the token back as `pong`.
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    /// Actions applications may not send on their own.
    #[must_use]
    pub fn is_reserved(action: &str) -> bool {
        matches!(action, REQUEST | REPLY | SETUP)
    }
}

/// A single logical message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// One-way message.
    Message { action: String, payload: Payload },
    /// Request awaiting a reply with the same correlation id.
    Request {
        action: String,
        id: u64,
        payload: Payload,
    },
    /// Reply to an earlier request.
    Reply { id: u64, result: Payload },
}

impl Envelope {
    /// Create a one-way message.
    #[must_use]
    pub fn message(action: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::Message {
            action: action.into(),
            payload: payload.into(),
        }
    }

    /// Create a request.
    #[must_use]
    pub fn request(action: impl Into<String>, id: u64, payload: impl Into<Payload>) -> Self {
        Self::Request {
            action: action.into(),
            id,
            payload: payload.into(),
        }
    }

    /// Create a reply.
    #[must_use]
    pub fn reply(id: u64, result: impl Into<Payload>) -> Self {
        Self::Reply {
            id,
            result: result.into(),
        }
    }

    /// The top-level action of this envelope as it appears on the wire.
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::Message { action, .. } => action,
            Self::Request { .. } => actions::REQUEST,
            Self::Reply { .. } => actions::REPLY,
        }
    }

    fn into_value(self) -> Value {
        let (action, payload) = match self {
            Self::Message { action, payload } => (action, payload),
            Self::Request {
                action,
                id,
                payload,
            } => (
                actions::REQUEST.to_string(),
                Value::Array(vec![Value::from(action), Value::from(id), payload]),
            ),
            Self::Reply { id, result } => (
                actions::REPLY.to_string(),
                Value::Array(vec![Value::from(id), result]),
            ),
        };
        Value::Array(vec![Value::from(action), payload])
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Array(mut items) = value else {
            return Err(malformed("top-level value is not an array"));
        };
        if items.len() != 2 {
            return Err(malformed(format!(
                "expected [action, payload], got {} elements",
                items.len()
            )));
        }
        let payload = items.pop().unwrap_or(Value::Nil);
        let action = match items.pop() {
            Some(Value::String(s)) => s
                .into_str()
                .ok_or_else(|| malformed("action is not valid UTF-8"))?,
            _ => return Err(malformed("action is not a string")),
        };

        match action.as_str() {
            actions::REQUEST => {
                let mut parts = expect_array(payload, 3, "req")?.into_iter();
                let action = match parts.next() {
                    Some(Value::String(s)) => s
                        .into_str()
                        .ok_or_else(|| malformed("req action is not valid UTF-8"))?,
                    _ => return Err(malformed("req action is not a string")),
                };
                let id = correlation_id(parts.next(), "req")?;
                let payload = parts.next().unwrap_or(Value::Nil);
                Ok(Self::Request {
                    action,
                    id,
                    payload,
                })
            }
            actions::REPLY => {
                let mut parts = expect_array(payload, 2, "reply")?.into_iter();
                let id = correlation_id(parts.next(), "reply")?;
                let result = parts.next().unwrap_or(Value::Nil);
                Ok(Self::Reply { id, result })
            }
            _ => Ok(Self::Message { action, payload }),
        }
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedFrame(reason.into())
}

fn expect_array(value: Value, len: usize, what: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) if items.len() == len => Ok(items),
        Value::Array(items) => Err(malformed(format!(
            "{what} payload has {} elements, expected {len}",
            items.len()
        ))),
        _ => Err(malformed(format!("{what} payload is not an array"))),
    }
}

fn correlation_id(value: Option<Value>, what: &str) -> Result<u64> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(format!("{what} correlation id is not an unsigned integer")))
}

/// Encode an envelope into a transport frame.
///
/// # Errors
/// Returns error if the MessagePack writer fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let value = envelope.clone().into_value();
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &value).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a transport frame into an envelope.
///
/// # Errors
/// Returns `MalformedFrame` if the frame is not valid MessagePack, has
/// trailing bytes, or does not have the envelope shape.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let mut rd = frame;
    let value = rmpv::decode::read_value(&mut rd).map_err(|e| malformed(e.to_string()))?;
    if !rd.is_empty() {
        return Err(malformed(format!("{} trailing bytes", rd.len())));
    }
    Envelope::from_value(value)
}

/// Convert a serializable value into a payload.
///
/// Values go through the JSON data model, so structs and maps become
/// MessagePack maps keyed by field name.
///
/// # Errors
/// Returns error if the value cannot be serialized.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    let json = serde_json::to_value(value).map_err(|e| Error::Payload(e.to_string()))?;
    Ok(json_to_payload(json))
}

/// Convert a payload into a typed value.
///
/// Binary blobs surface as sequences of bytes.
///
/// # Errors
/// Returns error if the payload does not match the target type.
pub fn from_payload<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    serde_json::from_value(payload_to_json(payload)).map_err(|e| Error::Payload(e.to_string()))
}

fn json_to_payload(json: serde_json::Value) -> Payload {
    use serde_json::Value as Json;

    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => Value::from(s),
        Json::Array(items) => Value::Array(items.into_iter().map(json_to_payload).collect()),
        Json::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (Value::from(k), json_to_payload(v)))
                .collect(),
        ),
    }
}

fn payload_to_json(payload: Payload) -> serde_json::Value {
    use serde_json::Value as Json;

    match payload {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::Integer(i) => i
            .as_u64()
            .map(Json::from)
            .or_else(|| i.as_i64().map(Json::from))
            .unwrap_or(Json::Null),
        Value::F32(f) => serde_json::Number::from_f64(f64::from(f)).map_or(Json::Null, Json::Number),
        Value::F64(f) => serde_json::Number::from_f64(f).map_or(Json::Null, Json::Number),
        Value::String(s) => s.into_str().map_or(Json::Null, Json::String),
        Value::Binary(bytes) | Value::Ext(_, bytes) => {
            Json::Array(bytes.into_iter().map(Json::from).collect())
        }
        Value::Array(items) => Json::Array(items.into_iter().map(payload_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::String(s) => s.into_str().unwrap_or_default(),
                        other => other.to_string(),
                    };
                    (key, payload_to_json(v))
                })
                .collect(),
        ),
    }
}

/// Look up a string key in a map payload.
#[must_use]
pub fn map_get<'a>(payload: &'a Payload, key: &str) -> Option<&'a Payload> {
    payload
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Structured error returned by the client in reply to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientError {
    /// Value of the error key.
    pub error: Payload,
    /// Every other field the client supplied.
    pub fields: Vec<(Payload, Payload)>,
}

impl ClientError {
    /// Interpret a reply result. Returns `None` unless it is a map carrying the error key.
    #[must_use]
    pub fn from_reply(result: &Payload) -> Option<Self> {
        let map = result.as_map()?;
        let mut error = None;
        let mut fields = Vec::with_capacity(map.len());
        for (k, v) in map {
            if error.is_none() && k.as_str() == Some(ERROR_KEY) {
                error = Some(v.clone());
            } else {
                fields.push((k.clone(), v.clone()));
            }
        }
        error.map(|error| Self { error, fields })
    }

    /// Look up a client-supplied field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.fields
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client error: {}", self.error)?;
        for (k, v) in &self.fields {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {}

/// Split a reply result into a value or a client error.
///
/// # Errors
/// Returns the client error if the result is an error map.
pub fn reply_result(result: Payload) -> Result<Payload, ClientError> {
    match ClientError::from_reply(&result) {
        Some(err) => Err(err),
        None => Ok(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let frame = encode(envelope).unwrap();
        decode(&frame).unwrap()
    }

    fn raw(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn test_message_roundtrip() {
        let env = Envelope::message(
            "set",
            Value::Map(vec![
                (Value::from("id"), Value::from("df_main")),
                (Value::from("content"), Value::from("<p>hi</p>")),
            ]),
        );
        assert_eq!(roundtrip(&env), env);
    }

    #[test]
    fn test_binary_payload_roundtrip() {
        let blob: Vec<u8> = (0..=255).collect();
        let env = Envelope::message("upload", Value::Binary(blob));
        assert_eq!(roundtrip(&env), env);
    }

    #[test]
    fn test_request_and_reply_roundtrip() {
        let req = Envelope::request("getattr", 7, Value::Array(vec![Value::from("x")]));
        assert_eq!(roundtrip(&req), req);
        assert_eq!(req.action(), actions::REQUEST);

        let reply = Envelope::reply(7, Value::Nil);
        assert_eq!(roundtrip(&reply), reply);
        assert_eq!(reply.action(), actions::REPLY);
    }

    #[test]
    fn test_request_wire_shape() {
        let frame = encode(&Envelope::request("ping", 3, "A0")).unwrap();
        let value = rmpv::decode::read_value(&mut &frame[..]).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from("req"),
                Value::Array(vec![Value::from("ping"), Value::from(3u64), Value::from("A0")]),
            ])
        );
    }

    #[test]
    fn test_decode_rejects_non_array() {
        let frame = raw(&Value::from("hello"));
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        let frame = raw(&Value::Array(vec![Value::from("a"), Value::Nil, Value::Nil]));
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_non_string_action() {
        let frame = raw(&Value::Array(vec![Value::from(1), Value::Nil]));
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_bad_reply_shape() {
        let frame = raw(&Value::Array(vec![
            Value::from("reply"),
            Value::Array(vec![Value::from("not-an-id"), Value::Nil]),
        ]));
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));

        let frame = raw(&Value::Array(vec![Value::from("req"), Value::from(5)]));
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut frame = encode(&Envelope::message("a", Value::Nil)).unwrap().to_vec();
        frame.push(0xc0);
        assert!(matches!(decode(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[0xc1]), Err(Error::MalformedFrame(_))));
        assert!(matches!(decode(&[]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_client_error_detection() {
        let result = Value::Map(vec![
            (Value::from("_error"), Value::from("TypeError")),
            (Value::from("action"), Value::from("getattr")),
            (Value::from("n"), Value::from(4)),
        ]);
        let err = reply_result(result).unwrap_err();
        assert_eq!(err.error, Value::from("TypeError"));
        assert_eq!(err.get("action"), Some(&Value::from("getattr")));
        assert!(err.to_string().contains("TypeError"));

        let ok = Value::Map(vec![(Value::from("x"), Value::from(1))]);
        assert_eq!(reply_result(ok.clone()).unwrap(), ok);
    }

    #[test]
    fn test_typed_payload_conversion() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Alert {
            level: String,
            text: String,
        }

        let alert = Alert {
            level: "info".into(),
            text: "Ready!".into(),
        };
        let payload = to_payload(&alert).unwrap();
        assert_eq!(map_get(&payload, "level"), Some(&Value::from("info")));
        let back: Alert = from_payload(payload).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn test_binary_payload_decodes_as_bytes() {
        let bytes: Vec<u8> = from_payload(Value::Binary(vec![0, 1, 255])).unwrap();
        assert_eq!(bytes, vec![0, 1, 255]);
    }

    #[test]
    fn test_reserved_actions() {
        assert!(actions::is_reserved("req"));
        assert!(actions::is_reserved("reply"));
        assert!(actions::is_reserved("setup"));
        assert!(!actions::is_reserved("set"));
    }

    fn payload_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Binary),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec(("[a-z_]{1,8}".prop_map(Value::from), inner), 0..4)
                    .prop_map(Value::Map),
            ]
        })
    }

    fn action_strategy() -> impl Strategy<Value = String> {
        "[a-z_]{1,12}".prop_filter("framing actions have a fixed shape", |a| {
            a != actions::REQUEST && a != actions::REPLY
        })
    }

    fn envelope_strategy() -> impl Strategy<Value = Envelope> {
        prop_oneof![
            (action_strategy(), payload_strategy())
                .prop_map(|(action, payload)| Envelope::Message { action, payload }),
            (action_strategy(), any::<u64>(), payload_strategy()).prop_map(
                |(action, id, payload)| Envelope::Request {
                    action,
                    id,
                    payload,
                }
            ),
            (any::<u64>(), payload_strategy())
                .prop_map(|(id, result)| Envelope::Reply { id, result }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn envelope_roundtrips_through_codec(envelope in envelope_strategy()) {
            let frame = encode(&envelope)
                .unwrap_or_else(|e| panic!("encode failed: {e}"));
            let decoded = decode(&frame)
                .unwrap_or_else(|e| panic!("decode failed: {e}"));
            prop_assert_eq!(decoded, envelope);
        }
    }
}
