//! User-level message envelopes and the opaque payload type.
//!
//! # Purpose
//! `Message` and `PresenceMessage` are the units applications publish and
//! receive. `Data` carries the payload through the codec pipeline: the
//! pipeline rewrites `data` and `encoding` in tandem, so both wire formats
//! see only strings, bytes, or structured values.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::PresenceAction;

/// Opaque message payload.
///
/// `encoding` labels describe how `data` was produced; an empty label list
/// means the payload is in its original user-supplied shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Data {
    #[default]
    None,
    String(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl Data {
    pub fn is_none(&self) -> bool {
        matches!(self, Data::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Data::Binary(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_owned())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for Data {
    fn from(value: Bytes) -> Self {
        Data::Binary(value)
    }
}

impl From<serde_json::Value> for Data {
    fn from(value: serde_json::Value) -> Self {
        Data::Json(value)
    }
}

impl Serialize for Data {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Data::None => serializer.serialize_none(),
            Data::String(value) => serializer.serialize_str(value),
            Data::Binary(value) => serializer.serialize_bytes(value),
            Data::Json(value) => value.serialize(serializer),
        }
    }
}

struct DataVisitor;

impl<'de> Visitor<'de> for DataVisitor {
    type Value = Data;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string, byte buffer, or structured value")
    }

    fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Data, E> {
        Ok(Data::String(value.to_owned()))
    }

    fn visit_string<E: serde::de::Error>(self, value: String) -> Result<Data, E> {
        Ok(Data::String(value))
    }

    fn visit_bytes<E: serde::de::Error>(self, value: &[u8]) -> Result<Data, E> {
        Ok(Data::Binary(Bytes::copy_from_slice(value)))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, value: Vec<u8>) -> Result<Data, E> {
        Ok(Data::Binary(Bytes::from(value)))
    }

    // Scalars are tolerated on receive; the encode pipeline refuses to send them.
    fn visit_bool<E: serde::de::Error>(self, value: bool) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::from(value)))
    }

    fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::from(value)))
    }

    fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::from(value)))
    }

    fn visit_f64<E: serde::de::Error>(self, value: f64) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::from(value)))
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Data, E> {
        Ok(Data::None)
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Data, E> {
        Ok(Data::None)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Data, D::Error> {
        deserializer.deserialize_any(DataVisitor)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Data, A::Error> {
        let value =
            serde_json::Value::deserialize(serde::de::value::SeqAccessDeserializer::new(seq))?;
        Ok(Data::Json(value))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Data, A::Error> {
        let value =
            serde_json::Value::deserialize(serde::de::value::MapAccessDeserializer::new(map))?;
        Ok(Data::Json(value))
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DataVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Data::is_none")]
    pub data: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// A structurally empty message carries nothing a peer could use; the
    /// wire layer drops such entries instead of sending them.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.name.is_none()
            && self.data.is_none()
            && self.client_id.is_none()
            && self.extras.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Data::is_none")]
    pub data: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, data: impl Into<Data>) -> Self {
        Self {
            action,
            id: None,
            connection_id: None,
            client_id: None,
            data: data.into(),
            encoding: None,
            timestamp: None,
        }
    }

    /// Key identifying one member of a presence set: a client may be present
    /// once per connection.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or(""),
            self.connection_id.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_deserializes_each_wire_shape() {
        let string: Data = serde_json::from_str("\"hello\"").expect("string");
        assert_eq!(string, Data::String("hello".into()));

        let json: Data = serde_json::from_str("{\"k\":[1,2]}").expect("map");
        assert_eq!(json, Data::Json(serde_json::json!({"k": [1, 2]})));

        let list: Data = serde_json::from_str("[1,2,3]").expect("list");
        assert_eq!(list, Data::Json(serde_json::json!([1, 2, 3])));

        let number: Data = serde_json::from_str("10").expect("number");
        assert_eq!(number, Data::Json(serde_json::json!(10)));
    }

    #[test]
    fn data_round_trips_bytes_through_packed_encoding() {
        let data = Data::Binary(Bytes::from_static(&[1, 2, 3]));
        let packed = rmp_serde::to_vec_named(&data).expect("pack");
        let back: Data = rmp_serde::from_slice(&packed).expect("unpack");
        assert_eq!(back, data);
    }

    #[test]
    fn message_serializes_without_absent_fields() {
        let message = Message::new("greeting", "hi");
        let json = serde_json::to_string(&message).expect("serialize");
        assert_eq!(json, "{\"name\":\"greeting\",\"data\":\"hi\"}");
    }

    #[test]
    fn empty_message_is_structurally_empty() {
        assert!(Message::default().is_empty());
        assert!(!Message::new("x", Data::None).is_empty());
        let with_data = Message {
            data: Data::from("x"),
            ..Message::default()
        };
        assert!(!with_data.is_empty());
    }

    #[test]
    fn timestamp_serializes_as_epoch_milliseconds() {
        let message = Message {
            timestamp: Some(DateTime::from_timestamp_millis(1_500_000_000_123).expect("ts")),
            ..Message::default()
        };
        let json = serde_json::to_string(&message).expect("serialize");
        assert_eq!(json, "{\"timestamp\":1500000000123}");
    }

    #[test]
    fn presence_member_key_pairs_client_and_connection() {
        let mut presence = PresenceMessage::new(PresenceAction::Enter, "here");
        presence.client_id = Some("alice".into());
        presence.connection_id = Some("conn-1".into());
        assert_eq!(presence.member_key(), "alice:conn-1");
    }
}
