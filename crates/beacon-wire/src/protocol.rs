//! The wire envelope exchanged with the broker.
//!
//! # Purpose
//! `ProtocolMessage` is the single frame type for both directions. Outbound
//! frames are pruned of structurally empty content before serialization;
//! inbound frames propagate envelope metadata down into the messages they
//! carry before the channel layer sees them.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::message::{Message, PresenceMessage};

/// Error descriptor carried in protocol frames and surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            href: None,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(href) = &self.href {
            write!(f, " ({href})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

/// Connection attributes the broker reports on `Connected`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inbound_rate: Option<u64>,
    /// Milliseconds the broker retains connection state for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    pub fn with_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            action,
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Drop structurally empty content before the frame is serialized.
    ///
    /// Empty `channel` strings and structurally empty messages must not reach
    /// the wire; an array left with no entries is omitted entirely.
    pub fn prune(&mut self) {
        if self.channel.as_deref() == Some("") {
            self.channel = None;
        }
        if let Some(messages) = &mut self.messages {
            messages.retain(|message| !message.is_empty());
            if messages.is_empty() {
                self.messages = None;
            }
        }
        if let Some(presence) = &mut self.presence
            && presence.is_empty()
        {
            self.presence = None;
        }
    }

    /// Propagate envelope metadata into the contained messages.
    ///
    /// Messages missing a timestamp inherit the frame's; a message missing an
    /// id gets `<frame id>:<index>`; a missing connection id inherits the
    /// frame's connection id. Runs once per inbound frame, before dispatch.
    pub fn apply_inherited_fields(&mut self) {
        let timestamp = self.timestamp;
        let frame_id = self.id.clone();
        let connection_id = self.connection_id.clone();
        if let Some(messages) = &mut self.messages {
            for (index, message) in messages.iter_mut().enumerate() {
                if message.timestamp.is_none() {
                    message.timestamp = timestamp;
                }
                if message.id.is_none()
                    && let Some(frame_id) = &frame_id
                {
                    message.id = Some(format!("{frame_id}:{index}"));
                }
                if message.connection_id.is_none() {
                    message.connection_id = connection_id.clone();
                }
            }
        }
        if let Some(presence) = &mut self.presence {
            for (index, entry) in presence.iter_mut().enumerate() {
                if entry.timestamp.is_none() {
                    entry.timestamp = timestamp;
                }
                if entry.id.is_none()
                    && let Some(frame_id) = &frame_id
                {
                    entry.id = Some(format!("{frame_id}:{index}"));
                }
                if entry.connection_id.is_none() {
                    entry.connection_id = connection_id.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Data;

    #[test]
    fn prune_drops_empty_channel_and_messages() {
        let mut frame = ProtocolMessage::with_channel(Action::Message, "");
        frame.messages = Some(vec![Message::default(), Message::new("keep", "x")]);
        frame.prune();
        assert!(frame.channel.is_none());
        let messages = frame.messages.expect("messages kept");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name.as_deref(), Some("keep"));
    }

    #[test]
    fn prune_omits_array_when_all_entries_empty() {
        let mut frame = ProtocolMessage::new(Action::Message);
        frame.messages = Some(vec![Message::default(), Message::default()]);
        frame.prune();
        assert!(frame.messages.is_none());
    }

    #[test]
    fn inherited_fields_follow_envelope() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_000).expect("ts");
        let mut frame = ProtocolMessage::with_channel(Action::Message, "news");
        frame.id = Some("abc".into());
        frame.connection_id = Some("conn-9".into());
        frame.timestamp = Some(timestamp);
        frame.messages = Some(vec![
            Message {
                data: Data::from("x"),
                ..Message::default()
            },
            Message {
                id: Some("z".into()),
                data: Data::from("y"),
                ..Message::default()
            },
        ]);
        frame.apply_inherited_fields();

        let messages = frame.messages.expect("messages");
        assert_eq!(messages[0].id.as_deref(), Some("abc:0"));
        assert_eq!(messages[1].id.as_deref(), Some("z"));
        for message in &messages {
            assert_eq!(message.timestamp, Some(timestamp));
            assert_eq!(message.connection_id.as_deref(), Some("conn-9"));
        }
    }

    #[test]
    fn serialized_frame_omits_absent_fields() {
        let mut frame = ProtocolMessage::new(Action::Heartbeat);
        frame.prune();
        let json = serde_json::to_string(&frame).expect("serialize");
        assert_eq!(json, "{\"action\":0}");
    }

    #[test]
    fn error_info_displays_code_and_message() {
        let error = ErrorInfo::new(40000, 400, "bad request");
        assert_eq!(error.to_string(), "[40000] bad request");
    }
}
