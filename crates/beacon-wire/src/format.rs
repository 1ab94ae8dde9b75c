// Frame serialization for the two supported wire formats. The format is
// negotiated once per connection and never changes for its lifetime.
use bytes::Bytes;

use crate::Result;
use crate::protocol::ProtocolMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Textual JSON envelopes; binary payloads travel base64-armored.
    #[default]
    Json,
    /// Compact msgpack envelopes with string keys; payloads stay binary.
    Packed,
}

impl WireFormat {
    pub fn is_text(self) -> bool {
        matches!(self, WireFormat::Json)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Packed => "application/x-msgpack",
        }
    }
}

/// A frame as handed to or received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawFrame::Text(text) => text.as_bytes(),
            RawFrame::Binary(bytes) => bytes,
        }
    }
}

/// Serialize a frame for the wire, pruning structurally empty content first.
pub fn encode_frame(frame: &ProtocolMessage, format: WireFormat) -> Result<RawFrame> {
    let mut frame = frame.clone();
    frame.prune();
    match format {
        WireFormat::Json => Ok(RawFrame::Text(serde_json::to_string(&frame)?)),
        WireFormat::Packed => Ok(RawFrame::Binary(Bytes::from(rmp_serde::to_vec_named(
            &frame,
        )?))),
    }
}

/// Deserialize an inbound frame and propagate envelope metadata into the
/// contained messages.
pub fn decode_frame(raw: &RawFrame, format: WireFormat) -> Result<ProtocolMessage> {
    let mut frame: ProtocolMessage = match format {
        WireFormat::Json => serde_json::from_slice(raw.as_bytes())?,
        WireFormat::Packed => rmp_serde::from_slice(raw.as_bytes())?,
    };
    frame.apply_inherited_fields();
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::message::{Data, Message};

    fn message_frame() -> ProtocolMessage {
        let mut frame = ProtocolMessage::with_channel(Action::Message, "news");
        frame.id = Some("abc".into());
        frame.connection_id = Some("conn-1".into());
        frame.msg_serial = Some(3);
        frame.messages = Some(vec![Message::new("greeting", "hi")]);
        frame
    }

    #[test]
    fn json_frame_round_trips() {
        let frame = message_frame();
        let raw = encode_frame(&frame, WireFormat::Json).expect("encode");
        let RawFrame::Text(text) = &raw else {
            panic!("json frames are text");
        };
        assert!(text.contains("\"action\":15"));
        let decoded = decode_frame(&raw, WireFormat::Json).expect("decode");
        assert_eq!(decoded.channel.as_deref(), Some("news"));
        assert_eq!(decoded.msg_serial, Some(3));
    }

    #[test]
    fn packed_frame_round_trips() {
        let frame = message_frame();
        let raw = encode_frame(&frame, WireFormat::Packed).expect("encode");
        assert!(matches!(raw, RawFrame::Binary(_)));
        let decoded = decode_frame(&raw, WireFormat::Packed).expect("decode");
        assert_eq!(decoded.action, Action::Message);
        assert_eq!(
            decoded.messages.as_ref().expect("messages")[0]
                .data
                .as_str(),
            Some("hi")
        );
    }

    #[test]
    fn packed_frame_preserves_binary_payloads() {
        let mut frame = message_frame();
        frame.messages = Some(vec![Message {
            data: Data::Binary(Bytes::from_static(&[0x01, 0x02, 0xff])),
            ..Message::default()
        }]);
        let raw = encode_frame(&frame, WireFormat::Packed).expect("encode");
        let decoded = decode_frame(&raw, WireFormat::Packed).expect("decode");
        assert_eq!(
            decoded.messages.expect("messages")[0].data.as_bytes(),
            Some(&[0x01u8, 0x02, 0xff][..])
        );
    }

    #[test]
    fn decode_applies_inherited_fields() {
        let raw = RawFrame::Text(
            "{\"action\":15,\"id\":\"abc\",\"channel\":\"news\",\
             \"timestamp\":1700000000000,\"messages\":[{\"data\":\"x\"}]}"
            .into(),
        );
        let decoded = decode_frame(&raw, WireFormat::Json).expect("decode");
        let message = &decoded.messages.expect("messages")[0];
        assert_eq!(message.id.as_deref(), Some("abc:0"));
        assert_eq!(
            message.timestamp.expect("timestamp").timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[test]
    fn unknown_action_fails_decode() {
        let raw = RawFrame::Text("{\"action\":42}".into());
        assert!(decode_frame(&raw, WireFormat::Json).is_err());
    }
}
