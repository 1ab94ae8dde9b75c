// Protocol action codes and flag bits. The numeric values are the wire
// contract shared with every peer implementation; never reorder them.
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    #[default]
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Action::Heartbeat,
        Action::Ack,
        Action::Nack,
        Action::Connect,
        Action::Connected,
        Action::Disconnect,
        Action::Disconnected,
        Action::Close,
        Action::Closed,
        Action::Error,
        Action::Attach,
        Action::Attached,
        Action::Detach,
        Action::Detached,
        Action::Presence,
        Action::Message,
        Action::Sync,
    ];
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Error> {
        Action::ALL
            .into_iter()
            .find(|action| *action as u8 == code)
            .ok_or(Error::UnknownAction(code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Error> {
        [
            PresenceAction::Absent,
            PresenceAction::Present,
            PresenceAction::Enter,
            PresenceAction::Leave,
            PresenceAction::Update,
        ]
        .into_iter()
        .find(|action| *action as u8 == code)
        .ok_or(Error::UnknownPresenceAction(code))
    }
}

// Flags are allocated from the low-order bit upward.
pub const FLAG_HAS_PRESENCE: u32 = 1 << 0;
pub const FLAG_HAS_BACKLOG: u32 = 1 << 1;

// Channel mode bits carried on Attach frames; the high half of the word is
// reserved for them.
pub const FLAG_MODE_PRESENCE: u32 = 1 << 16;
pub const FLAG_MODE_PUBLISH: u32 = 1 << 17;
pub const FLAG_MODE_SUBSCRIBE: u32 = 1 << 18;
pub const FLAG_MODE_PRESENCE_SUBSCRIBE: u32 = 1 << 19;

/// Names of the set flag bits, for log lines.
pub fn flag_names(flags: u32) -> Vec<&'static str> {
    let mut names = Vec::new();
    if flags & FLAG_HAS_PRESENCE != 0 {
        names.push("has_presence");
    }
    if flags & FLAG_HAS_BACKLOG != 0 {
        names.push("has_backlog");
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_are_fixed() {
        let expected: [(Action, u8); 17] = [
            (Action::Heartbeat, 0),
            (Action::Ack, 1),
            (Action::Nack, 2),
            (Action::Connect, 3),
            (Action::Connected, 4),
            (Action::Disconnect, 5),
            (Action::Disconnected, 6),
            (Action::Close, 7),
            (Action::Closed, 8),
            (Action::Error, 9),
            (Action::Attach, 10),
            (Action::Attached, 11),
            (Action::Detach, 12),
            (Action::Detached, 13),
            (Action::Presence, 14),
            (Action::Message, 15),
            (Action::Sync, 16),
        ];
        for (action, code) in expected {
            assert_eq!(u8::from(action), code, "{action:?}");
            assert_eq!(Action::try_from(code).expect("known code"), action);
        }
    }

    #[test]
    fn unknown_action_code_is_rejected() {
        let err = Action::try_from(17).expect_err("out of range");
        assert!(matches!(err, Error::UnknownAction(17)));
    }

    #[test]
    fn presence_action_codes_are_fixed() {
        assert_eq!(u8::from(PresenceAction::Absent), 0);
        assert_eq!(u8::from(PresenceAction::Present), 1);
        assert_eq!(u8::from(PresenceAction::Enter), 2);
        assert_eq!(u8::from(PresenceAction::Leave), 3);
        assert_eq!(u8::from(PresenceAction::Update), 4);
        assert!(PresenceAction::try_from(5).is_err());
    }

    #[test]
    fn actions_serialize_as_integers() {
        let json = serde_json::to_string(&Action::Message).expect("serialize");
        assert_eq!(json, "15");
        let back: Action = serde_json::from_str("16").expect("deserialize");
        assert_eq!(back, Action::Sync);
    }

    #[test]
    fn flag_bits_from_low_order() {
        assert_eq!(FLAG_HAS_PRESENCE, 1);
        assert_eq!(FLAG_HAS_BACKLOG, 2);
        assert_eq!(
            flag_names(FLAG_HAS_PRESENCE | FLAG_HAS_BACKLOG),
            vec!["has_presence", "has_backlog"]
        );
    }
}
