// Protocol envelope model and the two wire formats (JSON text, msgpack packed).
pub use self::action::{
    Action, FLAG_HAS_BACKLOG, FLAG_HAS_PRESENCE, FLAG_MODE_PRESENCE,
    FLAG_MODE_PRESENCE_SUBSCRIBE, FLAG_MODE_PUBLISH, FLAG_MODE_SUBSCRIBE, PresenceAction,
    flag_names,
};
pub use self::format::{RawFrame, WireFormat, decode_frame, encode_frame};
pub use self::message::{Data, Message, PresenceMessage};
pub use self::protocol::{ConnectionDetails, ErrorInfo, ProtocolMessage};

mod action;
mod format;
mod message;
mod protocol;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unrecognized action code {0}")]
    UnknownAction(u8),
    #[error("unrecognized presence action code {0}")]
    UnknownPresenceAction(u8),
    #[error("json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packed frame encode: {0}")]
    PackedEncode(#[from] rmp_serde::encode::Error),
    #[error("packed frame decode: {0}")]
    PackedDecode(#[from] rmp_serde::decode::Error),
}
