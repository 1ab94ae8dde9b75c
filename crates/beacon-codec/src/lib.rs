//! Reversible payload encoding pipeline.
//!
//! # Purpose
//! Transforms user payloads into a wire-safe shape and back, recording each
//! transform as a slash-separated label in the message's `encoding` field.
//! Labels read left to right in application order; decoding strips them from
//! the right. The pipeline is a pure function of (payload, channel options,
//! wire format) and does no I/O.
//!
//! # Design notes
//! Each encoder owns its label detection, so the chain stays open: encode
//! walks the chain in declared order, decode walks it in reverse until no
//! encoder claims the trailing label.
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use beacon_wire::{Data, Message, PresenceMessage, WireFormat};

pub use crate::cipher::{
    AesCbcCipher, Cipher, CipherAlgorithm, CipherMode, CipherParams, IV_LEN,
};

mod cipher;

pub type Result<T> = std::result::Result<T, Error>;

// Codec errors are non-fatal: they reject one payload, never the channel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported payload type: wrap scalar values in a map or list")]
    PayloadTypeUnsupported,
    #[error("channel options request encryption but carry no cipher params")]
    EncryptionMisconfigured,
    #[error("cipher failure: {0}")]
    CipherFailure(String),
    #[error("malformed encoding label {0:?}")]
    MalformedEncodingLabel(String),
    #[error("base64 payload malformed: {0}")]
    Base64Malformed(#[from] base64::DecodeError),
    #[error("json payload malformed: {0}")]
    JsonMalformed(#[from] serde_json::Error),
    #[error("payload under utf-8 label is not valid utf-8")]
    Utf8Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Publish,
    Subscribe,
    Presence,
    PresenceSubscribe,
}

/// Per-channel codec and attach configuration.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub encrypted: bool,
    pub cipher: Option<CipherParams>,
    pub modes: Vec<ChannelMode>,
}

impl ChannelOptions {
    pub fn encrypted(params: CipherParams) -> Self {
        Self {
            encrypted: true,
            cipher: Some(params),
            modes: Vec::new(),
        }
    }
}

const LABEL_JSON: &str = "json";
const LABEL_UTF8: &str = "utf-8";
const LABEL_BASE64: &str = "base64";
const CIPHER_PREFIX: &str = "cipher+";

fn push_label(encoding: &mut Option<String>, label: &str) {
    match encoding {
        Some(existing) if !existing.is_empty() => {
            existing.push('/');
            existing.push_str(label);
        }
        _ => *encoding = Some(label.to_owned()),
    }
}

fn trailing_label(encoding: &Option<String>) -> Option<String> {
    encoding
        .as_deref()
        .filter(|labels| !labels.is_empty())
        .map(|labels| labels.rsplit('/').next().unwrap_or(labels).to_owned())
}

fn pop_label(encoding: &mut Option<String>) {
    let Some(labels) = encoding.as_mut() else {
        return;
    };
    match labels.rfind('/') {
        Some(index) => labels.truncate(index),
        None => *encoding = None,
    }
}

struct Context<'a> {
    options: &'a ChannelOptions,
    format: WireFormat,
}

/// One link of the pipeline: applies its transform on encode and reverses it
/// when it recognizes the trailing label on decode.
trait Encoder {
    fn name(&self) -> &'static str;
    fn encode(&self, data: &mut Data, encoding: &mut Option<String>, ctx: &Context) -> Result<()>;
    /// Returns true when the trailing label was consumed.
    fn decode(&self, data: &mut Data, encoding: &mut Option<String>, ctx: &Context)
    -> Result<bool>;
}

struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        LABEL_JSON
    }

    fn encode(&self, data: &mut Data, encoding: &mut Option<String>, _ctx: &Context) -> Result<()> {
        if let Data::Json(value) = data {
            *data = Data::String(serde_json::to_string(value)?);
            push_label(encoding, LABEL_JSON);
        }
        Ok(())
    }

    fn decode(
        &self,
        data: &mut Data,
        encoding: &mut Option<String>,
        _ctx: &Context,
    ) -> Result<bool> {
        if trailing_label(encoding).as_deref() != Some(LABEL_JSON) {
            return Ok(false);
        }
        let Data::String(text) = data else {
            return Err(Error::MalformedEncodingLabel(LABEL_JSON.into()));
        };
        *data = Data::Json(serde_json::from_str(text)?);
        pop_label(encoding);
        Ok(true)
    }
}

struct Utf8Encoder;

impl Encoder for Utf8Encoder {
    fn name(&self) -> &'static str {
        LABEL_UTF8
    }

    // Strings need no transform on the way out; the cipher encoder appends
    // the utf-8 label itself when it byte-ifies a string.
    fn encode(&self, _data: &mut Data, _encoding: &mut Option<String>, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        data: &mut Data,
        encoding: &mut Option<String>,
        _ctx: &Context,
    ) -> Result<bool> {
        if trailing_label(encoding).as_deref() != Some(LABEL_UTF8) {
            return Ok(false);
        }
        match data {
            Data::Binary(bytes) => {
                let text = String::from_utf8(bytes.to_vec()).map_err(|_| Error::Utf8Malformed)?;
                *data = Data::String(text);
            }
            Data::String(_) => {}
            _ => return Err(Error::Utf8Malformed),
        }
        pop_label(encoding);
        Ok(true)
    }
}

struct CipherEncoder;

impl Encoder for CipherEncoder {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn encode(&self, data: &mut Data, encoding: &mut Option<String>, ctx: &Context) -> Result<()> {
        if !ctx.options.encrypted {
            return Ok(());
        }
        let params = ctx
            .options
            .cipher
            .as_ref()
            .ok_or(Error::EncryptionMisconfigured)?;
        let plaintext: Vec<u8> = match data {
            Data::String(text) => {
                let bytes = text.as_bytes().to_vec();
                push_label(encoding, LABEL_UTF8);
                bytes
            }
            Data::Binary(bytes) => bytes.to_vec(),
            Data::None | Data::Json(_) => return Ok(()),
        };
        let ciphertext = AesCbcCipher::new(params.clone()).encrypt(&plaintext)?;
        *data = Data::Binary(Bytes::from(ciphertext));
        push_label(encoding, &params.label());
        Ok(())
    }

    fn decode(
        &self,
        data: &mut Data,
        encoding: &mut Option<String>,
        ctx: &Context,
    ) -> Result<bool> {
        let Some(label) = trailing_label(encoding) else {
            return Ok(false);
        };
        if !label.starts_with(CIPHER_PREFIX) {
            return Ok(false);
        }
        let params = ctx
            .options
            .cipher
            .as_ref()
            .ok_or(Error::EncryptionMisconfigured)?;
        if !params.matches_label(&label) {
            return Err(Error::CipherFailure(format!(
                "channel cipher is {} but payload was produced by {label}",
                params.label()
            )));
        }
        let Data::Binary(payload) = data else {
            return Err(Error::MalformedEncodingLabel(label));
        };
        let plaintext = AesCbcCipher::new(params.clone()).decrypt(payload)?;
        *data = Data::Binary(Bytes::from(plaintext));
        pop_label(encoding);
        Ok(true)
    }
}

struct Base64Encoder;

impl Encoder for Base64Encoder {
    fn name(&self) -> &'static str {
        LABEL_BASE64
    }

    fn encode(&self, data: &mut Data, encoding: &mut Option<String>, ctx: &Context) -> Result<()> {
        // Binary payloads survive a packed wire untouched; only a text wire
        // needs the base64 armor.
        if !ctx.format.is_text() {
            return Ok(());
        }
        if let Data::Binary(bytes) = data {
            *data = Data::String(BASE64.encode(bytes));
            push_label(encoding, LABEL_BASE64);
        }
        Ok(())
    }

    fn decode(
        &self,
        data: &mut Data,
        encoding: &mut Option<String>,
        _ctx: &Context,
    ) -> Result<bool> {
        if trailing_label(encoding).as_deref() != Some(LABEL_BASE64) {
            return Ok(false);
        }
        let Data::String(text) = data else {
            return Err(Error::MalformedEncodingLabel(LABEL_BASE64.into()));
        };
        *data = Data::Binary(Bytes::from(BASE64.decode(text.as_bytes())?));
        pop_label(encoding);
        Ok(true)
    }
}

const CHAIN: [&dyn Encoder; 4] = [&JsonEncoder, &Utf8Encoder, &CipherEncoder, &Base64Encoder];

fn encode_payload(
    data: &mut Data,
    encoding: &mut Option<String>,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    if data.is_none() {
        return Ok(());
    }
    // Raw scalars must arrive wrapped in a structured value; rejecting them
    // here leaves data and encoding untouched.
    if let Data::Json(value) = data
        && !value.is_object()
        && !value.is_array()
    {
        return Err(Error::PayloadTypeUnsupported);
    }
    let ctx = Context { options, format };
    for encoder in CHAIN {
        encoder.encode(data, encoding, &ctx)?;
    }
    Ok(())
}

fn decode_payload(
    data: &mut Data,
    encoding: &mut Option<String>,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    let ctx = Context { options, format };
    loop {
        let Some(label) = trailing_label(encoding) else {
            if encoding.as_deref() == Some("") {
                *encoding = None;
            }
            return Ok(());
        };
        let mut consumed = false;
        for encoder in CHAIN.iter().rev() {
            if encoder.decode(data, encoding, &ctx)? {
                consumed = true;
                break;
            }
        }
        if !consumed {
            return Err(Error::MalformedEncodingLabel(label));
        }
    }
}

/// Encode an outbound message payload in place.
pub fn encode_message(
    message: &mut Message,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    encode_payload(&mut message.data, &mut message.encoding, options, format)
}

/// Decode an inbound message payload in place, stripping labels from the
/// right. On failure the message keeps its partially decoded state and the
/// unconsumed labels.
pub fn decode_message(
    message: &mut Message,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    decode_payload(&mut message.data, &mut message.encoding, options, format)
}

pub fn encode_presence(
    presence: &mut PresenceMessage,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    encode_payload(&mut presence.data, &mut presence.encoding, options, format)
}

pub fn decode_presence(
    presence: &mut PresenceMessage,
    options: &ChannelOptions,
    format: WireFormat,
) -> Result<()> {
    decode_payload(&mut presence.data, &mut presence.encoding, options, format)
}
