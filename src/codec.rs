//! Authenticated datagram framing.
//!
//! A datagram is the [`TAG_LENGTH`]-byte HMAC of the serialized message
//! followed by the serialized message itself:
//!
//! ```text
//! +------------------------------+--------------------------------+
//! | tag (32 bytes)               | message body (bincode)         |
//! +------------------------------+--------------------------------+
//! ```
//!
//! Decoding is all-or-nothing: the tag is verified before the body is parsed,
//! and a failure never yields a partial message.

use thiserror::Error;

use crate::{
    crypto::{HmacKey, TAG_LENGTH},
    packets::{is_valid_sender_id, Message, MAX_MESSAGE_SIZE},
};

/// Largest datagram either peer needs to read.
pub const MAX_DATAGRAM_SIZE: usize = TAG_LENGTH + MAX_MESSAGE_SIZE;

/// Errors produced while framing or unframing a datagram.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The datagram cannot even hold a tag.
    #[error("datagram of {0} bytes is shorter than the {TAG_LENGTH}-byte tag")]
    Truncated(usize),

    /// The datagram is larger than any valid message.
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM_SIZE}-byte maximum")]
    Oversized(usize),

    /// The recomputed tag does not match the received one.
    #[error("authentication tag mismatch")]
    Authentication,

    /// The body passed authentication but is not a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message carries a sender id that may not be put on the wire.
    #[error("invalid sender id {0:?}")]
    InvalidSenderId(String),
}

/// Serializes `message` and prefixes it with its authentication tag.
///
/// # Errors
/// Returns `CodecError::InvalidSenderId` if the sender id is empty, longer
/// than 64 bytes or not ASCII.
pub fn encode(message: &Message, key: &HmacKey) -> Result<Vec<u8>, CodecError> {
    if !is_valid_sender_id(&message.sender_id) {
        return Err(CodecError::InvalidSenderId(message.sender_id.clone()));
    }

    let body = message
        .to_bytes()
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    let tag = key.compute(&body);

    let mut out = Vec::with_capacity(TAG_LENGTH + body.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&body);

    log::trace!(
        "encoded {} seq={} ({} bytes)",
        message.kind,
        message.sequence,
        out.len()
    );

    Ok(out)
}

/// Verifies and deserializes a datagram.
///
/// # Errors
/// * `CodecError::Truncated` if `data` is shorter than the tag.
/// * `CodecError::Oversized` if `data` exceeds [`MAX_DATAGRAM_SIZE`].
/// * `CodecError::Authentication` if the tag does not match.
/// * `CodecError::Malformed` if the authenticated body is not a valid message.
pub fn decode(data: &[u8], key: &HmacKey) -> Result<Message, CodecError> {
    if data.len() < TAG_LENGTH {
        return Err(CodecError::Truncated(data.len()));
    }
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::Oversized(data.len()));
    }

    let (tag, body) = data.split_at(TAG_LENGTH);
    if !key.verify(body, tag) {
        return Err(CodecError::Authentication);
    }

    let message = Message::from_bytes(body).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if !is_valid_sender_id(&message.sender_id) {
        return Err(CodecError::Malformed(format!(
            "invalid sender id of {} bytes",
            message.sender_id.len()
        )));
    }

    Ok(message)
}
