//! Probe message structures and their serialized form.
//!
//! A message is serialized with bincode using fixed-width little-endian
//! integers:
//!
//! ```text
//! +----------------+----------------+------------------+---------------------+
//! | kind (u32 LE)  | sequence (u64) | id length (u64)  | sender id (ASCII)   |
//! +----------------+----------------+------------------+---------------------+
//! ```
//!
//! `kind` is the variant index of [`MessageKind`] (Request = 0,
//! Acknowledge = 1, Reset = 2). The sender id is at most
//! [`SENDER_ID_MAX_LENGTH`] bytes, so a message body never exceeds
//! [`MAX_MESSAGE_SIZE`] bytes.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Maximum length in bytes of a sender identity.
pub const SENDER_ID_MAX_LENGTH: usize = 64;

/// Upper bound on the serialized size of a message body.
pub const MAX_MESSAGE_SIZE: usize = 4 + 8 + 8 + SENDER_ID_MAX_LENGTH;

/// Sequence number reserved for the Reset handshake.
pub const RESET_SEQUENCE: u64 = 0;

/// Role of a message in the probe protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Probe sent by the client, to be acknowledged by the collector.
    Request,
    /// Collector reply echoing a Request's sequence number.
    Acknowledge,
    /// Client asks the collector to forget its counters.
    Reset,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Acknowledge => write!(f, "ACKNOWLEDGE"),
            MessageKind::Reset => write!(f, "RESET"),
        }
    }
}

/// The unit carried by every datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sequence: u64,
    pub sender_id: String,
}

impl Message {
    pub fn request(sequence: u64, sender_id: &str) -> Self {
        Message {
            kind: MessageKind::Request,
            sequence,
            sender_id: sender_id.to_string(),
        }
    }

    pub fn acknowledge(sequence: u64, sender_id: &str) -> Self {
        Message {
            kind: MessageKind::Acknowledge,
            sequence,
            sender_id: sender_id.to_string(),
        }
    }

    /// Builds the Reset sent once at client startup.
    pub fn reset(sender_id: &str) -> Self {
        Message {
            kind: MessageKind::Reset,
            sequence: RESET_SEQUENCE,
            sender_id: sender_id.to_string(),
        }
    }

    /// Serializes the message body.
    ///
    /// # Errors
    /// Returns an error if the message cannot be represented on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        wire_options().serialize(self)
    }

    /// Deserializes a message body.
    ///
    /// # Errors
    /// Returns an error for truncated input, trailing bytes, unknown kinds or
    /// bodies larger than [`MAX_MESSAGE_SIZE`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, bincode::Error> {
        wire_options().deserialize(buf)
    }
}

/// Returns true if `id` is a valid sender identity.
pub fn is_valid_sender_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= SENDER_ID_MAX_LENGTH && id.is_ascii()
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .reject_trailing_bytes()
}
