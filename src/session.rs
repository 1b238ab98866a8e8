//! Per-probe session state shared by the session loops.

use std::{io, net::SocketAddr};

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::{
    codec::{self, CodecError},
    crypto::HmacKey,
    packets::{Message, MessageKind, RESET_SEQUENCE},
};

/// Capacity of the channel between the session loops and the orchestrator.
///
/// Producers wait when it is full.
pub const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Per-datagram failures observed by the session loops. None of them is fatal.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unexpected {0} message")]
    UnexpectedKind(MessageKind),

    #[error("message for another sender {0:?}")]
    ForeignSender(String),

    #[error("sequence numbers exhausted after {0}")]
    SequenceExhausted(u64),
}

/// Sequence numbering for one sender identity.
///
/// Data sequence numbers start at 1; 0 belongs to the Reset handshake.
pub struct Session {
    sender_id: String,
    next_seq: u64,
}

impl Session {
    pub fn new(sender_id: String) -> Session {
        Session {
            sender_id,
            next_seq: RESET_SEQUENCE + 1,
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Returns the next data sequence number.
    ///
    /// Numbers are never reused. Running past `u64::MAX` is reported as
    /// `SessionError::SequenceExhausted` instead of wrapping.
    pub fn generate_sequence_number(&mut self) -> Result<u64, SessionError> {
        let seq = self.next_seq;
        if seq == u64::MAX {
            return Err(SessionError::SequenceExhausted(seq));
        }
        self.next_seq += 1;
        Ok(seq)
    }

    /// Builds the Reset message announcing this session to the collector.
    pub fn reset_message(&self) -> Message {
        Message::reset(&self.sender_id)
    }

    /// Builds a Request carrying the next sequence number.
    pub fn next_request(&mut self) -> Result<Message, SessionError> {
        let seq = self.generate_sequence_number()?;
        Ok(Message::request(seq, &self.sender_id))
    }
}

/// Encodes `message` and writes it to the socket's connected peer.
pub async fn send_message(
    socket: &UdpSocket,
    key: &HmacKey,
    message: &Message,
) -> Result<(), SessionError> {
    let datagram = codec::encode(message, key)?;
    socket.send(&datagram).await?;
    Ok(())
}

/// Encodes `message` and writes it to `peer`.
pub async fn send_message_to(
    socket: &UdpSocket,
    key: &HmacKey,
    message: &Message,
    peer: SocketAddr,
) -> Result<(), SessionError> {
    let datagram = codec::encode(message, key)?;
    socket.send_to(&datagram, peer).await?;
    Ok(())
}

/// Logs a datagram that was dropped, at a level matching its cause.
///
/// Authentication failures stay at debug level and never include tag bytes.
pub fn log_discard(err: &SessionError, peer: SocketAddr) {
    match err {
        SessionError::Codec(CodecError::Authentication) => {
            log::debug!("dropped datagram from {}: {}", peer, err)
        }
        SessionError::Transport(_) | SessionError::SequenceExhausted(_) => {
            log::error!("dropped datagram from {}: {}", peer, err)
        }
        _ => log::warn!("dropped datagram from {}: {}", peer, err),
    }
}

/// Generates a random 32-character hexadecimal sender identity.
pub fn random_sender_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}
