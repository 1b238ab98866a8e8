//! Reversible ledger mutations.

use std::time::Instant;

use super::{CollectorLedger, LedgerEntry, LedgerError};

/// The mutation a [`Command`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A Request datagram arrived.
    Request,
    /// An Acknowledge was written back for a Request.
    AckSent,
    /// The sender restarted its numbering.
    Reset,
}

/// One reversible change to a sender's ledger entry.
///
/// `apply` captures the sender's entry (or its absence) before mutating it;
/// `undo` puts that capture back.
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    sender_id: String,
    sequence: u64,
    at: Instant,
    prior: Option<Option<LedgerEntry>>,
}

impl Command {
    fn new(kind: CommandKind, sender_id: String, sequence: u64, at: Instant) -> Self {
        Command {
            kind,
            sender_id,
            sequence,
            at,
            prior: None,
        }
    }

    pub fn request(sender_id: String, sequence: u64, at: Instant) -> Self {
        Self::new(CommandKind::Request, sender_id, sequence, at)
    }

    pub fn ack_sent(sender_id: String, sequence: u64, at: Instant) -> Self {
        Self::new(CommandKind::AckSent, sender_id, sequence, at)
    }

    pub fn reset(sender_id: String, sequence: u64, at: Instant) -> Self {
        Self::new(CommandKind::Reset, sender_id, sequence, at)
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True between a successful `apply` and the matching `undo`.
    pub fn is_applied(&self) -> bool {
        self.prior.is_some()
    }

    /// Applies the command to `ledger`.
    ///
    /// # Errors
    /// A Request at or behind the sender's last seen sequence fails with
    /// `LedgerError::StaleSequence` and leaves the ledger untouched.
    pub fn apply(&mut self, ledger: &mut CollectorLedger) -> Result<(), LedgerError> {
        let prior = ledger.get(&self.sender_id).copied();

        if self.kind == CommandKind::Request {
            let last_serial = prior.map_or(0, |e| e.last_serial_seen);
            if self.sequence <= last_serial {
                return Err(LedgerError::StaleSequence {
                    last_serial,
                    sequence: self.sequence,
                });
            }
        }

        let entry = ledger.get_or_create(&self.sender_id, self.at);
        match self.kind {
            CommandKind::Request => {
                let delta = self.sequence - entry.last_serial_seen;
                if delta > 1 {
                    log::debug!(
                        "missed packets: client_id={} last_serial={} serial={} gap={}",
                        self.sender_id,
                        entry.last_serial_seen,
                        self.sequence,
                        delta - 1
                    );
                    entry.missed += delta - 1;
                }
                entry.received += 1;
                entry.last_serial_seen = self.sequence;
            }
            CommandKind::AckSent => entry.last_ack_sent = self.sequence,
            CommandKind::Reset => entry.reset_counters(),
        }

        self.prior = Some(prior);
        Ok(())
    }

    /// Reverts a previously applied command.
    ///
    /// # Errors
    /// Returns `LedgerError::NotApplied` if the command is not currently
    /// applied.
    pub fn undo(&mut self, ledger: &mut CollectorLedger) -> Result<(), LedgerError> {
        let prior = self.prior.take().ok_or_else(|| LedgerError::NotApplied {
            kind: self.kind,
            sender_id: self.sender_id.clone(),
        })?;
        ledger.restore(&self.sender_id, prior);
        Ok(())
    }
}
