//! Collector-side per-sender loss accounting.
//!
//! The ledger is owned by a single task (the collector orchestrator) and is
//! only ever mutated through [`Command`]s, each of which can be undone.

mod command;

pub use command::{Command, CommandKind};

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use chrono::Utc;
use thiserror::Error;

use crate::stats::{CollectorStats, SenderTotals};

/// Reasons a command is refused by the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Replayed or reordered Request; not a loss.
    #[error("packet received with old serial: {sequence} <= {last_serial}")]
    StaleSequence { last_serial: u64, sequence: u64 },

    /// Undo requested for a command that never took effect.
    #[error("{kind:?} command for {sender_id} was not applied")]
    NotApplied {
        kind: CommandKind,
        sender_id: String,
    },
}

/// Counters kept for one sender identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub last_serial_seen: u64,
    pub last_ack_sent: u64,
    pub received: u64,
    pub missed: u64,
    pub last_updated: Instant,
}

impl LedgerEntry {
    fn new(now: Instant) -> Self {
        LedgerEntry {
            last_serial_seen: 0,
            last_ack_sent: 0,
            received: 0,
            missed: 0,
            last_updated: now,
        }
    }

    fn reset_counters(&mut self) {
        self.received = 0;
        self.missed = 0;
        self.last_serial_seen = 0;
        self.last_ack_sent = 0;
    }

    /// True once the entry has been idle for longer than `idle_threshold`.
    pub fn is_cullable(&self, now: Instant, idle_threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_updated) > idle_threshold
    }
}

/// Per-sender state, keyed and ordered by sender id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorLedger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl CollectorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, sender_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(sender_id)
    }

    /// Returns the entry for `sender_id`, creating it if needed, and marks it
    /// as updated at `now`.
    pub fn get_or_create(&mut self, sender_id: &str, now: Instant) -> &mut LedgerEntry {
        let entry = self
            .entries
            .entry(sender_id.to_string())
            .or_insert_with(|| LedgerEntry::new(now));
        entry.last_updated = now;
        entry
    }

    fn restore(&mut self, sender_id: &str, prior: Option<LedgerEntry>) {
        match prior {
            Some(entry) => {
                self.entries.insert(sender_id.to_string(), entry);
            }
            None => {
                self.entries.remove(sender_id);
            }
        }
    }

    /// Totals for every tracked sender, ordered by sender id.
    pub fn snapshot_all(&self, now: Instant) -> CollectorStats {
        let senders = self
            .entries
            .iter()
            .map(|(id, e)| {
                SenderTotals::new(
                    id.clone(),
                    e.received,
                    e.missed,
                    e.last_serial_seen,
                    e.last_ack_sent,
                    now.saturating_duration_since(e.last_updated).as_secs_f64(),
                )
            })
            .collect();

        CollectorStats {
            generated_at: Utc::now(),
            senders,
        }
    }

    /// Removes every entry idle for longer than `idle_threshold`.
    ///
    /// Returns the number of entries removed.
    pub fn cull(&mut self, now: Instant, idle_threshold: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_cullable(now, idle_threshold));
        before - self.entries.len()
    }
}
