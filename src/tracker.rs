//! Client-side bookkeeping of sent probes and their acknowledgements.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::stats::ClientStats;

/// Reasons an acknowledgement is not recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Ack for a sequence number the client has not sent yet.
    #[error("ack for sequence {sequence} which has not been sent yet (last sent {last_sent})")]
    AckAhead { sequence: u64, last_sent: u64 },

    /// Ack at or behind the newest acknowledged sequence number.
    #[error("ack for old sequence {sequence} (last ack {last_ack})")]
    StaleAck { sequence: u64, last_ack: u64 },
}

/// What is known about one sequence number in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRecord {
    pub sequence: u64,
    pub sent_at: Option<Instant>,
    pub acked_at: Option<Instant>,
}

impl SentRecord {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn is_acked(&self) -> bool {
        self.acked_at.is_some()
    }

    /// Round-trip time, if both ends of the exchange were observed.
    pub fn rtt(&self) -> Option<Duration> {
        match (self.sent_at, self.acked_at) {
            (Some(sent), Some(acked)) => Some(acked.saturating_duration_since(sent)),
            _ => None,
        }
    }
}

/// Per-sequence table of the probes sent during the current reporting window.
///
/// `last_sent` and `last_ack` survive [`ProbeTracker::reset`] so that an ack
/// replayed after a reporting boundary is still rejected.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    records: HashMap<u64, SentRecord>,
    last_sent: u64,
    last_ack: u64,
}

impl ProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn last_ack(&self) -> u64 {
        self.last_ack
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sequence: u64) -> Option<&SentRecord> {
        self.records.get(&sequence)
    }

    /// Records that `sequence` was transmitted at `now`.
    pub fn record_send(&mut self, sequence: u64, now: Instant) {
        self.records.insert(
            sequence,
            SentRecord {
                sequence,
                sent_at: Some(now),
                acked_at: None,
            },
        );
        self.last_sent = sequence;
    }

    /// Drops the record of a send whose transmission failed.
    ///
    /// `last_sent` is left alone: the sequence number is consumed either way.
    pub fn forget_send(&mut self, sequence: u64) {
        if let Some(record) = self.records.get(&sequence) {
            if !record.is_acked() {
                self.records.remove(&sequence);
            }
        }
    }

    /// Records that an acknowledgement for `sequence` arrived at `now`.
    ///
    /// # Errors
    /// * `TrackerError::AckAhead` if `sequence` is beyond the last sent one.
    /// * `TrackerError::StaleAck` if `sequence` is not newer than the last ack.
    pub fn record_ack(&mut self, sequence: u64, now: Instant) -> Result<(), TrackerError> {
        if sequence > self.last_sent {
            return Err(TrackerError::AckAhead {
                sequence,
                last_sent: self.last_sent,
            });
        }
        if sequence <= self.last_ack {
            return Err(TrackerError::StaleAck {
                sequence,
                last_ack: self.last_ack,
            });
        }

        self.records
            .entry(sequence)
            .and_modify(|record| record.acked_at = Some(now))
            .or_insert(SentRecord {
                sequence,
                sent_at: None,
                acked_at: Some(now),
            });
        self.last_ack = sequence;

        Ok(())
    }

    /// Aggregates the current window into a [`ClientStats`].
    pub fn snapshot(&self) -> ClientStats {
        let mut stats = ClientStats::empty();
        let mut min_rtt: Option<Duration> = None;
        let mut max_rtt: Option<Duration> = None;
        let mut sum_rtt = Duration::ZERO;

        for record in self.records.values() {
            match (record.is_sent(), record.is_acked()) {
                (true, true) => {
                    stats.sent_and_acked += 1;
                    if let Some(rtt) = record.rtt() {
                        min_rtt = Some(min_rtt.map_or(rtt, |m| m.min(rtt)));
                        max_rtt = Some(max_rtt.map_or(rtt, |m| m.max(rtt)));
                        sum_rtt += rtt;
                    }
                }
                (true, false) => stats.sent_not_acked += 1,
                (false, true) => stats.acked_not_sent += 1,
                (false, false) => {
                    log::error!(
                        "record for sequence {} is neither sent nor acked",
                        record.sequence
                    );
                    stats.invalid_records += 1;
                    continue;
                }
            }
            stats.total += 1;
        }

        stats.sent = stats.sent_and_acked + stats.sent_not_acked;
        stats.acked = stats.sent_and_acked + stats.acked_not_sent;
        stats.sent_and_acked_percent = percent(stats.sent_and_acked, stats.total);
        stats.sent_not_acked_percent = percent(stats.sent_not_acked, stats.total);
        stats.acked_not_sent_percent = percent(stats.acked_not_sent, stats.total);

        stats.min_rtt_ms = min_rtt.map(duration_ms);
        stats.max_rtt_ms = max_rtt.map(duration_ms);
        if stats.sent_and_acked > 0 {
            stats.avg_rtt_ms = Some(duration_ms(sum_rtt) / stats.sent_and_acked as f64);
        }

        stats
    }

    /// Clears all records, starting a new reporting window.
    pub fn reset(&mut self) {
        self.records.clear();
    }
}

/// Percentage of `part` in `total`; 0 when `total` is 0.
pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
