//! packetloss - UDP packet loss and round-trip time measurement.
//!
//! A probe (client) sends authenticated, sequence-numbered Requests to a
//! collector (server). The collector acknowledges every Request and counts,
//! per probe, how many sequence numbers never arrived. The probe matches
//! Acks to its Requests and reports loss in both directions and RTT.
//!
//! # Usage
//!
//! Run a collector:
//! ```bash
//! packetloss server --local 0.0.0.0:6666 --key secret
//! ```
//!
//! Run a probe against it:
//! ```bash
//! packetloss client --remote collector.example:6666 --key secret
//! ```

/// Authenticated datagram framing.
pub mod codec;
/// Command-line configuration and validation.
pub mod configuration;
/// HMAC key derivation, tagging and verification.
pub mod crypto;
/// Collector-side per-sender ledger and its reversible commands.
pub mod ledger;
/// Wire messages and their serialization.
pub mod packets;
/// Collector session loop and orchestrator.
pub mod receiver;
/// Probe session loops and orchestrator.
pub mod sender;
/// Sequence numbering and helpers shared by the session loops.
pub mod session;
/// Statistics snapshots and report sinks.
pub mod stats;
/// Probe-side tracking of sent and acknowledged sequence numbers.
pub mod tracker;
