//! Statistics snapshots and the sinks they are published to.
//!
//! The orchestrators hand every periodic (and the final) snapshot to a
//! [`ReportSink`]. The sinks here cover structured log lines and plain
//! text, JSON or CSV on stdout.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tracker::percent;

/// Output format for statistics reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `info` log lines through the logger.
    #[default]
    Log,
    /// Human-readable text output.
    Text,
    /// JSON output for machine consumption.
    Json,
    /// CSV output for spreadsheet import.
    Csv,
}

/// Probe-side aggregate over one reporting window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub generated_at: DateTime<Utc>,
    /// Records in the window, excluding invalid ones.
    pub total: u64,
    pub sent: u64,
    pub acked: u64,
    pub sent_and_acked: u64,
    /// In flight or lost.
    pub sent_not_acked: u64,
    /// Late, duplicate or otherwise anomalous acknowledgements.
    pub acked_not_sent: u64,
    pub sent_and_acked_percent: f64,
    pub sent_not_acked_percent: f64,
    pub acked_not_sent_percent: f64,
    pub min_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    /// Records that were neither sent nor acked.
    pub invalid_records: u64,
}

impl ClientStats {
    pub fn empty() -> Self {
        ClientStats {
            generated_at: Utc::now(),
            total: 0,
            sent: 0,
            acked: 0,
            sent_and_acked: 0,
            sent_not_acked: 0,
            acked_not_sent: 0,
            sent_and_acked_percent: 0.0,
            sent_not_acked_percent: 0.0,
            acked_not_sent_percent: 0.0,
            min_rtt_ms: None,
            avg_rtt_ms: None,
            max_rtt_ms: None,
            invalid_records: 0,
        }
    }
}

/// Collector-side totals for one sender identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderTotals {
    pub sender_id: String,
    pub received: u64,
    pub missed: u64,
    /// `received + missed`.
    pub total: u64,
    pub loss_percent: f64,
    pub last_serial: u64,
    pub last_ack_sent: u64,
    pub idle_seconds: f64,
}

impl SenderTotals {
    pub fn new(
        sender_id: String,
        received: u64,
        missed: u64,
        last_serial: u64,
        last_ack_sent: u64,
        idle_seconds: f64,
    ) -> Self {
        let total = received + missed;
        SenderTotals {
            sender_id,
            received,
            missed,
            total,
            loss_percent: percent(missed, total),
            last_serial,
            last_ack_sent,
            idle_seconds,
        }
    }
}

/// Collector-side snapshot of every tracked sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStats {
    pub generated_at: DateTime<Utc>,
    pub senders: Vec<SenderTotals>,
}

impl CollectorStats {
    pub fn find(&self, sender_id: &str) -> Option<&SenderTotals> {
        self.senders.iter().find(|s| s.sender_id == sender_id)
    }
}

/// A snapshot published by one of the orchestrators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Report {
    Probe(ClientStats),
    Collector(CollectorStats),
}

/// Destination of periodic statistics snapshots.
pub trait ReportSink: Send {
    fn publish(&mut self, report: &Report);
}

/// Writes reports to stdout or the logger according to `OutputFormat`.
pub struct OutputSink {
    format: OutputFormat,
}

impl OutputSink {
    pub fn new(format: OutputFormat) -> Self {
        OutputSink { format }
    }
}

impl ReportSink for OutputSink {
    fn publish(&mut self, report: &Report) {
        match self.format {
            OutputFormat::Log => log_report(report),
            OutputFormat::Text => print_text(report),
            OutputFormat::Json => print_json(report),
            OutputFormat::Csv => print_csv(report),
        }
    }
}

/// Forwards reports over a channel, for embedding and tests.
impl ReportSink for tokio::sync::mpsc::UnboundedSender<Report> {
    fn publish(&mut self, report: &Report) {
        if self.send(report.clone()).is_err() {
            log::debug!("report receiver dropped");
        }
    }
}

fn log_report(report: &Report) {
    match report {
        Report::Probe(s) => {
            log::info!(
                "totals: total={} sent={} acked={} sent_and_acked={} sent_not_acked={} acked_not_sent={}",
                s.total,
                s.sent,
                s.acked,
                s.sent_and_acked,
                s.sent_not_acked,
                s.acked_not_sent
            );
            log::info!(
                "percents: sent_and_acked={:.2} sent_not_acked={:.2} acked_not_sent={:.2}",
                s.sent_and_acked_percent,
                s.sent_not_acked_percent,
                s.acked_not_sent_percent
            );
            log::info!(
                "rtt: avg={} min={} max={}",
                fmt_ms(s.avg_rtt_ms),
                fmt_ms(s.min_rtt_ms),
                fmt_ms(s.max_rtt_ms)
            );
        }
        Report::Collector(c) => {
            if c.senders.is_empty() {
                log::info!("stats: no active senders");
            }
            for s in &c.senders {
                log::info!(
                    "stats: client_id={} total={} missed={} percent_miss={:.2} last_serial={} idle={:.1}s",
                    s.sender_id,
                    s.total,
                    s.missed,
                    s.loss_percent,
                    s.last_serial,
                    s.idle_seconds
                );
            }
        }
    }
}

fn print_text(report: &Report) {
    match report {
        Report::Probe(s) => {
            println!("\n--- Probe Statistics ({}) ---", s.generated_at.to_rfc3339());
            println!("Total: {}", s.total);
            println!("Sent: {}", s.sent);
            println!("Acked: {}", s.acked);
            println!(
                "Sent and acked: {} ({:.2}%)",
                s.sent_and_acked, s.sent_and_acked_percent
            );
            println!(
                "Sent not acked: {} ({:.2}%)",
                s.sent_not_acked, s.sent_not_acked_percent
            );
            println!(
                "Acked not sent: {} ({:.2}%)",
                s.acked_not_sent, s.acked_not_sent_percent
            );
            if let Some(v) = s.min_rtt_ms {
                println!("Min RTT: {:.3} ms", v);
            }
            if let Some(v) = s.avg_rtt_ms {
                println!("Avg RTT: {:.3} ms", v);
            }
            if let Some(v) = s.max_rtt_ms {
                println!("Max RTT: {:.3} ms", v);
            }
            if s.invalid_records > 0 {
                println!("Invalid records: {}", s.invalid_records);
            }
        }
        Report::Collector(c) => {
            println!(
                "\n--- Collector Statistics ({}) ---",
                c.generated_at.to_rfc3339()
            );
            println!("Active senders: {}", c.senders.len());
            for s in &c.senders {
                println!(
                    "  {} - received: {}, missed: {} ({:.2}%), last serial: {}",
                    s.sender_id, s.received, s.missed, s.loss_percent, s.last_serial
                );
            }
        }
    }
}

fn print_json(report: &Report) {
    if let Ok(json) = serde_json::to_string(report) {
        println!("{}", json);
    }
}

fn print_csv(report: &Report) {
    match report {
        Report::Probe(s) => {
            println!(
                "generated_at,total,sent,acked,sent_and_acked,sent_not_acked,acked_not_sent,\
                 sent_and_acked_percent,sent_not_acked_percent,acked_not_sent_percent,\
                 min_rtt_ms,avg_rtt_ms,max_rtt_ms"
            );
            println!(
                "{},{},{},{},{},{},{},{:.2},{:.2},{:.2},{},{},{}",
                s.generated_at.to_rfc3339(),
                s.total,
                s.sent,
                s.acked,
                s.sent_and_acked,
                s.sent_not_acked,
                s.acked_not_sent,
                s.sent_and_acked_percent,
                s.sent_not_acked_percent,
                s.acked_not_sent_percent,
                fmt_opt(s.min_rtt_ms),
                fmt_opt(s.avg_rtt_ms),
                fmt_opt(s.max_rtt_ms),
            );
        }
        Report::Collector(c) => {
            println!("generated_at,sender_id,received,missed,total,loss_percent,last_serial");
            for s in &c.senders {
                println!(
                    "{},{},{},{},{},{:.2},{}",
                    c.generated_at.to_rfc3339(),
                    s.sender_id,
                    s.received,
                    s.missed,
                    s.total,
                    s.loss_percent,
                    s.last_serial
                );
            }
        }
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(String::new, |x| format!("{:.3}", x))
}

fn fmt_ms(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |x| format!("{:.3}ms", x))
}
