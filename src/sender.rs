//! Probe side: sends sequenced Requests and matches the returning Acks.
//!
//! Three tasks cooperate. The send loop and the receive loop share the UDP
//! socket and publish [`ProbeEvent`]s over a bounded channel; the
//! [`ProbeOrchestrator`] is the only owner of the [`ProbeTracker`] and the
//! only task that reports statistics.

use std::{
    future::Future,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    time::{Interval, MissedTickBehavior},
};

use crate::{
    codec,
    crypto::HmacKey,
    packets::MessageKind,
    session::{
        log_discard, send_message, Session, SessionError, EVENT_CHANNEL_CAPACITY,
    },
    stats::{ClientStats, Report, ReportSink},
    tracker::ProbeTracker,
};

/// Shortest period of the orchestrator's maintenance tick.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Lower bound on how long the probe waits for Acks after its final Request.
const MIN_ACK_LINGER: Duration = Duration::from_secs(1);

/// Everything the probe needs to run, already validated and resolved.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub remote: SocketAddr,
    pub key: HmacKey,
    pub sender_id: String,
    pub probe_interval: Duration,
    pub report_interval: Duration,
    /// Stop after this many Requests. `None` runs until shutdown.
    pub count: Option<u64>,
}

impl ProbeSettings {
    /// Wildcard bind address in the remote's address family.
    fn local_addr(&self) -> SocketAddr {
        match self.remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }
}

/// Facts the session loops report to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// A Request is about to be written. Published before the write so the
    /// matching Ack can never be seen first.
    Sent { sequence: u64, at: Instant },
    /// Writing the Request announced by `Sent` failed.
    SendFailed { sequence: u64 },
    /// A valid Ack for this sender arrived.
    Acked { sequence: u64, at: Instant },
}

/// Owner of the probe's tracker.
pub struct ProbeOrchestrator<S: ReportSink> {
    tracker: ProbeTracker,
    sink: S,
    report_interval: Duration,
    last_report: Instant,
}

impl<S: ReportSink> ProbeOrchestrator<S> {
    pub fn new(sink: S, report_interval: Duration, now: Instant) -> Self {
        ProbeOrchestrator {
            tracker: ProbeTracker::new(),
            sink,
            report_interval,
            last_report: now,
        }
    }

    pub fn tracker(&self) -> &ProbeTracker {
        &self.tracker
    }

    pub fn handle_event(&mut self, event: ProbeEvent) {
        match event {
            ProbeEvent::Sent { sequence, at } => self.tracker.record_send(sequence, at),
            ProbeEvent::SendFailed { sequence } => self.tracker.forget_send(sequence),
            ProbeEvent::Acked { sequence, at } => {
                if let Err(e) = self.tracker.record_ack(sequence, at) {
                    log::warn!("ack rejected: {}", e);
                }
            }
        }
    }

    /// Publishes a report if the reporting interval has elapsed.
    pub fn maintain(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_report) >= self.report_interval {
            self.report(now);
        }
    }

    /// Snapshots the window, publishes it and starts a new window.
    pub fn report(&mut self, now: Instant) -> ClientStats {
        let stats = self.tracker.snapshot();
        self.tracker.reset();
        self.last_report = now;
        self.sink.publish(&Report::Probe(stats.clone()));
        stats
    }

    /// Publishes the final report.
    pub fn finish(mut self) -> ClientStats {
        self.report(Instant::now())
    }
}

/// Runs the probe until `shutdown` resolves or the configured count is sent.
///
/// Returns the statistics of the last reporting window, which are also
/// published to `sink`.
///
/// # Errors
/// Fails only if the socket cannot be bound or connected. Per-datagram
/// failures are logged and the probe keeps running.
pub async fn run_sender<S, F>(
    settings: ProbeSettings,
    sink: S,
    shutdown: F,
) -> Result<ClientStats, SessionError>
where
    S: ReportSink,
    F: Future<Output = ()>,
{
    let socket = UdpSocket::bind(settings.local_addr()).await?;
    socket.connect(settings.remote).await?;
    let socket = Arc::new(socket);

    log::info!(
        "probing {} from {} as {} (key {})",
        settings.remote,
        socket.local_addr()?,
        settings.sender_id,
        settings.key.fingerprint()
    );

    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    // The send loop stops first; the receive loop keeps collecting Acks until
    // the send loop has finished lingering.
    let (stop_send_tx, stop_send_rx) = watch::channel(false);
    let (stop_recv_tx, stop_recv_rx) = watch::channel(false);

    let mut send_task = tokio::spawn(send_loop(
        socket.clone(),
        settings.key.clone(),
        Session::new(settings.sender_id.clone()),
        settings.probe_interval,
        settings.count,
        tx.clone(),
        stop_send_rx,
    ));
    let recv_task = tokio::spawn(recv_loop(
        socket,
        settings.key,
        settings.sender_id,
        settings.remote,
        tx,
        stop_recv_rx,
    ));

    let mut orchestrator = ProbeOrchestrator::new(sink, settings.report_interval, Instant::now());
    let mut ticker = tokio::time::interval(maintenance_period(settings.report_interval));
    let mut shutdown_seen = false;
    let mut send_done = false;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => orchestrator.handle_event(event),
                None => break,
            },
            _ = ticker.tick() => {}
            _ = &mut shutdown, if !shutdown_seen => {
                log::info!("shutting down probe");
                shutdown_seen = true;
                let _ = stop_send_tx.send(true);
            }
            _ = &mut send_task, if !send_done => {
                send_done = true;
                let _ = stop_recv_tx.send(true);
            }
        }
        orchestrator.maintain(Instant::now());
    }

    if !send_done {
        let _ = send_task.await;
    }
    let _ = recv_task.await;

    Ok(orchestrator.finish())
}

fn maintenance_period(report_interval: Duration) -> Duration {
    report_interval
        .min(MAINTENANCE_TICK)
        .max(Duration::from_millis(10))
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    key: HmacKey,
    mut session: Session,
    probe_interval: Duration,
    count: Option<u64>,
    events: mpsc::Sender<ProbeEvent>,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(e) = send_message(&socket, &key, &session.reset_message()).await {
        log::error!("could not send reset packet: {}", e);
    } else {
        log::debug!("sent reset for {}", session.sender_id());
    }

    let mut ticker = probe_ticker(probe_interval);
    let mut attempts = 0u64;

    loop {
        if count.is_some_and(|limit| attempts >= limit) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        let request = match session.next_request() {
            Ok(request) => request,
            Err(e) => {
                log::error!("stopping probe: {}", e);
                break;
            }
        };
        attempts += 1;

        let sequence = request.sequence;
        let sent = ProbeEvent::Sent {
            sequence,
            at: Instant::now(),
        };
        if events.send(sent).await.is_err() {
            break;
        }

        if let Err(e) = send_message(&socket, &key, &request).await {
            log::error!("could not send packet {}: {}", sequence, e);
            if events.send(ProbeEvent::SendFailed { sequence }).await.is_err() {
                break;
            }
        } else {
            log::trace!("sent request {}", sequence);
        }
    }

    let linger = ack_linger(probe_interval);
    log::info!(
        "sent {} probes, waiting {:?} for trailing acks",
        attempts,
        linger
    );
    tokio::time::sleep(linger).await;
}

/// Ticker pacing the Requests. After a stall it waits a full interval
/// instead of sending the missed Requests back to back.
fn probe_ticker(probe_interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval(probe_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// How long the receive loop keeps running after the last Request.
fn ack_linger(probe_interval: Duration) -> Duration {
    probe_interval.max(MIN_ACK_LINGER)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    key: HmacKey,
    sender_id: String,
    remote: SocketAddr,
    events: mpsc::Sender<ProbeEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 1024];

    loop {
        let len = tokio::select! {
            result = socket.recv(&mut buf) => match result {
                Ok(len) => len,
                Err(e) => {
                    log::error!("could not read from UDP socket: {}", e);
                    continue;
                }
            },
            _ = stop.changed() => break,
        };
        let at = Instant::now();

        match parse_ack(&buf[..len], &key, &sender_id) {
            Ok(sequence) => {
                log::trace!("received ack {}", sequence);
                if events.send(ProbeEvent::Acked { sequence, at }).await.is_err() {
                    break;
                }
            }
            Err(e) => log_discard(&e, remote),
        }
    }
}

/// Decodes an Ack addressed to `sender_id` and returns its sequence number.
fn parse_ack(data: &[u8], key: &HmacKey, sender_id: &str) -> Result<u64, SessionError> {
    let message = codec::decode(data, key)?;
    if message.kind != MessageKind::Acknowledge {
        return Err(SessionError::UnexpectedKind(message.kind));
    }
    if message.sender_id != sender_id {
        return Err(SessionError::ForeignSender(message.sender_id));
    }
    Ok(message.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::CodecError, packets::Message};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn orchestrator(
        report_interval: Duration,
        now: Instant,
    ) -> (
        ProbeOrchestrator<mpsc::UnboundedSender<Report>>,
        UnboundedReceiver<Report>,
    ) {
        let (tx, rx) = unbounded_channel();
        (ProbeOrchestrator::new(tx, report_interval, now), rx)
    }

    fn probe_stats(report: Report) -> ClientStats {
        match report {
            Report::Probe(stats) => stats,
            other => panic!("expected probe report, got {:?}", other),
        }
    }

    #[test]
    fn test_events_feed_tracker() {
        let t0 = Instant::now();
        let (mut orch, _rx) = orchestrator(Duration::from_secs(60), t0);

        for seq in 1..=3 {
            orch.handle_event(ProbeEvent::Sent {
                sequence: seq,
                at: t0,
            });
        }
        orch.handle_event(ProbeEvent::Acked {
            sequence: 1,
            at: t0 + Duration::from_millis(10),
        });
        orch.handle_event(ProbeEvent::Acked {
            sequence: 3,
            at: t0 + Duration::from_millis(30),
        });

        let stats = orch.tracker().snapshot();
        assert_eq!(stats.sent_and_acked, 2);
        assert_eq!(stats.sent_not_acked, 1);
        assert_eq!(stats.acked_not_sent, 0);
    }

    #[test]
    fn test_rejected_acks_are_ignored() {
        let t0 = Instant::now();
        let (mut orch, _rx) = orchestrator(Duration::from_secs(60), t0);

        orch.handle_event(ProbeEvent::Sent {
            sequence: 1,
            at: t0,
        });
        orch.handle_event(ProbeEvent::Acked {
            sequence: 1,
            at: t0,
        });
        // Duplicate and ahead-of-send acks change nothing.
        orch.handle_event(ProbeEvent::Acked {
            sequence: 1,
            at: t0,
        });
        orch.handle_event(ProbeEvent::Acked {
            sequence: 9,
            at: t0,
        });

        assert_eq!(orch.tracker().len(), 1);
        assert_eq!(orch.tracker().last_ack(), 1);
    }

    #[test]
    fn test_send_failed_drops_record() {
        let t0 = Instant::now();
        let (mut orch, _rx) = orchestrator(Duration::from_secs(60), t0);

        orch.handle_event(ProbeEvent::Sent {
            sequence: 1,
            at: t0,
        });
        orch.handle_event(ProbeEvent::SendFailed { sequence: 1 });

        assert!(orch.tracker().is_empty());
        assert_eq!(orch.tracker().last_sent(), 1);
    }

    #[test]
    fn test_maintain_reports_on_interval() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(10);
        let (mut orch, mut rx) = orchestrator(interval, t0);

        orch.handle_event(ProbeEvent::Sent {
            sequence: 1,
            at: t0,
        });
        orch.maintain(t0 + Duration::from_secs(5));
        assert!(rx.try_recv().is_err());

        orch.maintain(t0 + interval);
        let stats = probe_stats(rx.try_recv().unwrap());
        assert_eq!(stats.sent_not_acked, 1);

        // The window was reset after the snapshot.
        assert!(orch.tracker().is_empty());
        orch.maintain(t0 + interval + Duration::from_secs(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_finish_publishes_final_report() {
        let t0 = Instant::now();
        let (mut orch, mut rx) = orchestrator(Duration::from_secs(600), t0);
        orch.handle_event(ProbeEvent::Sent {
            sequence: 1,
            at: t0,
        });
        orch.handle_event(ProbeEvent::Acked {
            sequence: 1,
            at: t0 + Duration::from_millis(4),
        });

        let stats = orch.finish();
        assert_eq!(stats.sent_and_acked, 1);
        assert_eq!(probe_stats(rx.try_recv().unwrap()), stats);
    }

    #[test]
    fn test_parse_ack() {
        let key = HmacKey::from_passphrase("secret").unwrap();
        let ack = codec::encode(&Message::acknowledge(7, "me"), &key).unwrap();
        assert_eq!(parse_ack(&ack, &key, "me").unwrap(), 7);

        assert!(matches!(
            parse_ack(&ack, &key, "someone-else"),
            Err(SessionError::ForeignSender(_))
        ));

        let req = codec::encode(&Message::request(7, "me"), &key).unwrap();
        assert!(matches!(
            parse_ack(&req, &key, "me"),
            Err(SessionError::UnexpectedKind(MessageKind::Request))
        ));

        let other_key = HmacKey::from_passphrase("other").unwrap();
        assert!(matches!(
            parse_ack(&ack, &other_key, "me"),
            Err(SessionError::Codec(CodecError::Authentication))
        ));

        let mut padded = ack.clone();
        padded.resize(1024, 0);
        assert!(matches!(
            parse_ack(&padded, &key, "me"),
            Err(SessionError::Codec(CodecError::Oversized(1024)))
        ));
    }

    #[tokio::test]
    async fn test_probe_ticker_does_not_burst() {
        let ticker = probe_ticker(Duration::from_millis(250));

        assert_eq!(ticker.missed_tick_behavior(), MissedTickBehavior::Delay);
        assert_eq!(ticker.period(), Duration::from_millis(250));
    }

    #[test]
    fn test_ack_linger_bounds() {
        assert_eq!(ack_linger(Duration::from_millis(20)), MIN_ACK_LINGER);
        assert_eq!(ack_linger(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_local_addr_matches_family() {
        let mut settings = ProbeSettings {
            remote: "127.0.0.1:6666".parse().unwrap(),
            key: HmacKey::from_passphrase("k").unwrap(),
            sender_id: "p".to_string(),
            probe_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(600),
            count: None,
        };
        assert!(settings.local_addr().is_ipv4());

        settings.remote = "[::1]:6666".parse().unwrap();
        assert!(settings.local_addr().is_ipv6());
    }
}
