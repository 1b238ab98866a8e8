//! Collector side: acknowledges Requests and keeps the per-sender ledger.
//!
//! The receive loop turns every authenticated datagram into a
//! [`CollectorEvent`]. The [`CollectorOrchestrator`] applies those events to
//! the [`CollectorLedger`], which it owns exclusively, and runs periodic
//! reporting and culling between events.

use std::{
    future::Future,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};

use crate::{
    codec,
    crypto::HmacKey,
    ledger::{CollectorLedger, Command, CommandKind},
    packets::{Message, MessageKind},
    session::{log_discard, send_message_to, SessionError, EVENT_CHANNEL_CAPACITY},
    stats::{CollectorStats, Report, ReportSink},
};

const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Everything the collector needs to run, already validated and resolved.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub local: SocketAddr,
    pub key: HmacKey,
    pub report_interval: Duration,
    pub cull_interval: Duration,
    /// Senders silent for longer than this are dropped from the ledger.
    pub idle_timeout: Duration,
}

/// Work handed from the receive loop to the orchestrator.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    Command(Command),
    /// The Ack for the most recently published Request could not be written.
    AckFailed { sender_id: String, sequence: u64 },
}

/// Owner of the collector's ledger.
pub struct CollectorOrchestrator<S: ReportSink> {
    ledger: CollectorLedger,
    sink: S,
    report_interval: Duration,
    cull_interval: Duration,
    idle_timeout: Duration,
    last_report: Instant,
    last_cull: Instant,
    // Most recently applied Request, kept until its Ack outcome is known.
    pending_request: Option<Command>,
}

impl<S: ReportSink> CollectorOrchestrator<S> {
    pub fn new(
        sink: S,
        report_interval: Duration,
        cull_interval: Duration,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        CollectorOrchestrator {
            ledger: CollectorLedger::new(),
            sink,
            report_interval,
            cull_interval,
            idle_timeout,
            last_report: now,
            last_cull: now,
            pending_request: None,
        }
    }

    pub fn ledger(&self) -> &CollectorLedger {
        &self.ledger
    }

    pub fn handle_event(&mut self, event: CollectorEvent) {
        match event {
            CollectorEvent::Command(command) => self.execute(command),
            CollectorEvent::AckFailed {
                sender_id,
                sequence,
            } => self.roll_back(&sender_id, sequence),
        }
    }

    fn execute(&mut self, mut command: Command) {
        let kind = command.kind();
        if kind != CommandKind::AckSent {
            self.pending_request = None;
        }

        match command.apply(&mut self.ledger) {
            Ok(()) => match kind {
                CommandKind::Request => self.pending_request = Some(command),
                CommandKind::AckSent => self.pending_request = None,
                CommandKind::Reset => {
                    log::info!("reset from {}", command.sender_id());
                }
            },
            Err(e) => log::warn!(
                "could not execute {:?} for {}: {}",
                kind,
                command.sender_id(),
                e
            ),
        }
    }

    fn roll_back(&mut self, sender_id: &str, sequence: u64) {
        match self.pending_request.take() {
            Some(mut command)
                if command.sender_id() == sender_id && command.sequence() == sequence =>
            {
                match command.undo(&mut self.ledger) {
                    Ok(()) => log::warn!(
                        "ack for {} sequence {} not sent, request rolled back",
                        sender_id,
                        sequence
                    ),
                    Err(e) => log::error!("could not roll back request: {}", e),
                }
            }
            _ => log::debug!(
                "ack for {} sequence {} not sent, no applied request to roll back",
                sender_id,
                sequence
            ),
        }
    }

    /// Culls idle senders and publishes a report when their intervals elapse.
    pub fn maintain(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cull) >= self.cull_interval {
            self.cull(now);
        }
        if now.saturating_duration_since(self.last_report) >= self.report_interval {
            self.report(now);
        }
    }

    pub fn cull(&mut self, now: Instant) -> usize {
        let removed = self.ledger.cull(now, self.idle_timeout);
        self.last_cull = now;
        if removed > 0 {
            log::info!("culled {} idle senders", removed);
        }
        removed
    }

    pub fn report(&mut self, now: Instant) -> CollectorStats {
        let stats = self.ledger.snapshot_all(now);
        self.last_report = now;
        self.sink.publish(&Report::Collector(stats.clone()));
        stats
    }

    /// Publishes the final report.
    pub fn finish(mut self) -> CollectorStats {
        self.report(Instant::now())
    }
}

/// Runs the collector until `shutdown` resolves.
///
/// Returns the final snapshot of the ledger, which is also published to
/// `sink`.
///
/// # Errors
/// Fails only if the socket cannot be bound.
pub async fn run_receiver<S, F>(
    settings: CollectorSettings,
    sink: S,
    shutdown: F,
) -> Result<CollectorStats, SessionError>
where
    S: ReportSink,
    F: Future<Output = ()>,
{
    let socket = UdpSocket::bind(settings.local).await?;
    log::info!(
        "collector listening on {} (key {})",
        socket.local_addr()?,
        settings.key.fingerprint()
    );
    run_receiver_on(socket, settings, sink, shutdown).await
}

/// Like [`run_receiver`], on an already bound socket.
pub async fn run_receiver_on<S, F>(
    socket: UdpSocket,
    settings: CollectorSettings,
    sink: S,
    shutdown: F,
) -> Result<CollectorStats, SessionError>
where
    S: ReportSink,
    F: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let recv_task = tokio::spawn(recv_loop(socket, settings.key, tx, stop_rx));

    let mut orchestrator = CollectorOrchestrator::new(
        sink,
        settings.report_interval,
        settings.cull_interval,
        settings.idle_timeout,
        Instant::now(),
    );
    let tick = settings
        .report_interval
        .min(settings.cull_interval)
        .min(MAINTENANCE_TICK)
        .max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(tick);
    let mut stopping = false;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => orchestrator.handle_event(event),
                None => break,
            },
            _ = ticker.tick() => {}
            _ = &mut shutdown, if !stopping => {
                log::info!("shutting down collector");
                stopping = true;
                let _ = stop_tx.send(true);
            }
        }
        orchestrator.maintain(Instant::now());
    }

    let _ = recv_task.await;
    Ok(orchestrator.finish())
}

async fn recv_loop(
    socket: UdpSocket,
    key: HmacKey,
    events: mpsc::Sender<CollectorEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 1024];

    loop {
        let (len, src) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    log::error!("could not read from UDP socket: {}", e);
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        let message = match codec::decode(&buf[..len], &key) {
            Ok(message) => message,
            Err(e) => {
                log_discard(&SessionError::from(e), src);
                continue;
            }
        };
        log::trace!(
            "{} {} from {} ({})",
            message.kind,
            message.sequence,
            message.sender_id,
            src
        );

        if !dispatch(&socket, &key, message, src, &events).await {
            break;
        }
    }
}

/// Publishes the events for one authenticated message.
///
/// Returns false once the orchestrator has gone away.
async fn dispatch(
    socket: &UdpSocket,
    key: &HmacKey,
    message: Message,
    src: SocketAddr,
    events: &mpsc::Sender<CollectorEvent>,
) -> bool {
    let Message {
        kind,
        sequence,
        sender_id,
    } = message;

    match kind {
        MessageKind::Request => {
            let command = Command::request(sender_id.clone(), sequence, Instant::now());
            if events.send(CollectorEvent::Command(command)).await.is_err() {
                return false;
            }

            let ack = Message::acknowledge(sequence, &sender_id);
            let outcome = match send_message_to(socket, key, &ack, src).await {
                Ok(()) => CollectorEvent::Command(Command::ack_sent(
                    sender_id,
                    sequence,
                    Instant::now(),
                )),
                Err(e) => {
                    log::error!("could not send ack packet to {}: {}", src, e);
                    CollectorEvent::AckFailed {
                        sender_id,
                        sequence,
                    }
                }
            };
            events.send(outcome).await.is_ok()
        }
        MessageKind::Reset => {
            let command = Command::reset(sender_id, sequence, Instant::now());
            events.send(CollectorEvent::Command(command)).await.is_ok()
        }
        MessageKind::Acknowledge => {
            log_discard(&SessionError::UnexpectedKind(kind), src);
            true
        }
    }
}
