//! Integration tests for probe and collector over loopback.
//!
//! The collector and probe run their real session loops on 127.0.0.1. A relay
//! placed between them can drop or delay selected datagrams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use packetloss::codec::{decode, encode};
use packetloss::crypto::HmacKey;
use packetloss::packets::{Message, MessageKind};
use packetloss::receiver::{run_receiver_on, CollectorSettings};
use packetloss::sender::{run_sender, ProbeSettings};
use packetloss::session::SessionError;
use packetloss::stats::{ClientStats, CollectorStats, Report};

const KEY: &str = "loopback secret";

fn key() -> HmacKey {
    HmacKey::from_passphrase(KEY).unwrap()
}

struct TestCollector {
    addr: SocketAddr,
    reports: mpsc::UnboundedReceiver<Report>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<CollectorStats, SessionError>>,
}

impl TestCollector {
    async fn start() -> TestCollector {
        Self::start_with(Duration::from_secs(600)).await
    }

    async fn start_with(report_interval: Duration) -> TestCollector {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let settings = CollectorSettings {
            local: addr,
            key: key(),
            report_interval,
            cull_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(1800),
        };
        let (sink, reports) = mpsc::unbounded_channel::<Report>();
        let (shutdown, stop) = oneshot::channel::<()>();

        let handle = tokio::spawn(run_receiver_on(socket, settings, sink, async move {
            let _ = stop.await;
        }));

        TestCollector {
            addr,
            reports,
            shutdown,
            handle,
        }
    }

    async fn stop(self) -> CollectorStats {
        self.shutdown.send(()).unwrap();
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("collector did not shut down")
            .unwrap()
            .unwrap()
    }
}

fn probe_settings(remote: SocketAddr, sender_id: &str, count: u64) -> ProbeSettings {
    ProbeSettings {
        remote,
        key: key(),
        sender_id: sender_id.to_string(),
        probe_interval: Duration::from_millis(20),
        report_interval: Duration::from_secs(600),
        count: Some(count),
    }
}

async fn run_probe(settings: ProbeSettings) -> ClientStats {
    let (sink, _reports) = mpsc::unbounded_channel::<Report>();
    timeout(
        Duration::from_secs(10),
        run_sender(settings, sink, std::future::pending()),
    )
    .await
    .expect("probe did not finish")
    .unwrap()
}

/// Forwards datagrams between one probe and the collector, holding each
/// one back for `delay` and dropping Requests whose sequence number is in
/// `drop_requests`.
async fn spawn_relay(
    collector: SocketAddr,
    drop_requests: Vec<u64>,
    delay: Duration,
) -> (SocketAddr, JoinHandle<()>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let key = key();

    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let mut probe: Option<SocketAddr> = None;

        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            let datagram = buf[..len].to_vec();

            if src == collector {
                if let Some(probe) = probe {
                    forward(&socket, datagram, probe, delay).await;
                }
                continue;
            }

            probe = Some(src);
            let dropped = matches!(
                decode(&datagram, &key),
                Ok(Message { kind: MessageKind::Request, sequence, .. })
                    if drop_requests.contains(&sequence)
            );
            if !dropped {
                forward(&socket, datagram, collector, delay).await;
            }
        }
    });

    (addr, handle)
}

async fn forward(socket: &Arc<UdpSocket>, datagram: Vec<u8>, dest: SocketAddr, delay: Duration) {
    if delay.is_zero() {
        let _ = socket.send_to(&datagram, dest).await;
        return;
    }
    let socket = socket.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = socket.send_to(&datagram, dest).await;
    });
}

/// Sends `message` from `socket` and waits briefly for a reply.
async fn exchange(socket: &UdpSocket, datagram: &[u8], collector: SocketAddr) -> Option<Vec<u8>> {
    socket.send_to(datagram, collector).await.unwrap();
    let mut buf = [0u8; 1024];
    match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_loss_through_relay() {
    let collector = TestCollector::start().await;
    let (relay_addr, relay) = spawn_relay(collector.addr, vec![3], Duration::ZERO).await;

    let probe = run_probe(probe_settings(relay_addr, "loopback-probe", 5)).await;

    assert_eq!(probe.sent_and_acked, 4);
    assert_eq!(probe.sent_not_acked, 1);
    assert_eq!(probe.acked_not_sent, 0);
    assert_eq!(probe.acked_not_sent_percent, 0.0);
    assert!((probe.sent_not_acked_percent - 20.0).abs() < 0.001);
    assert!(probe.avg_rtt_ms.is_some());

    relay.abort();
    let stats = collector.stop().await;
    let totals = stats.find("loopback-probe").expect("probe not tracked");
    assert_eq!(totals.received, 4);
    assert_eq!(totals.missed, 1);
    assert_eq!(totals.last_serial, 5);
    assert_eq!(totals.last_ack_sent, 5);
    assert!((totals.loss_percent - 20.0).abs() < 0.001);
}

#[tokio::test]
async fn test_two_probes_are_tracked_separately() {
    let collector = TestCollector::start().await;

    let (a, b) = tokio::join!(
        run_probe(probe_settings(collector.addr, "probe-a", 3)),
        run_probe(probe_settings(collector.addr, "probe-b", 4)),
    );
    assert_eq!(a.sent_and_acked, 3);
    assert_eq!(b.sent_and_acked, 4);

    let stats = collector.stop().await;
    assert_eq!(stats.senders.len(), 2);
    assert_eq!(stats.find("probe-a").unwrap().received, 3);
    assert_eq!(stats.find("probe-b").unwrap().received, 4);
    assert_eq!(stats.find("probe-b").unwrap().missed, 0);
}

#[tokio::test]
async fn test_invalid_datagrams_leave_state_unchanged() {
    let collector = TestCollector::start().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let key = key();

    let valid = encode(&Message::request(1, "raw"), &key).unwrap();
    let reply = exchange(&socket, &valid, collector.addr)
        .await
        .expect("no ack for valid request");
    let ack = decode(&reply, &key).unwrap();
    assert_eq!(ack, Message::acknowledge(1, "raw"));

    let mut tampered = encode(&Message::request(2, "raw"), &key).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    let wrong_key = encode(
        &Message::request(2, "intruder"),
        &HmacKey::from_passphrase("not the key").unwrap(),
    )
    .unwrap();
    let unexpected = encode(&Message::acknowledge(2, "raw"), &key).unwrap();
    let garbage = vec![0xAB; 60];
    let truncated = valid[..10].to_vec();
    let mut oversized = valid.clone();
    oversized.resize(600, 0);

    for datagram in [tampered, wrong_key, unexpected, garbage, truncated, oversized] {
        assert!(exchange(&socket, &datagram, collector.addr).await.is_none());
    }

    let stats = collector.stop().await;
    assert_eq!(stats.senders.len(), 1);
    let raw = stats.find("raw").unwrap();
    assert_eq!(raw.received, 1);
    assert_eq!(raw.missed, 0);
    assert_eq!(raw.last_serial, 1);
}

#[tokio::test]
async fn test_replayed_request_not_counted() {
    let collector = TestCollector::start().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let key = key();

    let first = encode(&Message::request(1, "replay"), &key).unwrap();
    let second = encode(&Message::request(2, "replay"), &key).unwrap();
    assert!(exchange(&socket, &first, collector.addr).await.is_some());
    assert!(exchange(&socket, &second, collector.addr).await.is_some());
    // The replay is still acknowledged but not counted.
    assert!(exchange(&socket, &first, collector.addr).await.is_some());

    let stats = collector.stop().await;
    let totals = stats.find("replay").unwrap();
    assert_eq!(totals.received, 2);
    assert_eq!(totals.missed, 0);
    assert_eq!(totals.last_serial, 2);
}

#[tokio::test]
async fn test_reset_restarts_numbering() {
    let collector = TestCollector::start().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let key = key();

    for seq in [1, 2, 10] {
        let datagram = encode(&Message::request(seq, "restart"), &key).unwrap();
        assert!(exchange(&socket, &datagram, collector.addr).await.is_some());
    }

    // Resets are not acknowledged.
    let reset = encode(&Message::reset("restart"), &key).unwrap();
    assert!(exchange(&socket, &reset, collector.addr).await.is_none());

    let datagram = encode(&Message::request(1, "restart"), &key).unwrap();
    assert!(exchange(&socket, &datagram, collector.addr).await.is_some());

    let stats = collector.stop().await;
    let totals = stats.find("restart").unwrap();
    assert_eq!(totals.received, 1);
    assert_eq!(totals.missed, 0);
    assert_eq!(totals.last_serial, 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_acks() {
    let collector = TestCollector::start().await;
    let (relay_addr, relay) = spawn_relay(collector.addr, vec![], Duration::from_millis(40)).await;

    let mut settings = probe_settings(relay_addr, "delayed", 0);
    settings.count = None;
    settings.probe_interval = Duration::from_millis(50);
    let (sink, _reports) = mpsc::unbounded_channel::<Report>();

    // Shut down while the last Requests and their Acks are still in the relay.
    let stats = timeout(
        Duration::from_secs(10),
        run_sender(settings, sink, tokio::time::sleep(Duration::from_millis(530))),
    )
    .await
    .expect("probe did not finish")
    .unwrap();

    assert!(stats.sent >= 5, "only {} requests sent", stats.sent);
    assert_eq!(stats.sent_not_acked, 0);
    assert_eq!(stats.acked_not_sent, 0);
    assert_eq!(stats.sent_and_acked, stats.sent);

    relay.abort();
    collector.stop().await;
}

#[tokio::test]
async fn test_periodic_reports_cover_disjoint_windows() {
    let mut collector = TestCollector::start_with(Duration::from_millis(100)).await;

    let mut settings = probe_settings(collector.addr, "windowed", 12);
    settings.report_interval = Duration::from_millis(100);
    let (sink, mut reports) = mpsc::unbounded_channel::<Report>();

    let last = timeout(
        Duration::from_secs(10),
        run_sender(settings, sink, std::future::pending()),
    )
    .await
    .expect("probe did not finish")
    .unwrap();

    let mut windows = Vec::new();
    while let Ok(report) = reports.try_recv() {
        match report {
            Report::Probe(stats) => windows.push(stats),
            other => panic!("unexpected report {:?}", other),
        }
    }

    // Periodic windows during the run, then the final one.
    assert!(windows.len() >= 3, "only {} reports", windows.len());
    assert_eq!(windows.last(), Some(&last));

    // Every Request and every Ack lands in exactly one window.
    let sent: u64 = windows.iter().map(|w| w.sent).sum();
    let acked: u64 = windows.iter().map(|w| w.acked).sum();
    assert_eq!(sent, 12);
    assert_eq!(acked, 12);

    let mut periodic = 0;
    while let Ok(report) = collector.reports.try_recv() {
        assert!(matches!(report, Report::Collector(_)));
        periodic += 1;
    }
    assert!(periodic >= 1);

    let stats = collector.stop().await;
    assert_eq!(stats.find("windowed").unwrap().received, 12);
}
