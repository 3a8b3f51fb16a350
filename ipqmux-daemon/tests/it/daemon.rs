use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use ipqmux_daemon::{Daemon, DaemonError, DaemonOptions, PeerState};
use ipqmux_transport::{
    ipc::Ipc,
    upstream::{
        mem::{self, MemUpstreamHandle, UpstreamEvent},
        UpstreamMode,
    },
    DataChannel,
};
use ipqmux_wire::{
    control::{ControlMessage, CopyMode, ErrorCode},
    data::{Decision, Packet, Verdict},
};

use crate::client::TestPeer;

struct Harness {
    daemon: Daemon<Ipc>,
    upstream: MemUpstreamHandle,
    dir: PathBuf,
    socket: PathBuf,
}

impl Harness {
    async fn start(options: DaemonOptions) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let dir = std::env::temp_dir().join(format!("ipqmux-it-{}", rand::random::<u64>()));
        let socket = dir.join("ipqmux.sock");

        let (upstream, handle) = mem::channel(64);
        let mut daemon = Daemon::with_options(Ipc::new(), options.runtime_dir(dir.clone()));
        daemon.bind(socket.clone(), upstream).await.unwrap();

        Self { daemon, upstream: handle, dir, socket }
    }

    async fn peer(&self) -> TestPeer {
        TestPeer::connect(&self.socket, &self.dir).await
    }

    async fn inject(&self, id: u64, mark: u64, payload: &'static [u8]) {
        self.upstream.inject(Packet::new(id, mark, Bytes::from_static(payload))).await.unwrap();
    }

    async fn next_verdict(&mut self) -> Verdict {
        tokio::time::timeout(Duration::from_secs(2), self.upstream.next_verdict())
            .await
            .expect("upstream timeout")
            .expect("daemon gone")
    }

    async fn next_event(&mut self) -> UpstreamEvent {
        tokio::time::timeout(Duration::from_secs(2), self.upstream.next_event())
            .await
            .expect("upstream timeout")
            .expect("daemon gone")
    }

    /// Waits until the daemon reports exactly `n` peers.
    async fn wait_for_peers(&self, n: usize) {
        for _ in 0..200 {
            if self.daemon.peers().await.unwrap().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("daemon never reached {n} peers");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test]
async fn register_deliver_and_reject_second_holder() {
    let mut harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);

    harness.inject(100, 7, b"payload").await;
    let packet = a.recv_packet().await;
    assert_eq!(packet.id, 100);
    assert_eq!(packet.mark, 7);

    a.send_verdict(Verdict::accept(100)).await;
    assert_eq!(harness.next_verdict().await, Verdict::accept(100));

    let mut b = harness.peer().await;
    assert_eq!(b.register(7, "b").await, ControlMessage::Error { code: ErrorCode::MarkInUse });
    assert_eq!(b.recv().await, None);

    // A stale verdict from A goes nowhere.
    a.send_verdict(Verdict::accept(999)).await;

    harness.inject(101, 7, b"payload").await;
    assert_eq!(a.recv_packet().await.id, 101);
    a.send_verdict(Verdict::drop(101)).await;
    assert_eq!(harness.next_verdict().await, Verdict::drop(101));

    let stats = harness.daemon.stats();
    assert_eq!(stats.verdicts_forwarded(), 2);
    assert_eq!(stats.verdicts_rejected(), 1);
    assert_eq!(stats.packets_routed(), 2);

    let peers = harness.daemon.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].mark, Some(7));
    assert_eq!(peers[0].state, PeerState::Authenticated);
}

#[tokio::test]
async fn orphan_packets_get_one_default_verdict() {
    let mut harness = Harness::start(DaemonOptions::default()).await;

    // Connected but unregistered peers do not claim packets.
    let _connecting = harness.peer().await;
    harness.wait_for_peers(1).await;

    harness.inject(1, 42, b"orphan").await;
    assert_eq!(harness.next_verdict().await, Verdict::accept(1));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.upstream.try_next_event(), None);
    assert_eq!(harness.daemon.stats().packets_orphaned(), 1);
    assert_eq!(harness.daemon.stats().verdicts_defaulted(), 1);
}

#[tokio::test]
async fn default_verdict_is_configurable() {
    let mut harness = Harness::start(DaemonOptions::default().default_verdict(Decision::Drop)).await;

    harness.inject(5, 1, b"").await;
    assert_eq!(harness.next_verdict().await, Verdict::drop(5));
}

#[tokio::test]
async fn mismatched_verdicts_are_never_forwarded() {
    let mut harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);

    harness.inject(1, 7, b"one").await;
    harness.inject(2, 7, b"two").await;
    assert_eq!(a.recv_packet().await.id, 1);
    assert_eq!(a.recv_packet().await.id, 2);

    // Delivering packet 2 answered packet 1 on A's behalf.
    assert_eq!(harness.next_verdict().await, Verdict::accept(1));

    // Only the latest delivery can be answered.
    a.send_verdict(Verdict::accept(1)).await;
    a.send_verdict(Verdict::accept(2)).await;
    assert_eq!(harness.next_verdict().await, Verdict::accept(2));

    a.send(ControlMessage::Goodbye).await;
    assert_eq!(a.recv().await, None);
    harness.wait_for_peers(0).await;
    assert_eq!(harness.upstream.try_next_event(), None);
    assert_eq!(harness.daemon.stats().verdicts_rejected(), 1);
}

#[tokio::test]
async fn superseded_packets_are_answered_while_the_peer_lives() {
    let options = DaemonOptions::default().default_verdict(Decision::Drop);
    let mut harness = Harness::start(options).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);

    for burst in 0..20u64 {
        let (first, second) = (burst * 2, burst * 2 + 1);
        harness.inject(first, 7, b"first").await;
        harness.inject(second, 7, b"second").await;
        assert_eq!(a.recv_packet().await.id, first);
        assert_eq!(a.recv_packet().await.id, second);

        assert_eq!(harness.next_verdict().await, Verdict::drop(first));
        a.send_verdict(Verdict::accept(second)).await;
        assert_eq!(harness.next_verdict().await, Verdict::accept(second));
    }

    let peers = harness.daemon.peers().await.unwrap();
    assert_eq!(peers[0].state, PeerState::Authenticated);
    assert_eq!(peers[0].in_flight, 0);
    assert_eq!(harness.daemon.stats().verdicts_defaulted(), 20);
    assert_eq!(harness.daemon.stats().verdicts_rejected(), 0);
}

#[tokio::test]
async fn repeated_bad_verdicts_disconnect_the_peer() {
    let mut harness = Harness::start(DaemonOptions::default().max_verdict_errors(2)).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);

    harness.inject(1, 7, b"").await;
    assert_eq!(a.recv_packet().await.id, 1);

    a.send_verdict(Verdict::accept(5)).await;
    a.send_raw_datagram(b"junk").await;

    assert_eq!(a.recv().await, Some(ControlMessage::Error { code: ErrorCode::PacketIdMismatch }));
    assert_eq!(a.recv().await, None);
    assert_eq!(harness.next_verdict().await, Verdict::accept(1));
    assert_eq!(harness.daemon.stats().verdicts_rejected(), 2);
}

#[tokio::test]
async fn packets_and_verdicts_keep_their_order() {
    let mut harness = Harness::start(DaemonOptions::default().strict_verdicts(false)).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(3, "a").await, ControlMessage::RegisterAck);

    for id in 1..=10 {
        harness.inject(id, 3, b"data").await;
    }

    let mut received = Vec::new();
    for _ in 1..=10 {
        received.push(a.recv_packet().await.id);
    }
    assert_eq!(received, (1..=10).collect::<Vec<_>>());

    for id in received.iter().rev() {
        a.send_verdict(Verdict::drop(*id)).await;
    }

    let mut forwarded = Vec::new();
    for _ in 1..=10 {
        forwarded.push(harness.next_verdict().await.id);
    }
    assert_eq!(forwarded, (1..=10).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn goodbye_frees_the_mark() {
    let harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);
    a.send(ControlMessage::Goodbye).await;
    assert_eq!(a.recv().await, None);
    harness.wait_for_peers(0).await;

    assert!(!DataChannel::daemon_path(&harness.dir, "a").exists());

    let mut b = harness.peer().await;
    assert_eq!(b.register(7, "b").await, ControlMessage::RegisterAck);

    let peers = harness.daemon.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr.as_deref(), Some("b"));
}

#[tokio::test]
async fn set_mode_configures_upstream_once() {
    let mut harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);

    a.set_mode(CopyMode::Packet, 4).await;
    assert_eq!(
        harness.next_event().await,
        UpstreamEvent::Configure(UpstreamMode::new(CopyMode::Packet, 4))
    );

    // Same mode again, no upstream call.
    a.set_mode(CopyMode::Packet, 4).await;

    harness.inject(1, 7, b"0123456789").await;
    let packet = a.recv_packet().await;
    assert_eq!(packet.payload, Bytes::from_static(b"0123"));

    a.send_verdict(Verdict::accept(1)).await;
    assert_eq!(harness.next_event().await, UpstreamEvent::Verdict(Verdict::accept(1)));
    assert_eq!(harness.daemon.stats().mode_changes(), 1);
}

#[tokio::test]
async fn set_mode_before_register_is_refused() {
    let harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    a.set_mode(CopyMode::Packet, 0).await;
    assert_eq!(a.recv().await, Some(ControlMessage::Error { code: ErrorCode::PermissionDenied }));
    assert_eq!(a.recv().await, None);
}

#[tokio::test]
async fn bad_magic_is_a_protocol_error() {
    let harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    a.control.get_mut().write_all(b"NOPE\x00\x01\x00\x00").await.unwrap();

    assert_eq!(a.recv().await, Some(ControlMessage::Error { code: ErrorCode::Protocol }));
    assert_eq!(a.recv().await, None);
}

#[tokio::test]
async fn slow_handshakes_time_out() {
    let options = DaemonOptions::default()
        .handshake_timeout(Some(Duration::from_millis(50)))
        .housekeeping_interval(Duration::from_millis(10));
    let harness = Harness::start(options).await;

    let mut a = harness.peer().await;
    assert_eq!(a.recv().await, None);
    harness.wait_for_peers(0).await;
}

#[tokio::test]
async fn shutdown_answers_outstanding_packets() {
    let mut harness = Harness::start(DaemonOptions::default()).await;

    let mut a = harness.peer().await;
    assert_eq!(a.register(7, "a").await, ControlMessage::RegisterAck);
    harness.inject(1, 7, b"").await;
    assert_eq!(a.recv_packet().await.id, 1);

    harness.daemon.shutdown().await.unwrap();

    assert_eq!(harness.next_verdict().await, Verdict::accept(1));
    assert_eq!(a.recv().await, None);
    assert!(matches!(harness.daemon.peers().await, Err(DaemonError::NotBound)));
}

#[tokio::test]
async fn closed_upstream_ends_the_driver() {
    let (upstream, handle) = mem::channel(1);
    let dir = std::env::temp_dir().join(format!("ipqmux-it-{}", rand::random::<u64>()));

    let mut daemon = Daemon::with_options(Ipc::new(), DaemonOptions::default().runtime_dir(dir.clone()));
    daemon.bind(dir.join("ipqmux.sock"), upstream).await.unwrap();

    drop(handle);
    let result = tokio::time::timeout(Duration::from_secs(2), daemon.join()).await.unwrap();
    assert!(matches!(result, Err(DaemonError::Upstream(_))));

    let _ = std::fs::remove_dir_all(&dir);
}
