use std::env::temp_dir;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixDatagram, UnixStream};
use tokio_util::codec::Framed;

use ipqmux::{
    control::{Codec, ControlMessage, CopyMode},
    data::{Packet, Verdict},
    ipc::Ipc,
    upstream::mem,
    Daemon, DaemonOptions, DataChannel,
};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = temp_dir().join("ipqmux-example");
    let socket = dir.join("ipqmux.sock");

    // The in-memory upstream stands in for the kernel queue
    let (upstream, mut kernel) = mem::channel(16);

    let mut daemon = Daemon::with_options(Ipc::new(), DaemonOptions::default().runtime_dir(&dir));
    daemon.bind(socket.clone(), upstream).await.unwrap();
    println!("Listening on {:?}", daemon.local_addr().unwrap());

    // A peer binds its data socket, then registers for mark 7
    let _ = std::fs::remove_file(DataChannel::peer_path(&dir, "example"));
    let data = UnixDatagram::bind(DataChannel::peer_path(&dir, "example")).unwrap();
    let mut control = Framed::new(UnixStream::connect(&socket).await.unwrap(), Codec::new());

    control
        .send(ControlMessage::Register { flags: 0, mark: 7, addr: "example".to_owned() })
        .await
        .unwrap();
    let reply = control.next().await.unwrap().unwrap();
    println!("Register reply: {reply:?}");

    data.connect(DataChannel::daemon_path(&dir, "example")).unwrap();
    control.send(ControlMessage::SetMode { mode: CopyMode::Packet, range: 0 }).await.unwrap();

    kernel.inject(Packet::new(1, 7, Bytes::from_static(b"hello"))).await.unwrap();
    kernel.inject(Packet::new(2, 9, Bytes::from_static(b"nobody wants this"))).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let n = data.recv(&mut buf).await.unwrap();
    let packet = Packet::decode(&buf[..n]).unwrap();
    println!("Peer received packet {} with payload {:?}", packet.id, packet.payload);

    data.send(&Verdict::drop(packet.id).encode()).await.unwrap();

    for _ in 0..3 {
        println!("Upstream event: {:?}", kernel.next_event().await.unwrap());
    }

    control.send(ControlMessage::Goodbye).await.unwrap();
    daemon.shutdown().await.unwrap();

    let stats = daemon.stats();
    println!(
        "Packets: {} received, {} routed, {} orphaned | verdicts: {} forwarded, {} defaulted",
        stats.packets_rx(),
        stats.packets_routed(),
        stats.packets_orphaned(),
        stats.verdicts_forwarded(),
        stats.verdicts_defaulted(),
    );
}
