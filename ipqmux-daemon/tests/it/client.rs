//! A minimal peer, written against the wire formats only.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixDatagram, UnixStream};
use tokio_util::codec::Framed;

use ipqmux_transport::DataChannel;
use ipqmux_wire::{
    control::{Codec, ControlMessage, CopyMode},
    data::{Packet, Verdict},
};

const TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestPeer {
    pub control: Framed<UnixStream, Codec>,
    data: Option<UnixDatagram>,
    dir: PathBuf,
}

impl TestPeer {
    pub async fn connect(socket: &Path, dir: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        Self { control: Framed::new(stream, Codec::new()), data: None, dir: dir.to_path_buf() }
    }

    pub async fn send(&mut self, msg: ControlMessage) {
        self.control.send(msg).await.unwrap();
    }

    /// Next control message from the daemon, `None` once the daemon closed the channel.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        match tokio::time::timeout(TIMEOUT, self.control.next()).await.expect("control timeout") {
            Some(Ok(msg)) => Some(msg),
            Some(Err(e)) => panic!("control decode error: {e:?}"),
            None => None,
        }
    }

    /// Binds the data socket for `addr`, registers `mark` and returns the daemon's reply.
    /// On `RegisterAck` the data socket is connected back to the daemon.
    pub async fn register(&mut self, mark: u64, addr: &str) -> ControlMessage {
        let peer_path = DataChannel::peer_path(&self.dir, addr);
        let _ = std::fs::remove_file(&peer_path);
        let data = UnixDatagram::bind(&peer_path).unwrap();

        self.send(ControlMessage::Register { flags: 0, mark, addr: addr.to_owned() }).await;
        let reply = self.recv().await.expect("no reply to register");

        if reply == ControlMessage::RegisterAck {
            data.connect(DataChannel::daemon_path(&self.dir, addr)).unwrap();
            self.data = Some(data);
        }

        reply
    }

    pub async fn set_mode(&mut self, mode: CopyMode, range: u64) {
        self.send(ControlMessage::SetMode { mode, range }).await;
    }

    pub async fn recv_packet(&self) -> Packet {
        let data = self.data.as_ref().expect("not registered");
        let mut buf = vec![0u8; 64 * 1024];
        let n = tokio::time::timeout(TIMEOUT, data.recv(&mut buf))
            .await
            .expect("data timeout")
            .unwrap();
        Packet::decode(&buf[..n]).unwrap()
    }

    pub async fn send_verdict(&self, verdict: Verdict) {
        let data = self.data.as_ref().expect("not registered");
        data.send(&verdict.encode()).await.unwrap();
    }

    pub async fn send_raw_datagram(&self, bytes: &[u8]) {
        let data = self.data.as_ref().expect("not registered");
        data.send(bytes).await.unwrap();
    }
}
