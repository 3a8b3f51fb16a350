use std::{
    io,
    path::{Path, PathBuf},
    task::{ready, Context, Poll},
};

use tokio::{io::ReadBuf, net::UnixDatagram};
use tracing::debug;

use ipqmux_common::constants::KiB;
use ipqmux_wire::data::{DataError, Packet, Verdict};

/// Largest datagram we accept from a peer.
const RECV_BUFFER_SIZE: usize = 64 * KiB as usize;

/// A peer's data channel: a connected Unix datagram socket, one packet or verdict per
/// datagram.
///
/// The daemon end lives at `<dir>/<addr>.daemon` and is connected to `<dir>/<addr>.peer`,
/// which the peer binds before registering. The daemon end's socket file is removed when
/// the channel is dropped.
#[derive(Debug)]
pub struct DataChannel {
    socket: UnixDatagram,
    local: PathBuf,
    peer: PathBuf,
    buf: Box<[u8]>,
}

impl DataChannel {
    /// Path of the daemon end of the data channel for `addr`.
    pub fn daemon_path(dir: &Path, addr: &str) -> PathBuf {
        dir.join(format!("{addr}.daemon"))
    }

    /// Path the peer named `addr` is expected to bind.
    pub fn peer_path(dir: &Path, addr: &str) -> PathBuf {
        dir.join(format!("{addr}.peer"))
    }

    /// Binds the daemon end for `addr` under `dir` and connects it to the peer end.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(dir: &Path, addr: &str) -> io::Result<Self> {
        let local = Self::daemon_path(dir, addr);
        let peer = Self::peer_path(dir, addr);

        if local.exists() {
            debug!(?local, "Removing stale data socket");
            std::fs::remove_file(&local)?;
        }

        let socket = UnixDatagram::bind(&local)?;
        if let Err(e) = socket.connect(&peer) {
            let _ = std::fs::remove_file(&local);
            return Err(e);
        }

        debug!(?local, ?peer, "data channel open");

        Ok(Self { socket, local, peer, buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice() })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn remote_path(&self) -> &Path {
        &self.peer
    }

    /// Attempts to send `packet` as a single datagram.
    pub fn poll_send_packet(&self, cx: &mut Context<'_>, packet: &Packet) -> Poll<io::Result<()>> {
        let encoded = packet.encode();
        let n = ready!(self.socket.poll_send(cx, &encoded))?;
        if n != encoded.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {n} of {} bytes", encoded.len()),
            )));
        }

        Poll::Ready(Ok(()))
    }

    /// Attempts to receive one verdict datagram.
    ///
    /// The outer result carries socket errors, the inner one a malformed datagram.
    pub fn poll_recv_verdict(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<Result<Verdict, DataError>>> {
        let mut buf = ReadBuf::new(&mut self.buf);
        ready!(self.socket.poll_recv(cx, &mut buf))?;

        Poll::Ready(Ok(Verdict::decode(buf.filled())))
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::future::poll_fn;

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ipqmux-dgram-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn exchanges_packets_and_verdicts() {
        let dir = temp_dir();
        let peer = UnixDatagram::bind(DataChannel::peer_path(&dir, "a")).unwrap();

        let mut channel = DataChannel::open(&dir, "a").unwrap();
        peer.connect(channel.local_path()).unwrap();

        let packet = Packet::new(1, 7, Bytes::from_static(b"payload"));
        poll_fn(|cx| channel.poll_send_packet(cx, &packet)).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..n]).unwrap(), packet);

        peer.send(&Verdict::accept(1).encode()).await.unwrap();
        let verdict = poll_fn(|cx| channel.poll_recv_verdict(cx)).await.unwrap();
        assert_eq!(verdict, Ok(Verdict::accept(1)));

        peer.send(b"junk").await.unwrap();
        let verdict = poll_fn(|cx| channel.poll_recv_verdict(cx)).await.unwrap();
        assert_eq!(verdict, Err(DataError::Short(4)));

        let local = channel.local_path().to_path_buf();
        drop(channel);
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn open_fails_without_peer_socket() {
        let dir = temp_dir();
        assert!(DataChannel::open(&dir, "missing").is_err());
        assert!(!DataChannel::daemon_path(&dir, "missing").exists());
    }
}
