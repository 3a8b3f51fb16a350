use std::{
    io,
    path::PathBuf,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::Listener;

/// The master control listener, on a Unix domain stream socket.
///
/// Every accepted stream is one peer's control channel. The socket file is removed again
/// when the listener is dropped.
#[derive(Debug, Default)]
pub struct Ipc {
    listener: Option<UnixListener>,
    path: Option<PathBuf>,
}

impl Ipc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Listener for Ipc {
    type Io = UnixStream;
    type Addr = PathBuf;

    fn local_addr(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    async fn bind(&mut self, addr: PathBuf) -> io::Result<()> {
        if addr.exists() {
            debug!(?addr, "Socket file already exists. Attempting to remove.");
            if let Err(e) = std::fs::remove_file(&addr) {
                return Err(io::Error::other(format!(
                    "Failed to remove existing socket file, {e:?}"
                )));
            }
        }

        let listener = UnixListener::bind(&addr)?;
        self.listener = Some(listener);
        self.path = Some(addr);
        Ok(())
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<UnixStream>> {
        let Some(ref listener) = self.listener else {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        };

        match listener.poll_accept(cx) {
            Poll::Ready(Ok((io, _addr))) => {
                debug!("accepted IPC connection");
                Poll::Ready(Ok(io))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Ipc {
    fn drop(&mut self) {
        if let (Some(_), Some(path)) = (self.listener.take(), self.path.take()) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::poll_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn accepts_connections() {
        let _ = tracing_subscriber::fmt::try_init();

        let path = std::env::temp_dir().join(format!("ipqmux-ipc-{}.sock", rand::random::<u64>()));

        let mut ipc = Ipc::new();
        ipc.bind(path.clone()).await.unwrap();
        assert_eq!(ipc.local_addr(), Some(path.clone()));

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut server = poll_fn(|cx| ipc.poll_accept(cx)).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(ipc);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn replaces_stale_socket_file() {
        let path = std::env::temp_dir().join(format!("ipqmux-ipc-{}.sock", rand::random::<u64>()));
        std::fs::write(&path, b"stale").unwrap();

        let mut ipc = Ipc::new();
        ipc.bind(path.clone()).await.unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
    }

    #[test]
    fn unbound_listener_errors() {
        let mut ipc = Ipc::new();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let Poll::Ready(Err(e)) = ipc.poll_accept(&mut cx) else { panic!("expected an error") };
        assert_eq!(e.kind(), io::ErrorKind::NotConnected);
    }
}
