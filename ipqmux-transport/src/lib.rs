use std::{
    fmt::Debug,
    io,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod datagram;
pub mod ipc;
pub mod upstream;

pub use datagram::DataChannel;
pub use upstream::{Upstream, UpstreamMode};

/// A listening transport that hands out connected control streams.
#[async_trait]
pub trait Listener: Unpin + Send + 'static {
    /// The connected stream type.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The address type this listener binds to.
    type Addr: Debug + Clone + Send + Sync + Unpin + 'static;

    /// Returns the local address this listener is bound to, if any.
    fn local_addr(&self) -> Option<Self::Addr>;

    /// Binds to the given address.
    async fn bind(&mut self, addr: Self::Addr) -> io::Result<()>;

    /// Polls for the next incoming connection.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Self::Io>>;
}
