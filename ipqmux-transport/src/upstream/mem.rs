//! An in-memory [`Upstream`], backed by Tokio channels.
//!
//! The [`MemUpstream`] end is handed to the daemon. The [`MemUpstreamHandle`] end plays the
//! kernel: it injects packets and observes every verdict and configuration call in the
//! order the daemon issued them.

use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use ipqmux_wire::data::{Packet, Verdict};

use super::{Upstream, UpstreamMode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemUpstreamError {
    #[error("Upstream closed")]
    Closed,
}

/// Something the daemon did to the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Verdict(Verdict),
    Configure(UpstreamMode),
}

/// Creates a connected in-memory upstream pair. `buffer` bounds both directions.
pub fn channel(buffer: usize) -> (MemUpstream, MemUpstreamHandle) {
    let (packets_tx, packets_rx) = mpsc::channel(buffer);
    let (events_tx, events_rx) = mpsc::channel(buffer);

    (
        MemUpstream { packets: packets_rx, events: PollSender::new(events_tx) },
        MemUpstreamHandle { packets: packets_tx, events: events_rx },
    )
}

/// The daemon side of an in-memory upstream.
#[derive(Debug)]
pub struct MemUpstream {
    packets: mpsc::Receiver<Packet>,
    events: PollSender<UpstreamEvent>,
}

impl MemUpstream {
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        event: impl FnOnce() -> UpstreamEvent,
    ) -> Poll<Result<(), MemUpstreamError>> {
        ready!(self.events.poll_reserve(cx)).map_err(|_| MemUpstreamError::Closed)?;
        self.events.send_item(event()).map_err(|_| MemUpstreamError::Closed)?;
        Poll::Ready(Ok(()))
    }
}

impl Upstream for MemUpstream {
    type Error = MemUpstreamError;

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<Packet, Self::Error>> {
        match ready!(self.packets.poll_recv(cx)) {
            Some(packet) => Poll::Ready(Ok(packet)),
            None => Poll::Ready(Err(MemUpstreamError::Closed)),
        }
    }

    fn poll_send(
        &mut self,
        cx: &mut Context<'_>,
        verdict: &Verdict,
    ) -> Poll<Result<(), Self::Error>> {
        self.poll_event(cx, || UpstreamEvent::Verdict(verdict.clone()))
    }

    fn poll_configure(
        &mut self,
        cx: &mut Context<'_>,
        mode: UpstreamMode,
    ) -> Poll<Result<(), Self::Error>> {
        self.poll_event(cx, || UpstreamEvent::Configure(mode))
    }
}

/// The kernel side of an in-memory upstream.
#[derive(Debug)]
pub struct MemUpstreamHandle {
    packets: mpsc::Sender<Packet>,
    events: mpsc::Receiver<UpstreamEvent>,
}

impl MemUpstreamHandle {
    /// Queues a packet for the daemon, waiting for capacity.
    pub async fn inject(&self, packet: Packet) -> Result<(), MemUpstreamError> {
        self.packets.send(packet).await.map_err(|_| MemUpstreamError::Closed)
    }

    /// Waits for the next verdict or configuration call. `None` once the daemon is gone.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    /// Returns the next event if one is already buffered.
    pub fn try_next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next verdict, skipping configuration calls.
    pub async fn next_verdict(&mut self) -> Option<Verdict> {
        loop {
            match self.events.recv().await? {
                UpstreamEvent::Verdict(verdict) => return Some(verdict),
                UpstreamEvent::Configure(mode) => {
                    tracing::trace!(?mode, "skipping configure event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::future::poll_fn;
    use ipqmux_wire::control::CopyMode;

    use super::*;

    #[tokio::test]
    async fn relays_packets_and_events_in_order() {
        let (mut upstream, mut handle) = channel(8);

        handle.inject(Packet::new(1, 7, Bytes::new())).await.unwrap();
        let packet = poll_fn(|cx| upstream.poll_recv(cx)).await.unwrap();
        assert_eq!(packet.id, 1);

        let mode = UpstreamMode::new(CopyMode::Packet, 64);
        poll_fn(|cx| upstream.poll_send(cx, &Verdict::accept(1))).await.unwrap();
        poll_fn(|cx| upstream.poll_configure(cx, mode)).await.unwrap();
        poll_fn(|cx| upstream.poll_send(cx, &Verdict::drop(2))).await.unwrap();

        assert_eq!(handle.next_event().await, Some(UpstreamEvent::Verdict(Verdict::accept(1))));
        assert_eq!(handle.next_event().await, Some(UpstreamEvent::Configure(mode)));
        assert_eq!(handle.try_next_event(), Some(UpstreamEvent::Verdict(Verdict::drop(2))));
        assert_eq!(handle.try_next_event(), None);
    }

    #[tokio::test]
    async fn closing_the_handle_fails_the_upstream() {
        let (mut upstream, handle) = channel(1);
        drop(handle);

        assert_eq!(poll_fn(|cx| upstream.poll_recv(cx)).await, Err(MemUpstreamError::Closed));
        assert_eq!(
            poll_fn(|cx| upstream.poll_send(cx, &Verdict::accept(1))).await,
            Err(MemUpstreamError::Closed)
        );
    }
}
