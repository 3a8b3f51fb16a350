use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    time::Interval,
};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use ipqmux_common::MessageQueue;
use ipqmux_transport::{DataChannel, Listener, Upstream};
use ipqmux_wire::{
    control::{self, CodecError, ControlMessage, ErrorCode},
    data::{Packet, Verdict},
};

use crate::{
    aggregate::ModeAggregator,
    registry::{PeerId, PeerInfo, PeerState, Registry, Route},
    DaemonError, DaemonOptions, DaemonStats,
};

/// Messages a peer can write or read before another channel gets a turn.
const PEER_BUDGET: usize = 32;

/// Packets read from the upstream in one pass.
const UPSTREAM_BUDGET: usize = 64;

/// Requests from the [`Daemon`](crate::Daemon) front-end.
#[derive(Debug)]
pub(crate) enum Command {
    Snapshot(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown,
}

type ControlConn<Io> = Framed<Io, control::Codec>;

/// The daemon event loop.
///
/// Owns the listener, the upstream and every peer. Each poll runs passes over all channels
/// in a fixed order until none of them makes progress. Every channel that returns
/// `Pending` has registered the task's waker, so a single `Pending` from the driver covers
/// all of them.
pub(crate) struct DaemonDriver<L: Listener, U: Upstream> {
    /// The master control listener.
    pub(crate) listener: L,
    /// The kernel packet queue.
    pub(crate) upstream: U,
    /// Verdicts waiting to be written to the upstream, in issue order.
    pub(crate) upstream_queue: MessageQueue<Verdict>,
    pub(crate) registry: Registry<ControlConn<L::Io>, DataChannel>,
    /// Peer ids visited in the current pass, reused across passes.
    pub(crate) peer_ids: Vec<PeerId>,
    pub(crate) aggregator: ModeAggregator,
    /// Options shared with the front-end.
    pub(crate) options: Arc<DaemonOptions>,
    /// Statistics shared with the front-end.
    pub(crate) stats: Arc<DaemonStats>,
    pub(crate) commands: mpsc::Receiver<Command>,
    /// Drives the timeouts. Also wakes the driver after transient accept errors.
    pub(crate) housekeeping: Interval,
    pub(crate) shutting_down: bool,
    pub(crate) span: tracing::Span,
}

impl<L, U> Future for DaemonDriver<L, U>
where
    L: Listener,
    U: Upstream,
{
    type Output = Result<(), DaemonError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let span = this.span.clone();
        let _entered = span.enter();

        loop {
            let mut progress = false;

            progress |= this.poll_upstream_recv(cx)?;
            progress |= this.poll_upstream_send(cx)?;
            progress |= this.poll_upstream_configure(cx)?;
            progress |= this.poll_accept(cx);

            let mut ids = std::mem::take(&mut this.peer_ids);
            this.registry.ids_into(&mut ids);
            for &id in &ids {
                progress |= this.poll_peer_control(cx, id);
                progress |= this.poll_peer_data(cx, id);
            }
            this.peer_ids = ids;

            progress |= this.poll_commands(cx);
            progress |= this.poll_housekeeping(cx);
            progress |= this.settle();

            if this.shutting_down && this.registry.is_empty() && this.upstream_queue.is_empty() {
                info!("shutdown complete");
                return Poll::Ready(Ok(()));
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

impl<L, U> DaemonDriver<L, U>
where
    L: Listener,
    U: Upstream,
{
    /// Reads packets from the upstream and routes them.
    fn poll_upstream_recv(&mut self, cx: &mut Context<'_>) -> Result<bool, DaemonError> {
        if self.shutting_down {
            return Ok(false);
        }

        for n in 0..UPSTREAM_BUDGET {
            match self.upstream.poll_recv(cx) {
                Poll::Ready(Ok(packet)) => self.on_packet(packet),
                Poll::Ready(Err(e)) => {
                    error!(err = ?e, "upstream receive failed");
                    return Err(DaemonError::Upstream(Box::new(e)));
                }
                Poll::Pending => return Ok(n > 0),
            }
        }

        Ok(true)
    }

    /// Drains the upstream outbound queue.
    fn poll_upstream_send(&mut self, cx: &mut Context<'_>) -> Result<bool, DaemonError> {
        let mut progress = false;

        while let Some(verdict) = self.upstream_queue.front() {
            match self.upstream.poll_send(cx, verdict) {
                Poll::Ready(Ok(())) => {
                    trace!(packet = verdict.id, decision = ?verdict.decision, "verdict sent upstream");
                    let _ = self.upstream_queue.dequeue();
                    progress = true;
                }
                Poll::Ready(Err(e)) => {
                    error!(err = ?e, "upstream send failed");
                    return Err(DaemonError::Upstream(Box::new(e)));
                }
                Poll::Pending => break,
            }
        }

        Ok(progress)
    }

    /// Applies the pending upstream mode, if any.
    fn poll_upstream_configure(&mut self, cx: &mut Context<'_>) -> Result<bool, DaemonError> {
        let Some(mode) = self.aggregator.pending() else {
            return Ok(false);
        };

        match self.upstream.poll_configure(cx, mode) {
            Poll::Ready(Ok(())) => {
                self.aggregator.commit();
                self.stats.increment_mode_changes();
                info!(mode = ?mode.mode, range = mode.range, "upstream mode changed");
                Ok(true)
            }
            Poll::Ready(Err(e)) => {
                error!(err = ?e, ?mode, "upstream configure failed");
                Err(DaemonError::Upstream(Box::new(e)))
            }
            Poll::Pending => Ok(false),
        }
    }

    /// Accepts new control connections.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> bool {
        if self.shutting_down {
            return false;
        }

        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok(io)) => {
                if let Some(max) = self.options.max_peers {
                    if self.registry.len() >= max {
                        warn!(max, "max peers reached, rejecting new connection");
                        drop(io);
                        return true;
                    }
                }

                let id = self.registry.accept(Framed::new(io, control::Codec::new()), Instant::now());
                self.stats.increment_active_peers();
                debug!(peer = %id, "accepted control connection");
                true
            }
            Poll::Ready(Err(e)) => {
                // Retried on the next housekeeping tick at the latest.
                error!(err = ?e, "failed to accept control connection");
                false
            }
            Poll::Pending => false,
        }
    }

    /// Reads and writes a peer's control channel.
    fn poll_peer_control(&mut self, cx: &mut Context<'_>, id: PeerId) -> bool {
        let mut progress = false;

        for _ in 0..PEER_BUDGET {
            let polled = match self.registry.get_mut(id) {
                Some(peer) if peer.state().reads_control() => peer.conn.poll_next_unpin(cx),
                _ => break,
            };

            match polled {
                Poll::Ready(Some(Ok(msg))) => {
                    progress = true;
                    self.on_control(id, msg);
                }
                Poll::Ready(Some(Err(CodecError::Io(e)))) => {
                    progress = true;
                    debug!(peer = %id, err = ?e, "control channel read failed");
                    self.registry.handle_channel_fault(id);
                    break;
                }
                Poll::Ready(Some(Err(e))) => {
                    progress = true;
                    warn!(peer = %id, err = %e, "malformed control message");
                    self.registry.handle_protocol_error(id, Instant::now());
                    break;
                }
                Poll::Ready(None) => {
                    progress = true;
                    debug!(peer = %id, "control channel closed");
                    self.registry.handle_channel_fault(id);
                    break;
                }
                Poll::Pending => break,
            }
        }

        progress | self.flush_peer_control(cx, id)
    }

    /// Writes out a peer's control queue.
    fn flush_peer_control(&mut self, cx: &mut Context<'_>, id: PeerId) -> bool {
        let mut progress = false;

        loop {
            let Some(peer) = self.registry.get_mut(id) else { break };
            if peer.state() == PeerState::Removable {
                break;
            }

            if peer.control_unflushed {
                match peer.conn.poll_flush_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        peer.control_unflushed = false;
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        debug!(peer = %id, err = ?e, "control channel flush failed");
                        self.registry.handle_channel_fault(id);
                        return true;
                    }
                    Poll::Pending => {}
                }
            }

            if peer.control_queue.is_empty() {
                break;
            }

            let sent = match peer.conn.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => match peer.control_queue.dequeue() {
                    Some(msg) => {
                        trace!(peer = %id, ty = ?msg.message_type(), "sending control message");
                        peer.conn.start_send_unpin(msg)
                    }
                    None => break,
                },
                Poll::Ready(Err(e)) => Err(e),
                Poll::Pending => break,
            };

            match sent {
                Ok(()) => {
                    peer.control_unflushed = true;
                    progress = true;
                }
                Err(e) => {
                    debug!(peer = %id, err = ?e, "control channel write failed");
                    self.registry.handle_channel_fault(id);
                    return true;
                }
            }
        }

        progress
    }

    /// Delivers queued packets to a peer and reads its verdicts.
    fn poll_peer_data(&mut self, cx: &mut Context<'_>, id: PeerId) -> bool {
        let mut progress = false;

        for _ in 0..PEER_BUDGET {
            let Some(peer) = self.registry.get_mut(id) else { break };
            if peer.state() != PeerState::Authenticated {
                break;
            }

            let (Some(data), Some(packet)) = (peer.data.as_ref(), peer.data_queue.front()) else {
                break;
            };
            let packet_id = packet.id;

            match data.poll_send_packet(cx, packet) {
                Poll::Ready(Ok(())) => {
                    trace!(peer = %id, packet = packet_id, "packet delivered");
                    let _ = peer.data_queue.dequeue();
                    self.registry.delivered(id, packet_id, Instant::now());
                    progress = true;
                }
                Poll::Ready(Err(e)) => {
                    warn!(peer = %id, err = ?e, "data channel write failed");
                    self.registry.disconnect(id, Some(ErrorCode::DataChannel), Instant::now());
                    return true;
                }
                Poll::Pending => break,
            }
        }

        for _ in 0..PEER_BUDGET {
            let Some(peer) = self.registry.get_mut(id) else { break };
            if peer.state() != PeerState::Authenticated {
                break;
            }

            let Some(data) = peer.data.as_mut() else { break };

            match data.poll_recv_verdict(cx) {
                Poll::Ready(Ok(Ok(verdict))) => {
                    progress = true;
                    self.on_verdict(id, verdict);
                }
                Poll::Ready(Ok(Err(e))) => {
                    progress = true;
                    warn!(peer = %id, err = %e, "malformed verdict");
                    self.registry.reject_malformed_verdict(id);
                    self.stats.increment_verdicts_rejected();
                    self.check_verdict_errors(id);
                }
                Poll::Ready(Err(e)) => {
                    warn!(peer = %id, err = ?e, "data channel read failed");
                    self.registry.disconnect(id, Some(ErrorCode::DataChannel), Instant::now());
                    return true;
                }
                Poll::Pending => break,
            }
        }

        progress
    }

    /// Serves front-end commands.
    fn poll_commands(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        while !self.shutting_down {
            match self.commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Snapshot(tx))) => {
                    let _ = tx.send(self.registry.snapshot());
                    progress = true;
                }
                Poll::Ready(Some(Command::Shutdown)) => {
                    self.begin_shutdown();
                    progress = true;
                }
                Poll::Ready(None) => {
                    debug!("front-end dropped");
                    self.begin_shutdown();
                    progress = true;
                }
                Poll::Pending => break,
            }
        }

        progress
    }

    /// Runs the timeouts on every housekeeping tick.
    fn poll_housekeeping(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        // Polled until pending so the next tick is registered.
        while self.housekeeping.poll_tick(cx).is_ready() {
            progress |= self.registry.expire(Instant::now()) > 0;
        }

        progress
    }

    /// Removes finished peers, answers the packets they left behind and recomputes the
    /// upstream mode if the authenticated set changed.
    fn settle(&mut self) -> bool {
        let mut progress = false;

        for peer in self.registry.collect_garbage(Instant::now()) {
            self.stats.decrement_active_peers();
            info!(peer = %peer.id(), mark = ?peer.mark(), "peer removed");
            progress = true;
        }

        let unresolved = self.registry.take_unresolved();
        if !unresolved.is_empty() {
            debug!(count = unresolved.len(), "answering packets left by departed peers");
            for packet_id in unresolved {
                self.issue_default(packet_id);
            }
            progress = true;
        }

        self.stats.set_authenticated_peers(self.registry.authenticated_count());

        if self.registry.take_modes_dirty() && self.aggregator.update(self.registry.authenticated_modes())
        {
            debug!(pending = ?self.aggregator.pending(), "upstream mode target changed");
            progress = true;
        }

        progress
    }

    fn on_packet(&mut self, packet: Packet) {
        self.stats.increment_packets_rx();

        match self.registry.route(packet, Instant::now()) {
            Route::Queued(peer) => {
                trace!(%peer, "packet queued");
                self.stats.increment_packets_routed();
            }
            Route::Orphan(packet) => {
                debug!(packet = packet.id, mark = packet.mark, "no peer for mark");
                self.stats.increment_packets_orphaned();
                self.issue_default(packet.id);
            }
            Route::Overflow { peer, evicted } => {
                warn!(%peer, packet = evicted.id, "peer data queue full");
                self.stats.increment_packets_overflowed();
                self.issue_default(evicted.id);
            }
        }
    }

    fn on_control(&mut self, id: PeerId, msg: ControlMessage) {
        trace!(peer = %id, ty = ?msg.message_type(), "control message");
        let now = Instant::now();

        match msg {
            ControlMessage::Register { flags, mark, addr } => {
                let dir = &self.options.runtime_dir;
                // Failures are answered to the peer by the registry.
                let _ = self.registry.handle_register(id, flags, mark, addr, now, |addr| {
                    DataChannel::open(dir, addr)
                });
            }
            ControlMessage::SetMode { mode, range } => {
                let _ = self.registry.handle_set_mode(id, mode, range, now);
            }
            ControlMessage::Goodbye => self.registry.handle_goodbye(id, now),
            ControlMessage::RegisterAck | ControlMessage::Error { .. } => {
                warn!(peer = %id, "peer sent a daemon-only message");
                self.registry.handle_protocol_error(id, now);
            }
        }
    }

    fn on_verdict(&mut self, id: PeerId, verdict: Verdict) {
        match self.registry.accept_verdict(id, verdict) {
            Ok(verdict) => {
                trace!(peer = %id, packet = verdict.id, "forwarding verdict");
                let _ = self.upstream_queue.enqueue(verdict);
                self.stats.increment_verdicts_forwarded();
            }
            Err(e) => {
                debug!(peer = %id, err = %e, "verdict dropped");
                self.stats.increment_verdicts_rejected();
                self.check_verdict_errors(id);
            }
        }
    }

    /// Disconnects a peer that sent too many bad verdicts in a row.
    fn check_verdict_errors(&mut self, id: PeerId) {
        let Some(peer) = self.registry.get(id) else { return };
        if peer.verdict_errors() >= self.options.max_verdict_errors {
            warn!(peer = %id, errors = peer.verdict_errors(), "too many bad verdicts");
            self.registry.disconnect(id, Some(ErrorCode::PacketIdMismatch), Instant::now());
        }
    }

    /// Answers a packet upstream on behalf of an absent peer.
    fn issue_default(&mut self, packet_id: u64) {
        let _ = self.upstream_queue.enqueue(Verdict::new(packet_id, self.options.default_verdict));
        self.stats.add_verdicts_defaulted(1);
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }

        info!(peers = self.registry.len(), "shutting down");
        self.shutting_down = true;

        let now = Instant::now();
        for id in self.registry.ids() {
            self.registry.disconnect(id, None, now);
        }
    }
}
