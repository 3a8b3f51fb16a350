use std::{
    collections::VecDeque,
    fmt, io,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use ipqmux_common::{MessageQueue, QueueLimit};
use ipqmux_transport::UpstreamMode;
use ipqmux_wire::{
    control::{ControlMessage, CopyMode, ErrorCode, ADDR_LEN},
    data::{Packet, Verdict},
};

use crate::DaemonOptions;

/// Identifies a peer for its whole lifetime. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Lifecycle of a peer.
///
/// ```text
/// Connecting --Register ok--> Authenticated --Goodbye / fault--> Disconnecting
///      |                                                              |
///      +--Register refused--> Disconnecting --control queue drained--> Removable --gc--> gone
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Connecting,
    Authenticated,
    Disconnecting,
    Removable,
}

impl PeerState {
    /// Whether the control channel is still read in this state.
    #[inline]
    pub fn reads_control(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticated)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Mark {0} is already in use")]
    MarkInUse(u64),
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Invalid peer address: {0:?}")]
    InvalidAddress(String),
    #[error("Peer address is already in use: {0:?}")]
    AddressInUse(String),
    #[error("Peer is already registered")]
    AlreadyRegistered,
    #[error("Failed to open data channel: {0:?}")]
    DataChannel(#[source] io::Error),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

impl RegistrationError {
    /// The error code reported to the peer, if the peer can still be told.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::MarkInUse(_) => Some(ErrorCode::MarkInUse),
            Self::PermissionDenied => Some(ErrorCode::PermissionDenied),
            Self::InvalidAddress(_) | Self::AddressInUse(_) => Some(ErrorCode::InvalidAddress),
            Self::AlreadyRegistered => Some(ErrorCode::AlreadyRegistered),
            Self::DataChannel(_) => Some(ErrorCode::DataChannel),
            Self::UnknownPeer(_) => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerdictError {
    #[error("Verdict for packet {got}, expected {expected:?}")]
    PacketIdMismatch { expected: Option<u64>, got: u64 },
    #[error("Malformed verdict")]
    Malformed,
    #[error("Peer is not authenticated")]
    NotAuthenticated,
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Where an upstream packet ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    /// Queued for delivery to this peer.
    Queued(PeerId),
    /// No authenticated peer holds the packet's mark.
    Orphan(Packet),
    /// The peer's data queue was full and `evicted` was given up.
    Overflow { peer: PeerId, evicted: Packet },
}

/// Diagnostics for one peer, as returned by [`Registry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub state: PeerState,
    pub mark: Option<u64>,
    pub addr: Option<String>,
    pub mode: UpstreamMode,
    pub data_queue_len: usize,
    pub control_queue_len: usize,
    pub in_flight: usize,
}

/// One connected peer.
///
/// `C` is the control channel and `D` the data channel. The registry only stores them; all
/// I/O on them is done by the driver.
#[derive(Debug)]
pub struct Peer<C, D> {
    id: PeerId,
    state: PeerState,
    mark: Option<u64>,
    flags: u32,
    addr: Option<String>,
    pub(crate) conn: C,
    pub(crate) data: Option<D>,
    pub(crate) data_queue: MessageQueue<Packet>,
    pub(crate) control_queue: MessageQueue<ControlMessage>,
    /// Set while a control message has been written but not yet flushed.
    pub(crate) control_unflushed: bool,
    requested_mode: UpstreamMode,
    /// Delivered packets not answered yet, oldest first.
    in_flight: VecDeque<u64>,
    last_delivered: Option<u64>,
    verdict_errors: usize,
    connected_at: Instant,
    /// Last time the data queue was empty or made write progress.
    last_progress: Instant,
    disconnecting_since: Option<Instant>,
}

impl<C, D> Peer<C, D> {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn mark(&self) -> Option<u64> {
        self.mark
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn requested_mode(&self) -> UpstreamMode {
        self.requested_mode
    }

    pub fn data_queue(&self) -> &MessageQueue<Packet> {
        &self.data_queue
    }

    pub fn control_queue(&self) -> &MessageQueue<ControlMessage> {
        &self.control_queue
    }

    /// Consecutive rejected verdicts.
    pub fn verdict_errors(&self) -> usize {
        self.verdict_errors
    }

    pub fn in_flight(&self) -> impl Iterator<Item = u64> + '_ {
        self.in_flight.iter().copied()
    }

    /// Whether everything queued on the control channel has been written out.
    #[inline]
    pub fn control_drained(&self) -> bool {
        self.control_queue.is_empty() && !self.control_unflushed
    }

    fn queue_control(&mut self, msg: ControlMessage) {
        // The control queue is unbounded, nothing is ever given back.
        let _ = self.control_queue.enqueue(msg);
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            state: self.state,
            mark: self.mark,
            addr: self.addr.clone(),
            mode: self.requested_mode,
            data_queue_len: self.data_queue.len(),
            control_queue_len: self.control_queue.len(),
            in_flight: self.in_flight.len(),
        }
    }
}

/// The set of connected peers.
///
/// Peers are owned by id. A `mark → id` index covers exactly the authenticated peers, which
/// keeps marks unique among them and makes packet routing a single lookup.
///
/// Every teardown path collects the ids of packets the departing peer still held. The
/// driver answers them upstream, see [`Registry::take_unresolved`].
#[derive(Debug)]
pub struct Registry<C, D> {
    peers: FxHashMap<PeerId, Peer<C, D>>,
    marks: FxHashMap<u64, PeerId>,
    next_id: u64,
    data_limit: Option<QueueLimit>,
    strict_verdicts: bool,
    handshake_timeout: Option<Duration>,
    stall_timeout: Option<Duration>,
    linger_timeout: Duration,
    /// Packets no peer will answer anymore.
    unresolved: Vec<u64>,
    /// Set when the authenticated set or a requested mode changed.
    modes_dirty: bool,
}

impl<C, D> Registry<C, D> {
    pub fn new(options: &DaemonOptions) -> Self {
        Self {
            peers: FxHashMap::default(),
            marks: FxHashMap::default(),
            next_id: 0,
            data_limit: options.peer_queue_limit,
            strict_verdicts: options.strict_verdicts,
            handshake_timeout: options.handshake_timeout,
            stall_timeout: options.stall_timeout,
            linger_timeout: options.linger_timeout,
            unresolved: Vec::new(),
            modes_dirty: false,
        }
    }

    /// Adds a newly accepted connection as a [`PeerState::Connecting`] peer.
    pub fn accept(&mut self, conn: C, now: Instant) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;

        self.peers.insert(
            id,
            Peer {
                id,
                state: PeerState::Connecting,
                mark: None,
                flags: 0,
                addr: None,
                conn,
                data: None,
                data_queue: MessageQueue::with_limit(self.data_limit),
                control_queue: MessageQueue::new(),
                control_unflushed: false,
                requested_mode: UpstreamMode::default(),
                in_flight: VecDeque::new(),
                last_delivered: None,
                verdict_errors: 0,
                connected_at: now,
                last_progress: now,
                disconnecting_since: None,
            },
        );

        debug!(peer = %id, "peer connecting");
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer<C, D>> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer<C, D>> {
        self.peers.get_mut(&id)
    }

    /// Returns all peer ids, in connection order.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids = Vec::with_capacity(self.peers.len());
        self.ids_into(&mut ids);
        ids
    }

    /// Replaces the contents of `ids` with all peer ids, in connection order.
    pub fn ids_into(&self, ids: &mut Vec<PeerId>) {
        ids.clear();
        ids.extend(self.peers.keys().copied());
        ids.sort_unstable();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of peers currently holding a mark.
    pub fn authenticated_count(&self) -> usize {
        self.marks.len()
    }

    /// Returns the authenticated peer holding `mark`, if any.
    pub fn lookup_by_mark(&self, mark: u64) -> Option<&Peer<C, D>> {
        self.marks.get(&mark).and_then(|id| self.peers.get(id))
    }

    /// Handles a `Register` request from peer `id`.
    ///
    /// On success the data channel is opened with `open_data`, the peer takes `mark`, gets a
    /// `RegisterAck` and becomes [`PeerState::Authenticated`]. On failure the peer gets an
    /// `Error` and starts disconnecting. A held mark is never touched.
    pub fn handle_register<F>(
        &mut self,
        id: PeerId,
        flags: u32,
        mark: u64,
        addr: String,
        now: Instant,
        open_data: F,
    ) -> Result<(), RegistrationError>
    where
        F: FnOnce(&str) -> io::Result<D>,
    {
        let Some(peer) = self.peers.get(&id) else {
            return Err(RegistrationError::UnknownPeer(id));
        };

        let checked = if peer.state != PeerState::Connecting {
            Err(RegistrationError::AlreadyRegistered)
        } else if !is_valid_addr(&addr) {
            Err(RegistrationError::InvalidAddress(addr))
        } else if self.marks.contains_key(&mark) {
            Err(RegistrationError::MarkInUse(mark))
        } else if self.peers.values().any(|p| p.addr.as_deref() == Some(addr.as_str())) {
            Err(RegistrationError::AddressInUse(addr))
        } else {
            open_data(&addr).map(|data| (addr, data)).map_err(RegistrationError::DataChannel)
        };

        let (addr, data) = match checked {
            Ok(opened) => opened,
            Err(e) => {
                warn!(peer = %id, mark, err = %e, "registration refused");
                self.disconnect(id, e.code(), now);
                return Err(e);
            }
        };

        let Some(peer) = self.peers.get_mut(&id) else {
            return Err(RegistrationError::UnknownPeer(id));
        };

        info!(peer = %id, mark, flags, %addr, "peer registered");

        peer.mark = Some(mark);
        peer.flags = flags;
        peer.addr = Some(addr);
        peer.data = Some(data);
        peer.requested_mode = UpstreamMode::default();
        peer.state = PeerState::Authenticated;
        peer.last_progress = now;
        peer.queue_control(ControlMessage::RegisterAck);

        self.marks.insert(mark, id);
        self.modes_dirty = true;

        Ok(())
    }

    /// Handles a `SetMode` request. Only authenticated peers may change their mode.
    pub fn handle_set_mode(
        &mut self,
        id: PeerId,
        mode: CopyMode,
        range: u64,
        now: Instant,
    ) -> Result<(), RegistrationError> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Err(RegistrationError::UnknownPeer(id));
        };

        if peer.state != PeerState::Authenticated {
            warn!(peer = %id, state = ?peer.state, "set mode refused");
            self.disconnect(id, Some(ErrorCode::PermissionDenied), now);
            return Err(RegistrationError::PermissionDenied);
        }

        let requested = UpstreamMode::new(mode, range);
        if peer.requested_mode != requested {
            debug!(peer = %id, ?requested, "peer changed mode");
            peer.requested_mode = requested;
            self.modes_dirty = true;
        }

        Ok(())
    }

    /// Handles a `Goodbye`: the peer starts disconnecting.
    pub fn handle_goodbye(&mut self, id: PeerId, now: Instant) {
        debug!(peer = %id, "peer said goodbye");
        self.disconnect(id, None, now);
    }

    /// Handles a malformed control message: the peer is told, then disconnected.
    pub fn handle_protocol_error(&mut self, id: PeerId, now: Instant) {
        self.disconnect(id, Some(ErrorCode::Protocol), now);
    }

    /// Handles EOF or an I/O error on the control channel. Nothing can be flushed anymore,
    /// so the peer becomes [`PeerState::Removable`] right away.
    pub fn handle_channel_fault(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        debug!(peer = %id, state = ?peer.state, "control channel fault");

        self.modes_dirty |= release(peer, &mut self.marks, &mut self.unresolved);
        peer.control_queue.drain();
        peer.control_unflushed = false;
        peer.state = PeerState::Removable;
    }

    /// Moves a peer to [`PeerState::Disconnecting`], optionally queueing a final `Error`.
    ///
    /// The peer gives up its mark immediately and every packet it still held is collected
    /// as unresolved. Does nothing if the peer is already leaving.
    pub fn disconnect(&mut self, id: PeerId, code: Option<ErrorCode>, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        if matches!(peer.state, PeerState::Disconnecting | PeerState::Removable) {
            return;
        }

        if let Some(code) = code {
            peer.queue_control(ControlMessage::Error { code });
        }

        self.modes_dirty |= release(peer, &mut self.marks, &mut self.unresolved);
        peer.state = PeerState::Disconnecting;
        peer.disconnecting_since = Some(now);
    }

    /// Routes an upstream packet to the authenticated peer holding its mark, cut down to the
    /// peer's requested copy mode.
    pub fn route(&mut self, packet: Packet, now: Instant) -> Route {
        let Some(peer) = self.marks.get(&packet.mark).and_then(|id| self.peers.get_mut(id)) else {
            return Route::Orphan(packet);
        };

        if peer.state != PeerState::Authenticated {
            return Route::Orphan(packet);
        }

        if peer.data_queue.is_empty() {
            // The stall clock starts with the first undelivered packet.
            peer.last_progress = now;
        }

        let UpstreamMode { mode, range } = peer.requested_mode;
        match peer.data_queue.enqueue(packet.copied(mode, range)) {
            None => Route::Queued(peer.id),
            Some(evicted) => Route::Overflow { peer: peer.id, evicted },
        }
    }

    /// Records that `packet_id` was written to peer `id`'s data channel.
    ///
    /// With strict verdicts a new delivery supersedes everything still in flight, since only
    /// the latest packet can be answered. The superseded packets are collected as unresolved
    /// right away, so at most one packet per peer is ever in flight.
    pub fn delivered(&mut self, id: PeerId, packet_id: u64, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else { return };

        if self.strict_verdicts && !peer.in_flight.is_empty() {
            trace!(peer = %id, superseded = peer.in_flight.len(), "packets superseded");
            self.unresolved.extend(peer.in_flight.drain(..));
        }

        peer.in_flight.push_back(packet_id);
        peer.last_delivered = Some(packet_id);
        peer.last_progress = now;
    }

    /// Validates a verdict from peer `id` against the packets delivered to it.
    ///
    /// With strict verdicts only the most recently delivered packet can be answered,
    /// otherwise any delivered and unanswered packet. Every packet is answered at most once.
    pub fn accept_verdict(&mut self, id: PeerId, verdict: Verdict) -> Result<Verdict, VerdictError> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Err(VerdictError::UnknownPeer(id));
        };

        if peer.state != PeerState::Authenticated {
            return Err(VerdictError::NotAuthenticated);
        }

        let position = if self.strict_verdicts {
            peer.last_delivered
                .filter(|last| *last == verdict.id)
                .and_then(|last| peer.in_flight.iter().rposition(|id| *id == last))
        } else {
            peer.in_flight.iter().position(|id| *id == verdict.id)
        };

        match position {
            Some(i) => {
                peer.in_flight.remove(i);
                peer.verdict_errors = 0;
                trace!(peer = %id, packet = verdict.id, "verdict accepted");
                Ok(verdict)
            }
            None => {
                peer.verdict_errors += 1;
                let expected = if self.strict_verdicts {
                    peer.last_delivered.filter(|last| peer.in_flight.contains(last))
                } else {
                    peer.in_flight.front().copied()
                };

                Err(VerdictError::PacketIdMismatch { expected, got: verdict.id })
            }
        }
    }

    /// Counts a verdict datagram that could not be decoded against peer `id`.
    pub fn reject_malformed_verdict(&mut self, id: PeerId) -> VerdictError {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.verdict_errors += 1;
                VerdictError::Malformed
            }
            None => VerdictError::UnknownPeer(id),
        }
    }

    /// Disconnects peers that overstayed their handshake or stopped draining their data
    /// queue. Returns how many were expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let elapsed = |since: Instant, timeout: Option<Duration>| {
            timeout.is_some_and(|t| now.saturating_duration_since(since) >= t)
        };

        let expired: Vec<_> = self
            .peers
            .values()
            .filter(|peer| match peer.state {
                PeerState::Connecting => elapsed(peer.connected_at, self.handshake_timeout),
                PeerState::Authenticated => {
                    !peer.data_queue.is_empty() && elapsed(peer.last_progress, self.stall_timeout)
                }
                _ => false,
            })
            .map(|peer| (peer.id, peer.state))
            .collect();

        for (id, state) in &expired {
            warn!(peer = %id, ?state, "peer timed out");
            self.disconnect(*id, None, now);
        }

        expired.len()
    }

    /// Advances departing peers and removes the ones that are done.
    ///
    /// A [`PeerState::Disconnecting`] peer becomes [`PeerState::Removable`] once its control
    /// queue is drained, or when its linger time is up. Removable peers are taken out of the
    /// registry and returned. Dropping them closes their channels and frees their queues.
    pub fn collect_garbage(&mut self, now: Instant) -> Vec<Peer<C, D>> {
        let mut removable = Vec::new();

        for peer in self.peers.values_mut() {
            if peer.state == PeerState::Disconnecting {
                let lingered = peer.disconnecting_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= self.linger_timeout
                });

                if peer.control_drained() || lingered {
                    peer.state = PeerState::Removable;
                }
            }

            if peer.state == PeerState::Removable {
                removable.push(peer.id);
            }
        }

        removable
            .into_iter()
            .filter_map(|id| {
                let peer = self.peers.remove(&id)?;
                debug!(peer = %id, mark = ?peer.mark, "removing peer");
                Some(peer)
            })
            .collect()
    }

    /// Requested modes of all authenticated peers.
    pub fn authenticated_modes(&self) -> impl Iterator<Item = UpstreamMode> + '_ {
        self.marks.values().filter_map(|id| self.peers.get(id)).map(|peer| peer.requested_mode)
    }

    /// Returns whether the authenticated set or any requested mode changed since the last
    /// call.
    pub fn take_modes_dirty(&mut self) -> bool {
        std::mem::take(&mut self.modes_dirty)
    }

    /// Takes the ids of packets left unanswered by departed peers or superseded by a newer
    /// delivery, oldest first per peer.
    pub fn take_unresolved(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.unresolved)
    }

    /// Diagnostics for every peer still in the registry, in connection order.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<_> = self.peers.values().map(Peer::info).collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }
}

/// Unbinds the peer's mark and collects its undelivered and unanswered packets. Returns
/// whether the authenticated set changed.
fn release<C, D>(
    peer: &mut Peer<C, D>,
    marks: &mut FxHashMap<u64, PeerId>,
    unresolved: &mut Vec<u64>,
) -> bool {
    // In flight packets were delivered before anything still queued.
    unresolved.extend(peer.in_flight.drain(..));
    unresolved.extend(peer.data_queue.drain().map(|packet| packet.id));
    peer.last_delivered = None;

    match peer.mark {
        Some(mark) if marks.get(&mark) == Some(&peer.id) => {
            marks.remove(&mark);
            true
        }
        _ => false,
    }
}

/// A peer address must be a plain file name component.
fn is_valid_addr(addr: &str) -> bool {
    !addr.is_empty() &&
        addr.len() <= ADDR_LEN &&
        !addr.starts_with('.') &&
        addr.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
