use std::{path::PathBuf, time::Duration};

use ipqmux_common::{OverflowPolicy, QueueLimit};
use ipqmux_wire::data::Decision;

/// The default per-peer data queue capacity.
const DEFAULT_PEER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Directory holding the per-peer data channel sockets.
    pub(crate) runtime_dir: PathBuf,
    /// The verdict issued for packets no peer answers: orphans, overflow evictions and
    /// packets left behind by a departing peer.
    pub(crate) default_verdict: Decision,
    /// If `true`, a verdict is only accepted for the packet most recently delivered to
    /// that peer. Otherwise any delivered, unanswered packet may be answered.
    pub(crate) strict_verdicts: bool,
    /// Consecutive rejected verdicts after which a peer is disconnected.
    pub(crate) max_verdict_errors: usize,
    /// Bound of each peer's outbound data queue. `None` means unbounded.
    pub(crate) peer_queue_limit: Option<QueueLimit>,
    /// The maximum number of concurrent peers.
    pub(crate) max_peers: Option<usize>,
    /// How long a peer may stay unregistered.
    pub(crate) handshake_timeout: Option<Duration>,
    /// How long an authenticated peer may go without draining its data queue.
    pub(crate) stall_timeout: Option<Duration>,
    /// How long a departing peer gets to drain its control queue.
    pub(crate) linger_timeout: Duration,
    /// How often timeouts are checked.
    pub(crate) housekeeping_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/ipqmux"),
            default_verdict: Decision::Accept,
            strict_verdicts: true,
            max_verdict_errors: 8,
            peer_queue_limit: Some(QueueLimit::new(
                DEFAULT_PEER_QUEUE_CAPACITY,
                OverflowPolicy::DropNewest,
            )),
            max_peers: None,
            handshake_timeout: Some(Duration::from_secs(5)),
            stall_timeout: Some(Duration::from_secs(30)),
            linger_timeout: Duration::from_secs(1),
            housekeeping_interval: Duration::from_millis(250),
        }
    }
}

impl DaemonOptions {
    /// Sets the directory the per-peer data sockets are created in.
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Sets the verdict issued on behalf of absent peers.
    pub fn default_verdict(mut self, decision: Decision) -> Self {
        self.default_verdict = decision;
        self
    }

    /// Sets whether only the most recently delivered packet may be answered.
    pub fn strict_verdicts(mut self, strict: bool) -> Self {
        self.strict_verdicts = strict;
        self
    }

    /// Sets the number of consecutive bad verdicts tolerated before a peer is disconnected.
    pub fn max_verdict_errors(mut self, max: usize) -> Self {
        self.max_verdict_errors = max.max(1);
        self
    }

    /// Bounds each peer's data queue. Packets given up on overflow get the default verdict.
    pub fn peer_queue_limit(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.peer_queue_limit = Some(QueueLimit::new(capacity, policy));
        self
    }

    /// Removes the bound on peer data queues.
    pub fn unbounded_peer_queues(mut self) -> Self {
        self.peer_queue_limit = None;
        self
    }

    /// Sets the maximum number of concurrent peers.
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = Some(max_peers);
        self
    }

    /// Sets how long a connected peer may take to register. `None` disables the timeout.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets how long a peer may leave its data queue undrained. `None` disables the timeout.
    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets how long a departing peer gets to receive its last control messages.
    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.linger_timeout = timeout;
        self
    }

    /// Sets the interval at which timeouts are checked.
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        // A zero period would make the interval panic.
        self.housekeeping_interval = interval.max(Duration::from_millis(1));
        self
    }
}
