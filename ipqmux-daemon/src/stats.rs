use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a daemon.
/// These are shared between the driver task and the [`Daemon`](crate::Daemon) front-end.
#[derive(Debug, Default)]
pub struct DaemonStats {
    /// Number of connected peers, in any state
    active_peers: AtomicUsize,
    /// Number of peers currently holding a mark
    authenticated_peers: AtomicUsize,
    /// Total packets received from the upstream
    packets_rx: AtomicUsize,
    /// Total packets queued to a peer
    packets_routed: AtomicUsize,
    /// Total packets no authenticated peer claimed
    packets_orphaned: AtomicUsize,
    /// Total packets given up because a peer queue was full
    packets_overflowed: AtomicUsize,
    /// Total peer verdicts forwarded upstream
    verdicts_forwarded: AtomicUsize,
    /// Total peer verdicts rejected
    verdicts_rejected: AtomicUsize,
    /// Total verdicts the daemon issued on behalf of absent peers
    verdicts_defaulted: AtomicUsize,
    /// Total upstream reconfigurations
    mode_changes: AtomicUsize,
}

impl DaemonStats {
    #[inline]
    pub(crate) fn increment_active_peers(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrement_active_peers(&self) {
        self.active_peers.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_authenticated_peers(&self, n: usize) {
        self.authenticated_peers.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_packets_rx(&self) {
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_packets_routed(&self) {
        self.packets_routed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_packets_orphaned(&self) {
        self.packets_orphaned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_packets_overflowed(&self) {
        self.packets_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_verdicts_forwarded(&self) {
        self.verdicts_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_verdicts_rejected(&self) {
        self.verdicts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_verdicts_defaulted(&self, n: usize) {
        self.verdicts_defaulted.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_mode_changes(&self) {
        self.mode_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn active_peers(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn authenticated_peers(&self) -> usize {
        self.authenticated_peers.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn packets_rx(&self) -> usize {
        self.packets_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn packets_routed(&self) -> usize {
        self.packets_routed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn packets_orphaned(&self) -> usize {
        self.packets_orphaned.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn packets_overflowed(&self) -> usize {
        self.packets_overflowed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn verdicts_forwarded(&self) -> usize {
        self.verdicts_forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn verdicts_rejected(&self) -> usize {
        self.verdicts_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn verdicts_defaulted(&self) -> usize {
        self.verdicts_defaulted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mode_changes(&self) -> usize {
        self.mode_changes.load(Ordering::Relaxed)
    }
}
