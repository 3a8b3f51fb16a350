use std::task::{Context, Poll};

use ipqmux_wire::{
    control::CopyMode,
    data::{Packet, Verdict},
};

pub mod mem;

/// The single copy configuration the upstream queue runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UpstreamMode {
    pub mode: CopyMode,
    /// Maximum payload bytes copied in [`CopyMode::Packet`]. 0 means the whole packet.
    pub range: u64,
}

impl UpstreamMode {
    pub const fn new(mode: CopyMode, range: u64) -> Self {
        Self { mode, range }
    }
}

/// The handle into the kernel packet queue.
///
/// There is exactly one upstream per daemon and it has no fallback, so every error returned
/// from these methods is treated as fatal by the driver.
pub trait Upstream: Unpin + Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Polls for the next queued packet.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<Packet, Self::Error>>;

    /// Attempts to hand `verdict` to the upstream. Returns `Ready(Ok(()))` once it is sent.
    fn poll_send(&mut self, cx: &mut Context<'_>, verdict: &Verdict)
        -> Poll<Result<(), Self::Error>>;

    /// Attempts to apply a new copy configuration.
    fn poll_configure(
        &mut self,
        cx: &mut Context<'_>,
        mode: UpstreamMode,
    ) -> Poll<Result<(), Self::Error>>;
}
