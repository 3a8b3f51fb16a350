use ipqmux_transport::UpstreamMode;
use ipqmux_wire::control::CopyMode;

/// Combines the modes requested by all authenticated peers into the single mode the
/// upstream queue is run in.
///
/// The copy mode is the most permissive one requested. The range is the largest one
/// requested, where a range of `0` (unlimited) wins over any other.
pub fn aggregate(modes: impl IntoIterator<Item = UpstreamMode>) -> UpstreamMode {
    let mut mode = CopyMode::None;
    let mut range: Option<u64> = None;

    for requested in modes {
        mode = mode.max(requested.mode);
        range = Some(match range {
            Some(0) => 0,
            _ if requested.range == 0 => 0,
            Some(current) => current.max(requested.range),
            None => requested.range,
        });
    }

    UpstreamMode::new(mode, range.unwrap_or(0))
}

/// Tracks the mode applied to the upstream and the one that should be applied next.
///
/// The upstream starts out in the default mode. A configuration call is only needed when
/// the aggregate of the requested modes differs from what was last applied.
#[derive(Debug, Default)]
pub struct ModeAggregator {
    applied: UpstreamMode,
    pending: Option<UpstreamMode>,
}

impl ModeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode the upstream was last configured with.
    pub fn applied(&self) -> UpstreamMode {
        self.applied
    }

    /// Mode waiting to be applied, if it differs from the applied one.
    pub fn pending(&self) -> Option<UpstreamMode> {
        self.pending
    }

    /// Recomputes the target mode. Returns `true` if the target changed.
    pub fn update(&mut self, modes: impl IntoIterator<Item = UpstreamMode>) -> bool {
        let next = aggregate(modes);
        if next == self.pending.unwrap_or(self.applied) {
            return false;
        }

        self.pending = (next != self.applied).then_some(next);
        true
    }

    /// Marks the pending mode as applied and returns it.
    pub fn commit(&mut self) -> Option<UpstreamMode> {
        let mode = self.pending.take()?;
        self.applied = mode;
        Some(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(mode: CopyMode, range: u64) -> UpstreamMode {
        UpstreamMode::new(mode, range)
    }

    #[test]
    fn aggregate_of_nothing_is_default() {
        assert_eq!(aggregate(std::iter::empty()), UpstreamMode::default());
        assert_eq!(aggregate(std::iter::empty()), m(CopyMode::None, 0));
    }

    #[test]
    fn aggregate_picks_max_mode_and_range() {
        assert_eq!(aggregate([m(CopyMode::Meta, 0), m(CopyMode::None, 0)]), m(CopyMode::Meta, 0));
        assert_eq!(
            aggregate([m(CopyMode::Packet, 64), m(CopyMode::Packet, 1500), m(CopyMode::Meta, 100)]),
            m(CopyMode::Packet, 1500)
        );
    }

    #[test]
    fn unlimited_range_dominates() {
        assert_eq!(
            aggregate([m(CopyMode::Packet, 64), m(CopyMode::Packet, 0), m(CopyMode::Packet, 9000)]),
            m(CopyMode::Packet, 0)
        );
    }

    #[test]
    fn range_and_mode_aggregate_independently() {
        assert_eq!(
            aggregate([m(CopyMode::Meta, 512), m(CopyMode::Packet, 64)]),
            m(CopyMode::Packet, 512)
        );
        // A freshly registered peer requests the whole packet until it says otherwise.
        assert_eq!(
            aggregate([m(CopyMode::Packet, 64), m(CopyMode::None, 0)]),
            m(CopyMode::Packet, 0)
        );
    }

    #[test]
    fn aggregator_only_reports_changes() {
        let mut aggregator = ModeAggregator::new();
        assert!(!aggregator.update([m(CopyMode::None, 0)]));
        assert_eq!(aggregator.pending(), None);

        assert!(aggregator.update([m(CopyMode::Packet, 100)]));
        assert_eq!(aggregator.pending(), Some(m(CopyMode::Packet, 100)));
        assert!(!aggregator.update([m(CopyMode::Packet, 100)]));

        assert_eq!(aggregator.commit(), Some(m(CopyMode::Packet, 100)));
        assert_eq!(aggregator.applied(), m(CopyMode::Packet, 100));
        assert_eq!(aggregator.commit(), None);
        assert!(!aggregator.update([m(CopyMode::Packet, 100), m(CopyMode::Meta, 50)]));
    }

    #[test]
    fn reverting_before_commit_cancels_pending() {
        let mut aggregator = ModeAggregator::new();
        assert!(aggregator.update([m(CopyMode::Meta, 0)]));
        assert!(aggregator.update(std::iter::empty()));
        assert_eq!(aggregator.pending(), None);
        assert_eq!(aggregator.commit(), None);
    }
}
