use crate::util::unbounded_counter::UnboundedCounter;

/// Traffic counters of a single conduit. Fragments are counted as 'packets', control fragments
///  included.
#[derive(Debug, Default)]
pub(super) struct ConduitStats {
    pub bytes_sent: UnboundedCounter,
    pub bytes_received: UnboundedCounter,
    pub packets_sent: UnboundedCounter,
    pub packets_received: UnboundedCounter,
    pub bundles_sent: UnboundedCounter,
    pub bundles_received: UnboundedCounter,
}

impl ConduitStats {
    pub fn snapshot(&self) -> ConduitStatsSnapshot {
        ConduitStatsSnapshot {
            bytes_sent: self.bytes_sent.value(),
            bytes_received: self.bytes_received.value(),
            packets_sent: self.packets_sent.value(),
            packets_received: self.packets_received.value(),
            bundles_sent: self.bundles_sent.value(),
            bundles_received: self.bundles_received.value(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConduitStatsSnapshot {
    pub bytes_sent: u128,
    pub bytes_received: u128,
    pub packets_sent: u128,
    pub packets_received: u128,
    pub bundles_sent: u128,
    pub bundles_received: u128,
}
