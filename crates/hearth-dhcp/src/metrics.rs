use crate::packet::DhcpMessageType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-message-type counters, bumped for every decoded inbound frame and
/// every generated outbound one. The flusher snapshots and resets them on
/// its own interval; a single mutex is plenty at DHCP packet rates.
#[derive(Clone, Default)]
pub struct MessageCounters {
    inner: Arc<Mutex<HashMap<DhcpMessageType, u64>>>,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, msg_type: DhcpMessageType) {
        let mut counters = self.inner.lock().unwrap();
        *counters.entry(msg_type).or_insert(0) += 1;
    }

    /// Take the non-zero counters, keyed by message name, and start over.
    pub fn snapshot_and_reset(&self) -> HashMap<String, u64> {
        let mut counters = self.inner.lock().unwrap();
        let snapshot = counters
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(t, count)| (t.as_str().to_string(), *count))
            .collect();
        counters.clear();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let counters = MessageCounters::new();
        counters.record(DhcpMessageType::Discover);
        counters.record(DhcpMessageType::Discover);
        counters.record(DhcpMessageType::Offer);

        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.get("DISCOVER"), Some(&2));
        assert_eq!(snapshot.get("OFFER"), Some(&1));
        assert_eq!(snapshot.get("ACK"), None);

        // Counters restart from zero after a snapshot
        assert!(counters.snapshot_and_reset().is_empty());
    }
}
