use crate::{MetricsSink, Notifier};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// Notifier used when notifications are disabled. Events are logged but
/// not delivered anywhere.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_new_device(&self, mac: &str, ip: Ipv4Addr, hostname: Option<&str>) {
        debug!(
            mac,
            ip = %ip,
            hostname = hostname.unwrap_or("-"),
            "noop: new-device notification discarded"
        );
    }

    fn notify_inactive_device(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: Option<&str>,
        away_for: &str,
    ) {
        debug!(
            mac,
            ip = %ip,
            hostname = hostname.unwrap_or("-"),
            away_for,
            "noop: inactive-device notification discarded"
        );
    }
}

/// Metrics sink used when the time-series writer is disabled.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn write_counters(&self, counters: &HashMap<String, u64>) {
        debug!(count = counters.len(), "noop: counter snapshot discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_notifier_does_not_panic() {
        let n = NoopNotifier;
        n.notify_new_device("aa:bb:cc:dd:ee:ff", "10.0.0.5".parse().unwrap(), Some("pc"));
        n.notify_inactive_device("aa:bb:cc:dd:ee:ff", "10.0.0.5".parse().unwrap(), None, "9 d");
    }

    #[test]
    fn test_noop_sink_accepts_counters() {
        let sink = NoopMetricsSink;
        let mut counters = HashMap::new();
        counters.insert("DISCOVER".to_string(), 4u64);
        sink.write_counters(&counters);
    }
}
