pub mod noop;

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Outbound device-event port. Implementations deliver to an operator
/// channel (messaging bot, mail, ...); the no-op adapter stands in when
/// notifications are disabled.
///
/// Calls are fire-and-forget: adapters must not block the DHCP path and
/// handle their own retries.
pub trait Notifier: Send + Sync {
    /// A MAC never seen before just received its first lease.
    fn notify_new_device(&self, mac: &str, ip: Ipv4Addr, hostname: Option<&str>);

    /// A known device renewed after being silent for longer than the
    /// configured inactivity threshold. `away_for` is a human delta such
    /// as "12 h".
    fn notify_inactive_device(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: Option<&str>,
        away_for: &str,
    );
}

/// Counter-snapshot port for the metrics flusher. Keys are DHCP message
/// type names ("DISCOVER", "ACK", ...).
pub trait MetricsSink: Send + Sync {
    fn write_counters(&self, counters: &HashMap<String, u64>);
}

/// Format a duration the way notifications phrase it.
pub fn human_delta(delta: chrono::Duration) -> String {
    let seconds = delta.num_seconds().max(0);
    if seconds < 3600 {
        format!("{} min", seconds / 60)
    } else if seconds < 86400 {
        format!("{} h", seconds / 3600)
    } else {
        format!("{} d", seconds / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_human_delta() {
        assert_eq!(human_delta(Duration::minutes(5)), "5 min");
        assert_eq!(human_delta(Duration::hours(12)), "12 h");
        assert_eq!(human_delta(Duration::days(9)), "9 d");
        assert_eq!(human_delta(Duration::seconds(-5)), "0 min");
    }
}
