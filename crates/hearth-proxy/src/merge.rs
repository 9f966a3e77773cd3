use crate::config::MergePolicy;
use chrono::NaiveDateTime;
use hearth_core::timefmt::API_FORMAT;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Merge per-node client lists under the configured duplicate policy.
/// Output is always ordered by numeric IP, descending.
pub fn merge_clients(policy: MergePolicy, lists: Vec<Vec<Value>>) -> Vec<Value> {
    let all: Vec<Value> = lists.into_iter().flatten().collect();

    let mut merged = match policy {
        MergePolicy::KeepAll => all,
        MergePolicy::Merge => {
            let mut keyless = Vec::new();
            let mut by_mac: HashMap<String, Value> = HashMap::new();
            // Walking the reversed list makes the earliest occurrence the
            // last writer, so the first-seen record per MAC survives.
            for client in all.into_iter().rev() {
                match mac_of(&client) {
                    Some(mac) => {
                        by_mac.insert(mac.to_string(), client);
                    }
                    None => keyless.push(client),
                }
            }
            let mut merged: Vec<Value> = by_mac.into_values().collect();
            merged.extend(keyless);
            merged
        }
        MergePolicy::PreferIp => {
            let mut keyless = Vec::new();
            let mut by_mac: HashMap<String, Value> = HashMap::new();
            for client in all {
                let mac = match mac_of(&client) {
                    Some(mac) => mac.to_string(),
                    None => {
                        keyless.push(client);
                        continue;
                    }
                };
                match by_mac.entry(mac) {
                    Entry::Occupied(mut slot) => {
                        if freshness(&client) > freshness(slot.get()) {
                            slot.insert(client);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(client);
                    }
                }
            }
            let mut merged: Vec<Value> = by_mac.into_values().collect();
            merged.extend(keyless);
            merged
        }
    };

    merged.sort_by(|a, b| ip_key(b).cmp(&ip_key(a)));
    merged
}

fn mac_of(client: &Value) -> Option<&str> {
    client.get("mac").and_then(Value::as_str)
}

/// Numeric sort key; records without a usable address sort last.
fn ip_key(client: &Value) -> u32 {
    client
        .get("ip")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .map(u32::from)
        .unwrap_or(0)
}

/// prefer_ip ranking: greatest expire_at wins, updated_at breaks ties,
/// absent timestamps lose to present ones.
fn freshness(client: &Value) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
    (api_ts(client, "expire_at"), api_ts(client, "updated_at"))
}

fn api_ts(client: &Value, field: &str) -> Option<NaiveDateTime> {
    client
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| NaiveDateTime::parse_from_str(s, API_FORMAT).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(mac: &str, ip: &str, expire_at: Option<&str>, updated_at: &str) -> Value {
        json!({
            "mac": mac,
            "ip": ip,
            "expire_at": expire_at,
            "updated_at": updated_at,
        })
    }

    #[test]
    fn test_keep_all_sorts_descending() {
        let merged = merge_clients(
            MergePolicy::KeepAll,
            vec![
                vec![client("aa:01", "192.168.1.5", None, "01.01.2025 10:00:00")],
                vec![
                    client("aa:02", "192.168.2.7", None, "01.01.2025 10:00:00"),
                    client("aa:01", "192.168.2.5", None, "01.01.2025 10:00:00"),
                ],
            ],
        );

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["ip"], "192.168.2.7");
        assert_eq!(merged[1]["ip"], "192.168.2.5");
        assert_eq!(merged[2]["ip"], "192.168.1.5");
    }

    #[test]
    fn test_merge_keeps_first_occurrence() {
        let merged = merge_clients(
            MergePolicy::Merge,
            vec![
                vec![client("aa:01", "192.168.1.5", None, "01.01.2025 10:00:00")],
                vec![client("aa:01", "192.168.2.5", None, "01.01.2025 10:00:00")],
            ],
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["ip"], "192.168.1.5");
    }

    #[test]
    fn test_prefer_ip_takes_latest_expiry() {
        // The record with the later expire_at survives, regardless of
        // source order
        let merged = merge_clients(
            MergePolicy::PreferIp,
            vec![
                vec![client(
                    "aa:01",
                    "192.168.1.5",
                    Some("01.01.2025 10:00:00"),
                    "01.01.2025 09:00:00",
                )],
                vec![client(
                    "aa:01",
                    "192.168.2.5",
                    Some("01.02.2025 10:00:00"),
                    "01.01.2025 08:00:00",
                )],
            ],
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["ip"], "192.168.2.5");
    }

    #[test]
    fn test_prefer_ip_tiebreak_and_missing_expiry() {
        // Ranking is (expire_at, updated_at); present beats absent
        let merged = merge_clients(
            MergePolicy::PreferIp,
            vec![
                vec![client("aa:01", "192.168.1.5", None, "05.01.2025 10:00:00")],
                vec![client(
                    "aa:01",
                    "192.168.2.5",
                    Some("01.01.2025 10:00:00"),
                    "01.01.2025 10:00:00",
                )],
            ],
        );
        assert_eq!(merged[0]["ip"], "192.168.2.5");

        let merged = merge_clients(
            MergePolicy::PreferIp,
            vec![
                vec![client(
                    "aa:01",
                    "192.168.1.5",
                    Some("01.01.2025 10:00:00"),
                    "02.01.2025 10:00:00",
                )],
                vec![client(
                    "aa:01",
                    "192.168.2.5",
                    Some("01.01.2025 10:00:00"),
                    "01.01.2025 10:00:00",
                )],
            ],
        );
        assert_eq!(merged[0]["ip"], "192.168.1.5");
    }

    #[test]
    fn test_distinct_macs_pass_through() {
        let merged = merge_clients(
            MergePolicy::PreferIp,
            vec![
                vec![client("aa:01", "192.168.1.5", None, "01.01.2025 10:00:00")],
                vec![client("aa:02", "192.168.2.5", None, "01.01.2025 10:00:00")],
            ],
        );
        assert_eq!(merged.len(), 2);
    }
}
