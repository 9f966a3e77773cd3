use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Response memoization keyed by the request's address ("all_clients" for
/// the listing endpoint). Negative lookups are cached like hits; entries
/// past their TTL are evicted lazily on access.
pub struct ApiCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Value, u16, Instant)>>,
}

impl ApiCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<(Value, u16)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, _, created)| now.duration_since(*created) <= self.ttl);
        entries
            .get(key)
            .map(|(value, status, _)| (value.clone(), *status))
    }

    pub fn insert(&self, key: String, value: Value, status: u16) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, (value, status, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hit_and_lazy_eviction() {
        let cache = ApiCache::new(Duration::from_millis(30));
        cache.insert("10.0.0.5".to_string(), json!({"mac": "aa"}), 200);

        let (value, status) = cache.get("10.0.0.5").unwrap();
        assert_eq!(status, 200);
        assert_eq!(value["mac"], "aa");

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("10.0.0.5").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_negative_responses_are_cached() {
        let cache = ApiCache::new(Duration::from_secs(10));
        cache.insert("10.0.0.9".to_string(), json!({"error": "Client not found"}), 404);
        let (_, status) = cache.get("10.0.0.9").unwrap();
        assert_eq!(status, 404);
    }
}
