use crate::packet::DhcpMessageType;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key of one logical client transaction. DISCOVER keys on (xid, mac),
/// REQUEST adds the requested address, INFORM adds ciaddr.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnKey {
    kind: DhcpMessageType,
    xid: u32,
    mac: String,
    addr: Option<Ipv4Addr>,
}

impl TxnKey {
    pub fn discover(xid: u32, mac: &str) -> Self {
        Self {
            kind: DhcpMessageType::Discover,
            xid,
            mac: mac.to_string(),
            addr: None,
        }
    }

    pub fn request(xid: u32, mac: &str, requested: Option<Ipv4Addr>) -> Self {
        Self {
            kind: DhcpMessageType::Request,
            xid,
            mac: mac.to_string(),
            addr: requested,
        }
    }

    pub fn inform(xid: u32, mac: &str, ciaddr: Ipv4Addr) -> Self {
        Self {
            kind: DhcpMessageType::Inform,
            xid,
            mac: mac.to_string(),
            addr: Some(ciaddr),
        }
    }
}

/// Short-TTL memoization of response frames. A client retrying the same
/// transaction gets the identical bytes back without touching the store.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<TxnKey, (Vec<u8>, Instant)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &TxnKey) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((bytes, expires)) if *expires > Instant::now() => Some(bytes.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: TxnKey, bytes: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, (bytes, Instant::now() + self.ttl));
    }

    /// Drop lapsed entries; called from the socket loop on idle ticks.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, expires)| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outstanding OFFER promises, held so concurrent DISCOVERs from distinct
/// clients never see the same address. An entry lives until the client
/// commits via REQUEST or the offer TTL lapses.
pub struct OfferBook {
    ttl: Duration,
    offers: Mutex<HashMap<String, (Ipv4Addr, Instant)>>,
}

impl OfferBook {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            offers: Mutex::new(HashMap::new()),
        }
    }

    pub fn reserve(&self, mac: &str, ip: Ipv4Addr) {
        let mut offers = self.offers.lock().unwrap();
        offers.insert(mac.to_string(), (ip, Instant::now() + self.ttl));
    }

    pub fn release(&self, mac: &str) {
        self.offers.lock().unwrap().remove(mac);
    }

    /// Addresses currently promised to clients other than `mac`.
    pub fn reserved_for_others(&self, mac: &str) -> HashSet<Ipv4Addr> {
        let now = Instant::now();
        let mut offers = self.offers.lock().unwrap();
        offers.retain(|_, (_, expires)| *expires > now);
        offers
            .iter()
            .filter(|(holder, _)| holder.as_str() != mac)
            .map(|(_, (ip, _))| *ip)
            .collect()
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.offers.lock().unwrap().retain(|_, (_, expires)| *expires > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_and_expiry() {
        let cache = ResponseCache::new(Duration::from_millis(40));
        let key = TxnKey::discover(0x1234, "aa:bb:cc:dd:ee:01");

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), vec![1, 2, 3]);
        assert_eq!(cache.get(&key), Some(vec![1, 2, 3]));

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_keys_distinguish_transactions() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.insert(TxnKey::discover(1, "aa:bb:cc:dd:ee:01"), vec![1]);

        assert!(cache.get(&TxnKey::discover(2, "aa:bb:cc:dd:ee:01")).is_none());
        assert!(cache.get(&TxnKey::discover(1, "aa:bb:cc:dd:ee:02")).is_none());
        assert!(cache
            .get(&TxnKey::request(1, "aa:bb:cc:dd:ee:01", None))
            .is_none());

        let with_ip = TxnKey::request(7, "aa:bb:cc:dd:ee:01", Some("10.0.0.9".parse().unwrap()));
        cache.insert(with_ip.clone(), vec![9]);
        assert_eq!(cache.get(&with_ip), Some(vec![9]));
        assert!(cache.get(&TxnKey::request(7, "aa:bb:cc:dd:ee:01", None)).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let cache = ResponseCache::new(Duration::from_millis(10));
        cache.insert(TxnKey::discover(1, "aa:bb:cc:dd:ee:01"), vec![1]);
        cache.insert(TxnKey::discover(2, "aa:bb:cc:dd:ee:02"), vec![2]);
        assert_eq!(cache.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_offer_book() {
        let offers = OfferBook::new(Duration::from_secs(30));
        offers.reserve("aa:bb:cc:dd:ee:01", "10.0.0.100".parse().unwrap());

        // Own reservation is not an obstacle
        assert!(offers.reserved_for_others("aa:bb:cc:dd:ee:01").is_empty());
        let others = offers.reserved_for_others("aa:bb:cc:dd:ee:02");
        assert!(others.contains(&"10.0.0.100".parse().unwrap()));

        offers.release("aa:bb:cc:dd:ee:01");
        assert!(offers.reserved_for_others("aa:bb:cc:dd:ee:02").is_empty());
    }

    #[test]
    fn test_offer_book_expiry() {
        let offers = OfferBook::new(Duration::from_millis(10));
        offers.reserve("aa:bb:cc:dd:ee:01", "10.0.0.100".parse().unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert!(offers.reserved_for_others("aa:bb:cc:dd:ee:02").is_empty());
    }
}
