use chrono::{DateTime, Utc};
use hearth_core::error::{Error, Result};
use hearth_core::types::{ChangeChannel, HistoryAction, HistoryEvent};
use redb::{Database, ReadableTable, TableDefinition};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

/// History table: sequence number -> HistoryEvent JSON
const HISTORY_TABLE: TableDefinition<u64, &str> = TableDefinition::new("lease_history");

/// Monotonic counters: name -> last issued value
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Append-only audit log, kept in its own database file so the high-churn
/// lease store can be rebuilt without losing history.
#[derive(Clone)]
pub struct HistoryLog {
    db: Arc<Database>,
}

/// Event payload for [`HistoryLog::append`]; the log assigns id and
/// timestamp.
pub struct NewEvent<'a> {
    pub mac: &'a str,
    pub action: HistoryAction,
    pub change_channel: ChangeChannel,
    pub ip: Option<Ipv4Addr>,
    pub new_ip: Option<Ipv4Addr>,
    pub name: Option<&'a str>,
    pub new_name: Option<&'a str>,
    pub client_id: Option<&'a str>,
    pub description: String,
}

impl<'a> NewEvent<'a> {
    pub fn new(mac: &'a str, action: HistoryAction, change_channel: ChangeChannel) -> Self {
        Self {
            mac,
            action,
            change_channel,
            ip: None,
            new_ip: None,
            name: None,
            new_name: None,
            client_id: None,
            description: String::new(),
        }
    }

    pub fn ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.ip = ip;
        self
    }

    pub fn new_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.new_ip = ip;
        self
    }

    pub fn name(mut self, name: Option<&'a str>) -> Self {
        self.name = name;
        self
    }

    pub fn new_name(mut self, name: Option<&'a str>) -> Self {
        self.new_name = name;
        self
    }

    pub fn client_id(mut self, client_id: Option<&'a str>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn describe(mut self, description: String) -> Self {
        self.description = description;
        self
    }
}

impl HistoryLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(HISTORY_TABLE)?;
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn append(&self, event: NewEvent<'_>) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let id;
        {
            let mut counters = write_txn.open_table(COUNTERS_TABLE)?;
            id = counters.get("history_id")?.map(|v| v.value()).unwrap_or(0) + 1;
            counters.insert("history_id", id)?;

            let record = HistoryEvent {
                id,
                mac: event.mac.to_string(),
                action: event.action,
                timestamp: Utc::now(),
                ip: event.ip,
                new_ip: event.new_ip,
                name: event.name.map(String::from),
                new_name: event.new_name.map(String::from),
                description: (!event.description.is_empty()).then(|| event.description.clone()),
                client_id: event.client_id.map(String::from),
                change_channel: event.change_channel,
            };

            let json = serde_json::to_string(&record)?;
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            table.insert(id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(id)
    }

    /// Events for one MAC, newest first. Equal timestamps keep insertion
    /// order.
    pub fn for_mac(&self, mac: &str, limit: usize) -> Result<Vec<HistoryEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HISTORY_TABLE)?;

        let mut events = Vec::new();
        let iter = table.iter()?;
        for entry in iter {
            let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
            let event: HistoryEvent = serde_json::from_str(entry.1.value())?;
            if event.mac == mac {
                events.push(event);
            }
        }

        events.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        events.truncate(limit);
        Ok(events)
    }

    /// The hostname recorded on the earliest CLIENT_CREATE event for a MAC.
    pub fn first_client_create_name(&self, mac: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HISTORY_TABLE)?;

        let mut earliest: Option<HistoryEvent> = None;
        let iter = table.iter()?;
        for entry in iter {
            let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
            let event: HistoryEvent = serde_json::from_str(entry.1.value())?;
            if event.mac != mac || event.action != HistoryAction::ClientCreate {
                continue;
            }
            let newer = earliest
                .as_ref()
                .is_some_and(|e| (e.timestamp, e.id) <= (event.timestamp, event.id));
            if !newer {
                earliest = Some(event);
            }
        }

        Ok(earliest.and_then(|e| e.name))
    }

    /// Remove LEASE_RENEWED and INFORM events older than the cutoff. Every
    /// other action is kept indefinitely. Returns the number of deleted
    /// events.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let count;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;

            let mut to_delete = Vec::new();
            {
                let iter = table.iter()?;
                for entry in iter {
                    let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                    let event: HistoryEvent = serde_json::from_str(entry.1.value())?;
                    if matches!(
                        event.action,
                        HistoryAction::LeaseRenewed | HistoryAction::Inform
                    ) && event.timestamp < cutoff
                    {
                        to_delete.push(entry.0.value());
                    }
                }
            }

            count = to_delete.len();
            for id in to_delete {
                table.remove(id)?;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_log() -> (HistoryLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(&dir.path().join("history.redb")).unwrap();
        (log, dir)
    }

    #[test]
    fn test_append_and_query() {
        let (log, _dir) = test_log();
        let mac = "aa:bb:cc:dd:ee:01";

        log.append(
            NewEvent::new(mac, HistoryAction::ClientCreate, ChangeChannel::Dhcp)
                .new_ip(Some("192.168.1.100".parse().unwrap()))
                .name(Some("laptop"))
                .describe("new client".to_string()),
        )
        .unwrap();
        log.append(NewEvent::new(mac, HistoryAction::LeaseIssued, ChangeChannel::Dhcp)).unwrap();
        log.append(NewEvent::new(
            "aa:bb:cc:dd:ee:02",
            HistoryAction::ClientCreate,
            ChangeChannel::Dhcp,
        ))
        .unwrap();

        let events = log.for_mac(mac, 10).unwrap();
        assert_eq!(events.len(), 2);
        // Newest first; equal timestamps fall back to insertion order
        assert_eq!(events[0].action, HistoryAction::LeaseIssued);
        assert_eq!(events[1].action, HistoryAction::ClientCreate);
        assert_eq!(events[1].name.as_deref(), Some("laptop"));

        let limited = log.for_mac(mac, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_first_client_create_name() {
        let (log, _dir) = test_log();
        let mac = "aa:bb:cc:dd:ee:01";

        log.append(
            NewEvent::new(mac, HistoryAction::ClientCreate, ChangeChannel::Dhcp)
                .name(Some("original")),
        )
        .unwrap();
        log.append(
            NewEvent::new(mac, HistoryAction::HostnameUpdated, ChangeChannel::Web)
                .name(Some("original"))
                .new_name(Some("renamed")),
        )
        .unwrap();

        assert_eq!(
            log.first_client_create_name(mac).unwrap().as_deref(),
            Some("original")
        );
        assert_eq!(log.first_client_create_name("ff:ff:ff:ff:ff:ff").unwrap(), None);
    }

    #[test]
    fn test_prune_only_high_volume_actions() {
        let (log, _dir) = test_log();
        let mac = "aa:bb:cc:dd:ee:01";

        log.append(NewEvent::new(mac, HistoryAction::LeaseRenewed, ChangeChannel::Dhcp)).unwrap();
        log.append(NewEvent::new(mac, HistoryAction::Inform, ChangeChannel::Dhcp)).unwrap();
        log.append(NewEvent::new(mac, HistoryAction::LeaseExpired, ChangeChannel::Dhcp)).unwrap();
        log.append(NewEvent::new(mac, HistoryAction::DeviceBlocked, ChangeChannel::Web)).unwrap();

        // Cutoff in the future: every prunable event qualifies
        let pruned = log.prune(Utc::now() + chrono::Duration::hours(1)).unwrap();
        assert_eq!(pruned, 2);

        let remaining = log.for_mac(mac, 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|e| matches!(e.action, HistoryAction::LeaseExpired | HistoryAction::DeviceBlocked)));
    }

    #[test]
    fn test_prune_respects_cutoff() {
        let (log, _dir) = test_log();
        log.append(NewEvent::new("aa:bb:cc:dd:ee:01", HistoryAction::LeaseRenewed, ChangeChannel::Dhcp))
            .unwrap();

        // Cutoff in the past: nothing is old enough
        let pruned = log.prune(Utc::now() - chrono::Duration::hours(1)).unwrap();
        assert_eq!(pruned, 0);
    }
}
