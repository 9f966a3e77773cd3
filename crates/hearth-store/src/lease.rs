use crate::history::{HistoryLog, NewEvent};
use chrono::{DateTime, Duration, Utc};
use hearth_core::addr::{self, PoolRange};
use hearth_core::error::{Error, Result};
use hearth_core::timefmt;
use hearth_core::types::{ChangeChannel, CreateChannel, HistoryAction, Lease, LeaseType};
use hearth_msg::Notifier;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Leases table: mac -> Lease JSON (soft-deleted rows included)
const LEASES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("leases");

/// Live-address index: ip -> mac. Maintained only for live rows holding an
/// address, which makes it double as the uniqueness constraint on live IPs.
const IP_INDEX: TableDefinition<&str, &str> = TableDefinition::new("ip_index");

/// Monotonic counters: name -> last issued value
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub lease_time_secs: u64,
    pub inactive_period: Duration,
}

/// Persistent lease records plus their audit log. Clones share the same
/// database handles; every public operation is one write transaction.
#[derive(Clone)]
pub struct LeaseStore {
    db: Arc<Database>,
    history: HistoryLog,
    notifier: Arc<dyn Notifier>,
    lease_time: Duration,
    inactive_period: Duration,
}

/// Scan the live-address index for the lowest unused pool address.
fn lowest_free_ip<T>(
    ip_idx: &T,
    pool: &PoolRange,
    exclude: &HashSet<Ipv4Addr>,
) -> Result<Option<Ipv4Addr>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    for ip in pool.iter() {
        if exclude.contains(&ip) {
            continue;
        }
        if ip_idx.get(ip.to_string().as_str())?.is_none() {
            return Ok(Some(ip));
        }
    }
    Ok(None)
}

impl LeaseStore {
    pub fn open(
        path: &Path,
        history: HistoryLog,
        notifier: Arc<dyn Notifier>,
        opts: StoreOptions,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LEASES_TABLE)?;
            let _ = write_txn.open_table(IP_INDEX)?;
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            history,
            notifier,
            lease_time: Duration::seconds(opts.lease_time_secs as i64),
            inactive_period: opts.inactive_period,
        })
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    // --- Queries ---

    /// Lease row for a MAC, including soft-deleted rows.
    pub fn get_lease_any(&self, mac: &str) -> Result<Option<Lease>> {
        let read_txn = self.db.begin_read()?;
        let leases = read_txn.open_table(LEASES_TABLE)?;
        match leases.get(mac)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    /// Live lease row for a MAC.
    pub fn get_lease(&self, mac: &str) -> Result<Option<Lease>> {
        Ok(self.get_lease_any(mac)?.filter(Lease::is_live))
    }

    pub fn is_device_blocked(&self, mac: &str) -> Result<bool> {
        Ok(self.get_lease(mac)?.map(|l| l.is_blocked).unwrap_or(false))
    }

    /// The live lease currently holding an address.
    pub fn get_client_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>> {
        let read_txn = self.db.begin_read()?;
        let ip_idx = read_txn.open_table(IP_INDEX)?;
        let mac = match ip_idx.get(ip.to_string().as_str())? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let leases = read_txn.open_table(LEASES_TABLE)?;
        match leases.get(mac.as_str())? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    /// All live rows, after sweeping expirations. `not_expired` drops rows
    /// whose dynamic lease has lapsed.
    pub fn get_all_leases(&self, not_expired: bool) -> Result<Vec<Lease>> {
        self.mark_expired_leases()?;

        let read_txn = self.db.begin_read()?;
        let leases = read_txn.open_table(LEASES_TABLE)?;
        let mut result = Vec::new();
        let iter = leases.iter()?;
        for entry in iter {
            let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
            let lease: Lease = serde_json::from_str(entry.1.value())?;
            if !lease.is_live() {
                continue;
            }
            if not_expired && lease.is_expired {
                continue;
            }
            result.push(lease);
        }
        Ok(result)
    }

    // --- Allocation ---

    /// Resolve the address a MAC should be offered. A static binding wins
    /// unconditionally, a running in-pool dynamic lease is kept, anything
    /// else gets the lowest unused pool address. `None` means exhausted.
    pub fn find_or_allocate(
        &self,
        mac: &str,
        client_id: Option<&str>,
        pool: &PoolRange,
    ) -> Result<Option<(Ipv4Addr, LeaseType)>> {
        self.find_or_allocate_excluding(mac, client_id, pool, &HashSet::new())
    }

    /// [`find_or_allocate`](Self::find_or_allocate) variant that skips
    /// addresses currently promised to other clients (outstanding offers
    /// the engine has not yet seen committed).
    pub fn find_or_allocate_excluding(
        &self,
        mac: &str,
        client_id: Option<&str>,
        pool: &PoolRange,
        reserved: &HashSet<Ipv4Addr>,
    ) -> Result<Option<(Ipv4Addr, LeaseType)>> {
        self.mark_expired_leases()?;
        let now = Utc::now();

        let read_txn = self.db.begin_read()?;
        let leases = read_txn.open_table(LEASES_TABLE)?;
        if let Some(v) = leases.get(mac)? {
            let lease: Lease = serde_json::from_str(v.value())?;
            if lease.is_live() {
                match (lease.lease_type, lease.ip) {
                    (LeaseType::Static, Some(ip)) => {
                        debug!(mac, %ip, "static binding, allowed outside pool");
                        return Ok(Some((ip, LeaseType::Static)));
                    }
                    (LeaseType::Dynamic, Some(ip))
                        if !lease.is_expired
                            && lease.expire_at.is_some_and(|e| e > now) =>
                    {
                        if pool.contains(ip) {
                            debug!(mac, %ip, "existing dynamic lease");
                            return Ok(Some((ip, LeaseType::Dynamic)));
                        }
                        warn!(mac, %ip, %pool, "current address outside pool, reallocating");
                    }
                    _ => {}
                }
            }
        }

        let ip_idx = read_txn.open_table(IP_INDEX)?;
        match lowest_free_ip(&ip_idx, pool, reserved)? {
            Some(ip) => {
                debug!(mac, client_id = client_id.unwrap_or("-"), %ip, "free address found");
                Ok(Some((ip, LeaseType::Dynamic)))
            }
            None => {
                error!(mac, %pool, "no free addresses in pool");
                Ok(None)
            }
        }
    }

    // --- Mutations ---

    pub fn create_lease(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: Option<&str>,
        lease_type: LeaseType,
        client_id: Option<&str>,
        create_channel: CreateChannel,
        change_channel: ChangeChannel,
    ) -> Result<Lease> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, refusing to create lease");
            return Err(Error::MacBlocked(mac.to_string()));
        }

        let now = Utc::now();
        let expire_at = match lease_type {
            LeaseType::Dynamic => Some(now + self.lease_time),
            LeaseType::Static => None,
        };

        let lease = {
            let write_txn = self.db.begin_write()?;
            let lease;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;
                let mut counters = write_txn.open_table(COUNTERS_TABLE)?;

                if leases.get(mac)?.is_some() {
                    return Err(Error::InvalidTransition(format!(
                        "lease row for {mac} already exists"
                    )));
                }
                let ip_key = ip.to_string();
                if ip_idx.get(ip_key.as_str())?.is_some() {
                    return Err(Error::IpConflict(ip_key));
                }

                let id = counters.get("lease_id")?.map(|v| v.value()).unwrap_or(0) + 1;
                counters.insert("lease_id", id)?;

                lease = Lease {
                    id,
                    mac: mac.to_string(),
                    hostname: hostname.map(String::from),
                    ip: Some(ip),
                    client_id: client_id.map(String::from),
                    lease_type,
                    expire_at,
                    is_expired: false,
                    is_blocked: false,
                    trust_flag: change_channel == ChangeChannel::Web
                        && lease_type == LeaseType::Static,
                    is_custom_hostname: hostname.is_some()
                        && change_channel == ChangeChannel::Web,
                    create_channel,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
                ip_idx.insert(ip_key.as_str(), mac)?;
            }
            write_txn.commit()?;
            lease
        };

        let description = match create_channel {
            CreateChannel::StaticLease => format!(
                "new client via static binding, ip {ip}, hostname {}",
                hostname.unwrap_or("-")
            ),
            CreateChannel::DhcpRequest => {
                format!("new client, hostname {}", hostname.unwrap_or("-"))
            }
        };
        self.history.append(
            NewEvent::new(mac, HistoryAction::ClientCreate, change_channel)
                .new_ip(Some(ip))
                .name(hostname)
                .client_id(client_id)
                .describe(description),
        )?;

        if lease_type == LeaseType::Dynamic {
            self.history.append(
                NewEvent::new(mac, HistoryAction::LeaseIssued, change_channel)
                    .new_ip(Some(ip))
                    .name(hostname)
                    .client_id(client_id)
                    .describe(format!(
                        "lease issued: ip {ip} until {}",
                        expire_at.map(timefmt::format_stored).unwrap_or_default()
                    )),
            )?;
        }

        if create_channel != CreateChannel::StaticLease {
            self.notifier.notify_new_device(mac, ip, hostname);
        }

        info!(mac, %ip, %lease_type, %create_channel, "lease created");
        Ok(lease)
    }

    /// Move a lease to a new address. Equal addresses are a silent no-op so
    /// the audit log only carries real changes.
    pub fn update_ip(
        &self,
        mac: &str,
        new_ip: Ipv4Addr,
        client_id: Option<&str>,
        change_channel: ChangeChannel,
    ) -> Result<()> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, refusing ip update");
            return Err(Error::MacBlocked(mac.to_string()));
        }

        let now = Utc::now();
        let old_ip;
        let lease_type;
        let hostname;
        let history_client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.ip == Some(new_ip) {
                    return Ok(());
                }

                let ip_key = new_ip.to_string();
                let owner = ip_idx.get(ip_key.as_str())?.map(|v| v.value().to_string());
                if owner.as_deref().is_some_and(|o| o != mac) {
                    return Err(Error::IpConflict(ip_key));
                }

                old_ip = lease.ip;
                if let Some(old) = lease.ip.take() {
                    ip_idx.remove(old.to_string().as_str())?;
                }
                lease.ip = Some(new_ip);
                if lease.lease_type == LeaseType::Dynamic {
                    lease.expire_at = Some(now + self.lease_time);
                } else {
                    lease.expire_at = None;
                }
                lease.is_expired = false;
                lease.updated_at = now;
                if client_id.is_some() {
                    lease.client_id = client_id.map(String::from);
                }

                lease_type = lease.lease_type;
                hostname = lease.hostname.clone();
                history_client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
                ip_idx.insert(ip_key.as_str(), mac)?;
            }
            write_txn.commit()?;
        }

        let (action, description) = match lease_type {
            LeaseType::Static => (
                HistoryAction::StaticAssigned,
                format!("static ip assigned: {new_ip}"),
            ),
            LeaseType::Dynamic => (
                HistoryAction::LeaseIssued,
                format!("lease issued: ip {new_ip}"),
            ),
        };
        self.history.append(
            NewEvent::new(mac, action, change_channel)
                .ip(old_ip)
                .new_ip(Some(new_ip))
                .name(hostname.as_deref())
                .client_id(history_client_id.as_deref())
                .describe(description),
        )?;

        info!(mac, old_ip = ?old_ip, %new_ip, %change_channel, "ip updated");
        Ok(())
    }

    /// Rename a device. Names supplied through the admin channel take
    /// precedence: once `is_custom_hostname` is set, DHCP-supplied names
    /// are ignored until the flag is reset.
    pub fn update_hostname(
        &self,
        mac: &str,
        hostname: &str,
        client_id: Option<&str>,
        change_channel: ChangeChannel,
    ) -> Result<()> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, hostname update skipped");
            return Ok(());
        }

        let now = Utc::now();
        let old_hostname;
        let ip;
        let history_client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.hostname.as_deref() == Some(hostname) {
                    return Ok(());
                }
                if change_channel == ChangeChannel::Dhcp && lease.is_custom_hostname {
                    debug!(mac, "custom hostname set, dhcp rename ignored");
                    return Ok(());
                }

                old_hostname = lease.hostname.clone();
                ip = lease.ip;
                lease.hostname = Some(hostname.to_string());
                if change_channel == ChangeChannel::Web {
                    lease.is_custom_hostname = true;
                }
                lease.updated_at = now;
                if client_id.is_some() {
                    lease.client_id = client_id.map(String::from);
                }
                history_client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::HostnameUpdated, change_channel)
                .ip(ip)
                .name(old_hostname.as_deref())
                .new_name(Some(hostname))
                .client_id(history_client_id.as_deref())
                .describe(format!("hostname changed to {hostname}")),
        )?;

        info!(
            mac,
            old = old_hostname.as_deref().unwrap_or("-"),
            new = hostname,
            %change_channel,
            "hostname updated"
        );
        Ok(())
    }

    /// STATIC <-> DYNAMIC transition; fixes up expiry bookkeeping on the way.
    pub fn update_lease_type(
        &self,
        mac: &str,
        lease_type: LeaseType,
        client_id: Option<&str>,
        change_channel: ChangeChannel,
    ) -> Result<()> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, lease type unchanged");
            return Err(Error::MacBlocked(mac.to_string()));
        }

        let now = Utc::now();
        let ip;
        let hostname;
        let history_client_id;
        let expire_at;
        let inactivity;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.lease_type == lease_type {
                    return Ok(());
                }

                inactivity = self.inactivity_delta(&lease, now);
                expire_at = match lease_type {
                    LeaseType::Dynamic => Some(now + self.lease_time),
                    LeaseType::Static => None,
                };
                lease.lease_type = lease_type;
                lease.expire_at = expire_at;
                lease.is_expired = false;
                lease.updated_at = now;
                if client_id.is_some() {
                    lease.client_id = client_id.map(String::from);
                }

                ip = lease.ip;
                hostname = lease.hostname.clone();
                history_client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        let (action, description) = match lease_type {
            LeaseType::Static => (
                HistoryAction::StaticAssigned,
                format!("static ip assigned: {}", ip.map(|i| i.to_string()).unwrap_or("-".into())),
            ),
            LeaseType::Dynamic => (
                HistoryAction::DynamicAssigned,
                format!(
                    "lease issued: ip {} until {}",
                    ip.map(|i| i.to_string()).unwrap_or("-".into()),
                    expire_at.map(timefmt::format_stored).unwrap_or_default()
                ),
            ),
        };
        self.history.append(
            NewEvent::new(mac, action, change_channel)
                .ip(ip)
                .new_ip(ip)
                .name(hostname.as_deref())
                .client_id(history_client_id.as_deref())
                .describe(description),
        )?;

        if lease_type == LeaseType::Dynamic {
            if let (Some(ip), Some(away)) = (ip, inactivity) {
                self.notifier.notify_inactive_device(
                    mac,
                    ip,
                    hostname.as_deref(),
                    &hearth_msg::human_delta(away),
                );
            }
        }

        info!(mac, %lease_type, %change_channel, "lease type updated");
        Ok(())
    }

    /// Extend a dynamic lease by one lease period. Fires the
    /// inactive-device notification when the client had been silent past
    /// the configured threshold.
    pub fn renew_lease(
        &self,
        mac: &str,
        client_id: Option<&str>,
        change_channel: ChangeChannel,
    ) -> Result<()> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, renewal refused");
            return Err(Error::MacBlocked(mac.to_string()));
        }

        let now = Utc::now();
        let ip;
        let hostname;
        let history_client_id;
        let new_expire;
        let inactivity;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.lease_type != LeaseType::Dynamic {
                    debug!(mac, "renewal ignored for static binding");
                    return Ok(());
                }

                inactivity = self.inactivity_delta(&lease, now);
                new_expire = now + self.lease_time;
                lease.expire_at = Some(new_expire);
                lease.updated_at = now;
                if client_id.is_some() {
                    lease.client_id = client_id.map(String::from);
                }

                ip = lease.ip;
                hostname = lease.hostname.clone();
                history_client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::LeaseRenewed, change_channel)
                .ip(ip)
                .name(hostname.as_deref())
                .client_id(history_client_id.as_deref())
                .describe(format!(
                    "lease {} renewed until {}",
                    ip.map(|i| i.to_string()).unwrap_or("-".into()),
                    timefmt::format_stored(new_expire)
                )),
        )?;

        if let (Some(ip), Some(away)) = (ip, inactivity) {
            self.notifier.notify_inactive_device(
                mac,
                ip,
                hostname.as_deref(),
                &hearth_msg::human_delta(away),
            );
        }

        info!(mac, ip = ?ip, "lease renewed");
        Ok(())
    }

    /// Sweep every live dynamic lease past its expiry: flag it, release the
    /// address, record LEASE_EXPIRED. Idempotent; returns the number of
    /// transitions.
    pub fn mark_expired_leases(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let mut lapsed = Vec::new();
                {
                    let iter = leases.iter()?;
                    for entry in iter {
                        let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                        let lease: Lease = serde_json::from_str(entry.1.value())?;
                        if lease.is_live()
                            && lease.lease_type == LeaseType::Dynamic
                            && !lease.is_expired
                            && lease.expire_at.is_some_and(|e| e <= now)
                        {
                            lapsed.push(lease);
                        }
                    }
                }

                for mut lease in lapsed {
                    let old_ip = lease.ip.take();
                    if let Some(ip) = old_ip {
                        ip_idx.remove(ip.to_string().as_str())?;
                    }
                    lease.is_expired = true;
                    lease.updated_at = now;
                    let json = serde_json::to_string(&lease)?;
                    leases.insert(lease.mac.as_str(), json.as_str())?;
                    expired.push((lease.mac, old_ip, lease.hostname, lease.client_id));
                }
            }
            write_txn.commit()?;
        }

        for (mac, ip, hostname, client_id) in &expired {
            self.history.append(
                NewEvent::new(mac, HistoryAction::LeaseExpired, ChangeChannel::Dhcp)
                    .ip(*ip)
                    .name(hostname.as_deref())
                    .client_id(client_id.as_deref())
                    .describe(format!(
                        "lease {} expired",
                        ip.map(|i| i.to_string()).unwrap_or("-".into())
                    )),
            )?;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "dynamic leases expired");
        }
        Ok(expired.len())
    }

    /// Client-initiated RELEASE for one (mac, ip) pair. Static bindings and
    /// unknown pairs are ignored.
    pub fn mark_lease_expired(&self, mac: &str, ip: Ipv4Addr) -> Result<()> {
        let now = Utc::now();
        let hostname;
        let client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => {
                        warn!(mac, %ip, "release ignored, client unknown");
                        return Ok(());
                    }
                };
                if !lease.is_live() || lease.ip != Some(ip) {
                    warn!(mac, %ip, "release ignored, no matching lease");
                    return Ok(());
                }
                if lease.lease_type != LeaseType::Dynamic {
                    warn!(mac, %ip, "release ignored for static binding");
                    return Ok(());
                }

                ip_idx.remove(ip.to_string().as_str())?;
                lease.ip = None;
                lease.is_expired = true;
                lease.updated_at = now;
                hostname = lease.hostname.clone();
                client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::LeaseReleased, ChangeChannel::Dhcp)
                .ip(Some(ip))
                .name(hostname.as_deref())
                .client_id(client_id.as_deref())
                .describe(format!("lease {ip} released by client")),
        )?;

        info!(mac, %ip, "lease released");
        Ok(())
    }

    /// Client declined an offered address. The address is withdrawn and,
    /// when a pool is given, a replacement is allocated on the spot. The
    /// declined address is skipped while any other is free.
    pub fn decline_lease(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        client_id: Option<&str>,
        pool: Option<&PoolRange>,
    ) -> Result<Option<Ipv4Addr>> {
        if self.is_device_blocked(mac)? {
            warn!(mac, "device blocked, decline ignored");
            return Ok(None);
        }

        let now = Utc::now();
        let hostname;
        let history_client_id;
        let new_ip;
        let new_expire;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => {
                        warn!(mac, %ip, "decline ignored, client unknown");
                        return Ok(None);
                    }
                };
                if !lease.is_live() || lease.ip != Some(ip) {
                    warn!(mac, %ip, "decline ignored, no matching lease");
                    return Ok(None);
                }
                if lease.lease_type != LeaseType::Dynamic {
                    warn!(mac, %ip, "decline ignored for static binding");
                    return Ok(None);
                }

                ip_idx.remove(ip.to_string().as_str())?;
                lease.ip = None;
                lease.is_expired = true;
                lease.updated_at = now;
                hostname = lease.hostname.clone();
                history_client_id = lease.client_id.clone();

                new_ip = match pool {
                    Some(pool) => lowest_free_ip(&ip_idx, pool, &HashSet::from([ip]))?,
                    None => None,
                };
                if let Some(fresh) = new_ip {
                    lease.ip = Some(fresh);
                    lease.is_expired = false;
                    new_expire = now + self.lease_time;
                    lease.expire_at = Some(new_expire);
                    ip_idx.insert(fresh.to_string().as_str(), mac)?;
                } else {
                    new_expire = now;
                    if pool.is_some() {
                        error!(mac, "no free addresses left after decline");
                    }
                }

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::Decline, ChangeChannel::Dhcp)
                .ip(Some(ip))
                .name(hostname.as_deref())
                .client_id(client_id.or(history_client_id.as_deref()))
                .describe(format!("client declined offered ip {ip}")),
        )?;
        if let Some(fresh) = new_ip {
            self.history.append(
                NewEvent::new(mac, HistoryAction::LeaseIssued, ChangeChannel::Dhcp)
                    .new_ip(Some(fresh))
                    .name(hostname.as_deref())
                    .client_id(client_id.or(history_client_id.as_deref()))
                    .describe(format!(
                        "lease issued: ip {fresh} until {}",
                        timefmt::format_stored(new_expire)
                    )),
            )?;
            info!(mac, declined = %ip, %fresh, "replacement assigned after decline");
        }

        Ok(new_ip)
    }

    /// Audit-only record of a NAK sent for a (mac, ip) pair.
    pub fn nak_lease(&self, mac: &str, ip: Ipv4Addr, client_id: Option<&str>) -> Result<()> {
        if let Some(lease) = self.get_lease(mac)? {
            if lease.ip == Some(ip) {
                self.history.append(
                    NewEvent::new(mac, HistoryAction::Nak, ChangeChannel::Dhcp)
                        .ip(Some(ip))
                        .name(lease.hostname.as_deref())
                        .client_id(client_id.or(lease.client_id.as_deref()))
                        .describe(format!("refused requested ip {ip}")),
                )?;
            }
        }
        Ok(())
    }

    /// Audit-only record of an INFORM answered for a (mac, ip) pair.
    pub fn inform_lease(&self, mac: &str, ip: Ipv4Addr, client_id: Option<&str>) -> Result<()> {
        if let Some(lease) = self.get_lease(mac)? {
            if lease.ip == Some(ip) {
                self.history.append(
                    NewEvent::new(mac, HistoryAction::Inform, ChangeChannel::Dhcp)
                        .ip(Some(ip))
                        .name(lease.hostname.as_deref())
                        .client_id(client_id.or(lease.client_id.as_deref()))
                        .describe(format!("network parameters served for {ip}")),
                )?;
            }
        }
        Ok(())
    }

    /// Block a device: release its address and refuse it service until
    /// unblocked.
    pub fn block_device(&self, mac: &str) -> Result<()> {
        let now = Utc::now();
        let old_ip;
        let hostname;
        let client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }

                old_ip = lease.ip.take();
                if let Some(ip) = old_ip {
                    ip_idx.remove(ip.to_string().as_str())?;
                }
                lease.is_blocked = true;
                lease.is_expired = true;
                lease.updated_at = now;
                hostname = lease.hostname.clone();
                client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::DeviceBlocked, ChangeChannel::Web)
                .ip(old_ip)
                .name(hostname.as_deref())
                .client_id(client_id.as_deref())
                .describe(format!(
                    "device blocked, ip {} released",
                    old_ip.map(|i| i.to_string()).unwrap_or("-".into())
                )),
        )?;

        info!(mac, "device blocked");
        Ok(())
    }

    pub fn unblock_device(&self, mac: &str) -> Result<()> {
        let now = Utc::now();
        let hostname;
        let client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }

                lease.is_blocked = false;
                lease.updated_at = now;
                hostname = lease.hostname.clone();
                client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::DeviceUnblocked, ChangeChannel::Web)
                .name(hostname.as_deref())
                .client_id(client_id.as_deref())
                .describe("device unblocked".to_string()),
        )?;

        info!(mac, "device unblocked");
        Ok(())
    }

    /// Flip the operator trust marker. Only real transitions are recorded;
    /// returns whether anything changed.
    pub fn set_trust_flag(
        &self,
        mac: &str,
        value: bool,
        change_channel: ChangeChannel,
    ) -> Result<bool> {
        let now = Utc::now();
        let ip;
        let hostname;
        let client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.trust_flag == value {
                    return Ok(false);
                }

                lease.trust_flag = value;
                lease.updated_at = now;
                ip = lease.ip;
                hostname = lease.hostname.clone();
                client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        let description = if value {
            format!("device {} marked trusted", hostname.as_deref().unwrap_or("-"))
        } else {
            format!("device {} no longer trusted", hostname.as_deref().unwrap_or("-"))
        };
        self.history.append(
            NewEvent::new(mac, HistoryAction::TrustChanged, change_channel)
                .ip(ip)
                .name(hostname.as_deref())
                .client_id(client_id.as_deref())
                .describe(description),
        )?;

        info!(mac, trusted = value, "trust flag changed");
        Ok(true)
    }

    /// Soft-delete. Only rows that hold no address and are expired may go;
    /// the row is forced back to DYNAMIC so a restore starts clean.
    pub fn delete(&self, mac: &str) -> Result<()> {
        let now = Utc::now();
        let hostname;
        let client_id;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.ip.is_some() || !lease.is_expired {
                    return Err(Error::InvalidTransition(
                        "only expired leases without an address can be deleted".to_string(),
                    ));
                }

                lease.deleted_at = Some(now);
                lease.lease_type = LeaseType::Dynamic;
                hostname = lease.hostname.clone();
                client_id = lease.client_id.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::DeviceDeleted, ChangeChannel::Web)
                .name(hostname.as_deref())
                .client_id(client_id.as_deref())
                .describe("device deleted".to_string()),
        )?;

        info!(mac, "device deleted");
        Ok(())
    }

    /// Reopen a soft-deleted row when its MAC shows up over DHCP again.
    pub fn restore_device(&self, mac: &str) -> Result<()> {
        let now = Utc::now();
        let hostname;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if lease.is_live() {
                    return Ok(());
                }

                lease.deleted_at = None;
                lease.updated_at = now;
                hostname = lease.hostname.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::DeviceRestored, ChangeChannel::Dhcp)
                .name(hostname.as_deref())
                .describe("device restored after deletion".to_string()),
        )?;

        info!(mac, "device restored");
        Ok(())
    }

    /// Admin lease reset: release the address, mark expired and force the
    /// row back to DYNAMIC.
    pub fn reset_lease(&self, mac: &str) -> Result<()> {
        let now = Utc::now();
        let old_ip;
        let hostname;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }
                if lease.ip.is_none() {
                    return Err(Error::InvalidTransition(
                        "lease is already inactive".to_string(),
                    ));
                }

                old_ip = lease.ip.take();
                if let Some(ip) = old_ip {
                    ip_idx.remove(ip.to_string().as_str())?;
                }
                lease.is_expired = true;
                lease.expire_at = Some(now);
                lease.updated_at = now;
                hostname = lease.hostname.clone();

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::LeaseReset, ChangeChannel::Web)
                .ip(old_ip)
                .name(hostname.as_deref())
                .describe(format!(
                    "lease reset, ip {} released",
                    old_ip.map(|i| i.to_string()).unwrap_or("-".into())
                )),
        )?;

        self.update_lease_type(mac, LeaseType::Dynamic, None, ChangeChannel::Web)?;
        info!(mac, "lease reset");
        Ok(())
    }

    /// Drop an operator-assigned hostname, restoring the name the device
    /// first registered with.
    pub fn reset_hostname(&self, mac: &str) -> Result<()> {
        let original = self.history.first_client_create_name(mac)?;

        let now = Utc::now();
        let old_hostname;
        let ip;
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;

                let existing = leases.get(mac)?.map(|v| v.value().to_string());
                let mut lease: Lease = match existing {
                    Some(json) => serde_json::from_str(&json)?,
                    None => return Err(Error::NotFound(mac.to_string())),
                };
                if !lease.is_live() {
                    return Err(Error::NotFound(mac.to_string()));
                }

                old_hostname = lease.hostname.clone();
                ip = lease.ip;
                if lease.hostname != original {
                    lease.hostname = original.clone();
                }
                lease.is_custom_hostname = false;
                lease.updated_at = now;

                let json = serde_json::to_string(&lease)?;
                leases.insert(mac, json.as_str())?;
            }
            write_txn.commit()?;
        }

        self.history.append(
            NewEvent::new(mac, HistoryAction::HostnameUpdated, ChangeChannel::Web)
                .ip(ip)
                .name(old_hostname.as_deref())
                .new_name(original.as_deref())
                .describe(format!(
                    "hostname reset from '{}' to '{}'",
                    old_hostname.as_deref().unwrap_or("-"),
                    original.as_deref().unwrap_or("-")
                )),
        )?;

        info!(mac, "hostname reset");
        Ok(())
    }

    // --- Subnet migration ---

    /// Startup check: when any live address no longer fits the configured
    /// subnet, carry every stray row over to the new network.
    pub fn check_subnet_consistency(
        &self,
        server_ip: Ipv4Addr,
        mask: Ipv4Addr,
        pool: &PoolRange,
    ) -> Result<()> {
        let strays = {
            let read_txn = self.db.begin_read()?;
            let leases = read_txn.open_table(LEASES_TABLE)?;
            let mut strays = false;
            let iter = leases.iter()?;
            for entry in iter {
                let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                let lease: Lease = serde_json::from_str(entry.1.value())?;
                if lease.is_live()
                    && lease.ip.is_some_and(|ip| !addr::in_subnet(ip, server_ip, mask))
                {
                    strays = true;
                    break;
                }
            }
            strays
        };

        if strays {
            warn!("addresses outside the configured subnet found, migrating");
            self.migrate_subnet(server_ip, mask, pool)?;
        }
        Ok(())
    }

    /// Project every out-of-subnet address onto the new network, keeping
    /// host bits where the result is a free pool address and falling back
    /// to a fresh dynamic allocation otherwise.
    fn migrate_subnet(&self, server_ip: Ipv4Addr, mask: Ipv4Addr, pool: &PoolRange) -> Result<()> {
        let mask_int = addr::ipv4_to_u32(mask);
        let network_int = addr::ipv4_to_u32(server_ip) & mask_int;
        let now = Utc::now();

        let mut events = Vec::new();
        {
            let write_txn = self.db.begin_write()?;
            {
                let mut leases = write_txn.open_table(LEASES_TABLE)?;
                let mut ip_idx = write_txn.open_table(IP_INDEX)?;

                let mut rows = Vec::new();
                {
                    let iter = leases.iter()?;
                    for entry in iter {
                        let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                        let lease: Lease = serde_json::from_str(entry.1.value())?;
                        if lease.is_live()
                            && lease.ip.is_some_and(|ip| !addr::in_subnet(ip, server_ip, mask))
                        {
                            rows.push(lease);
                        }
                    }
                }

                for mut lease in rows {
                    let old_ip = match lease.ip {
                        Some(ip) => ip,
                        None => continue,
                    };
                    let candidate = addr::u32_to_ipv4(
                        network_int | (addr::ipv4_to_u32(old_ip) & !mask_int),
                    );

                    let candidate_free = pool.contains(candidate)
                        && ip_idx.get(candidate.to_string().as_str())?.is_none();

                    let (new_ip, action) = if candidate_free {
                        (candidate, HistoryAction::StaticAssigned)
                    } else {
                        match lowest_free_ip(&ip_idx, pool, &HashSet::new())? {
                            Some(fresh) => {
                                lease.lease_type = LeaseType::Dynamic;
                                lease.expire_at = Some(now + self.lease_time);
                                (fresh, HistoryAction::DynamicAssigned)
                            }
                            None => {
                                error!(mac = %lease.mac, %old_ip, "no free address for migration");
                                continue;
                            }
                        }
                    };

                    ip_idx.remove(old_ip.to_string().as_str())?;
                    lease.ip = Some(new_ip);
                    lease.is_expired = false;
                    lease.updated_at = now;
                    ip_idx.insert(new_ip.to_string().as_str(), lease.mac.as_str())?;

                    let json = serde_json::to_string(&lease)?;
                    leases.insert(lease.mac.as_str(), json.as_str())?;

                    info!(mac = %lease.mac, %old_ip, %new_ip, ?action, "address migrated");
                    events.push((lease.mac, old_ip, new_ip, lease.hostname, lease.client_id, action));
                }
            }
            write_txn.commit()?;
        }

        for (mac, old_ip, new_ip, hostname, client_id, action) in events {
            let description = match action {
                HistoryAction::StaticAssigned => format!("static ip assigned: {new_ip}"),
                _ => format!("lease issued: ip {new_ip}"),
            };
            self.history.append(
                NewEvent::new(&mac, action, ChangeChannel::Dhcp)
                    .ip(Some(old_ip))
                    .new_ip(Some(new_ip))
                    .name(hostname.as_deref())
                    .client_id(client_id.as_deref())
                    .describe(description),
            )?;
        }
        Ok(())
    }

    // --- internals ---

    /// How long the device has been silent, when that exceeds the
    /// notification threshold. Judged against the pre-renewal expiry (or
    /// last update for address-less rows).
    fn inactivity_delta(&self, lease: &Lease, now: DateTime<Utc>) -> Option<Duration> {
        let last_activity = lease.expire_at.unwrap_or(lease.updated_at);
        let away = now - last_activity;
        (away > self.inactive_period).then_some(away)
    }
}
