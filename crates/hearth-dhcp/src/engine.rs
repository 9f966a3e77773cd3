use crate::cache::{OfferBook, ResponseCache, TxnKey};
use crate::metrics::MessageCounters;
use crate::packet::{
    ip_list_option, ip_option, message_type_option, string_option, u32_option, DhcpMessageType,
    DhcpPacket, OPT_DNS_SERVER, OPT_DOMAIN_NAME, OPT_LEASE_TIME, OPT_REBINDING_TIME,
    OPT_RENEWAL_TIME, OPT_ROUTER, OPT_SERVER_ID, OPT_SUBNET_MASK,
};
use hearth_core::addr::{self, PoolRange};
use hearth_core::config::Config;
use hearth_core::error::Result;
use hearth_core::types::{ChangeChannel, CreateChannel, LeaseType};
use hearth_store::LeaseStore;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Network parameters the engine serves, parsed out of the raw config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interface: Option<String>,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub pool: PoolRange,
    pub lease_time: u32,
    pub domain_name: String,
    pub cache_ttl: Duration,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let net = &config.network;
        Ok(Self {
            interface: net.interface.clone(),
            server_ip: addr::parse_ipv4(&net.server_ip)?,
            subnet_mask: addr::parse_ipv4(&net.subnet_mask)?,
            gateway: addr::parse_ipv4(&net.gateway)?,
            dns_servers: net
                .dns_servers
                .iter()
                .map(|s| addr::parse_ipv4(s))
                .collect::<Result<Vec<_>>>()?,
            pool: PoolRange::new(
                addr::parse_ipv4(&net.pool_start)?,
                addr::parse_ipv4(&net.pool_end)?,
            )?,
            lease_time: net.lease_time as u32,
            domain_name: net.domain_name.clone(),
            cache_ttl: Duration::from_secs(config.server.cache_ttl),
        })
    }
}

/// Where a response frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDest {
    Broadcast,
    Unicast(IpAddr),
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub bytes: Vec<u8>,
    pub dest: ReplyDest,
}

impl Reply {
    fn broadcast(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            dest: ReplyDest::Broadcast,
        }
    }

    fn unicast(bytes: Vec<u8>, to: IpAddr) -> Self {
        Self {
            bytes,
            dest: ReplyDest::Unicast(to),
        }
    }
}

/// The DHCPv4 state machine over the lease store. Owns the transaction
/// cache and the outstanding-offer book; the socket loop lives in
/// [`run`](Self::run), while [`handle_packet`](Self::handle_packet) is
/// pure dispatch and directly testable.
pub struct DhcpEngine {
    cfg: EngineConfig,
    store: LeaseStore,
    cache: ResponseCache,
    offers: OfferBook,
    counters: MessageCounters,
}

fn nonzero(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    (ip != Ipv4Addr::UNSPECIFIED).then_some(ip)
}

impl DhcpEngine {
    pub fn new(cfg: EngineConfig, store: LeaseStore, counters: MessageCounters) -> Self {
        let cache = ResponseCache::new(cfg.cache_ttl);
        let offers = OfferBook::new(cfg.cache_ttl);
        Self {
            cfg,
            store,
            cache,
            offers,
            counters,
        }
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = self.bind_socket()?;
        info!("DHCP engine listening on 0.0.0.0:67");

        let mut buf = vec![0u8; 1500];
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                result = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)) => {
                    let (len, src) = match result {
                        Err(_) => {
                            // Idle tick: sweep the transaction caches
                            self.cache.purge_expired();
                            self.offers.purge_expired();
                            continue;
                        }
                        Ok(Err(e)) => {
                            error!("socket receive error: {e}");
                            continue;
                        }
                        Ok(Ok(r)) => r,
                    };

                    let packet = match DhcpPacket::parse(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(%src, "dropping packet: {e}");
                            continue;
                        }
                    };

                    // Only BOOTREQUEST frames are for us
                    if packet.op != 1 {
                        continue;
                    }

                    let reply = match self.handle_packet(&packet, src) {
                        Ok(r) => r,
                        Err(e) => {
                            // Store faults drop the packet; the client retries
                            error!(mac = %packet.mac_address(), "error handling packet: {e}");
                            continue;
                        }
                    };

                    if let Some(reply) = reply {
                        let dest = match reply.dest {
                            ReplyDest::Broadcast => SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 68),
                            ReplyDest::Unicast(ip) => SocketAddr::new(ip, 68),
                        };
                        if let Err(e) = socket.send_to(&reply.bytes, dest).await {
                            error!(%dest, "failed to send response: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCP engine shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn bind_socket(&self) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        let bind_addr: SocketAddr = "0.0.0.0:67".parse()?;
        socket.bind(&bind_addr.into())?;

        #[cfg(target_os = "linux")]
        if let Some(ref interface) = self.cfg.interface {
            match socket.bind_device(Some(interface.as_bytes())) {
                Ok(()) => info!(interface = %interface, "bound to interface"),
                Err(e) => {
                    warn!(interface = %interface, "interface binding failed, continuing unbound: {e}")
                }
            }
        }

        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Dispatch one decoded BOOTREQUEST. Returns the response frame to
    /// emit, if any.
    pub fn handle_packet(&self, packet: &DhcpPacket, src: SocketAddr) -> Result<Option<Reply>> {
        let msg_type = match packet.message_type() {
            Some(t) => t,
            None => return Ok(None),
        };
        self.counters.record(msg_type);

        let mac = packet.mac_address();
        let client_id = packet.client_id();
        let hostname = packet.hostname();
        info!(
            %msg_type,
            %mac,
            xid = %format_args!("{:08x}", packet.xid),
            requested = ?packet.requested_ip(),
            hostname = hostname.as_deref().unwrap_or("-"),
            %src,
            "request received"
        );

        // Blocked devices get a NAK for everything; RELEASE alone falls
        // through, where the missing address makes it a no-op anyway.
        if msg_type != DhcpMessageType::Release && self.store.is_device_blocked(&mac)? {
            if let Some(ip) = packet.requested_ip().or(nonzero(packet.ciaddr)) {
                self.store.nak_lease(&mac, ip, client_id.as_deref())?;
            }
            self.counters.record(DhcpMessageType::Nak);
            warn!(%mac, "device blocked, NAK sent");
            return Ok(Some(Reply::broadcast(self.build_nak(packet).to_bytes())));
        }

        match msg_type {
            DhcpMessageType::Discover => {
                self.handle_discover(packet, &mac, client_id.as_deref())
            }
            DhcpMessageType::Request => {
                self.handle_request(packet, &mac, hostname.as_deref(), client_id.as_deref())
            }
            DhcpMessageType::Decline => {
                self.handle_decline(packet, &mac, hostname.as_deref(), client_id.as_deref())
            }
            DhcpMessageType::Release => self.handle_release(packet, &mac),
            DhcpMessageType::Inform => {
                self.handle_inform(packet, &mac, client_id.as_deref(), src)
            }
            // Server-role frames reaching port 67 are noise
            _ => Ok(None),
        }
    }

    fn handle_discover(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        client_id: Option<&str>,
    ) -> Result<Option<Reply>> {
        let key = TxnKey::discover(packet.xid, mac);
        if let Some(bytes) = self.cache.get(&key) {
            self.counters.record(DhcpMessageType::Offer);
            info!(mac, "OFFER replayed from cache");
            return Ok(Some(Reply::broadcast(bytes)));
        }

        let reserved = self.offers.reserved_for_others(mac);
        let (yiaddr, lease_type) = match self
            .store
            .find_or_allocate_excluding(mac, client_id, &self.cfg.pool, &reserved)?
        {
            Some(found) => found,
            None => {
                error!(mac, "no address to offer, staying silent");
                return Ok(None);
            }
        };

        if lease_type == LeaseType::Dynamic && !self.cfg.pool.contains(yiaddr) {
            error!(mac, %yiaddr, "allocator returned an address outside the pool");
            return Ok(None);
        }

        let reply = self.build_reply(packet, DhcpMessageType::Offer, yiaddr, Ipv4Addr::UNSPECIFIED);
        let bytes = reply.to_bytes();
        self.cache.insert(key, bytes.clone());
        self.offers.reserve(mac, yiaddr);
        self.counters.record(DhcpMessageType::Offer);
        info!(mac, %yiaddr, %lease_type, "OFFER sent");
        Ok(Some(Reply::broadcast(bytes)))
    }

    fn handle_request(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        hostname: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Option<Reply>> {
        let requested = packet.requested_ip();
        let key = TxnKey::request(packet.xid, mac, requested);
        if let Some(bytes) = self.cache.get(&key) {
            self.counters.record(DhcpMessageType::Ack);
            info!(mac, "ACK replayed from cache");
            return Ok(Some(Reply::broadcast(bytes)));
        }

        let row = self.store.get_lease(mac)?;
        let static_ip = row
            .as_ref()
            .filter(|r| r.lease_type == LeaseType::Static)
            .and_then(|r| r.ip);

        let (yiaddr, lease_type) = if let Some(static_ip) = static_ip {
            if requested.is_some_and(|req| req != static_ip) {
                return self.refuse(
                    packet,
                    mac,
                    requested,
                    client_id,
                    "conflicts with static binding",
                );
            }
            (static_ip, LeaseType::Static)
        } else if let Some(req) = requested {
            if !self.cfg.pool.contains(req) {
                return self.refuse(packet, mac, Some(req), client_id, "outside pool");
            }
            if self
                .store
                .get_client_by_ip(req)?
                .is_some_and(|owner| owner.mac != mac)
            {
                return self.refuse(packet, mac, Some(req), client_id, "address in use");
            }
            (req, LeaseType::Dynamic)
        } else {
            let reserved = self.offers.reserved_for_others(mac);
            match self
                .store
                .find_or_allocate_excluding(mac, client_id, &self.cfg.pool, &reserved)?
            {
                Some((ip, _)) => (ip, LeaseType::Dynamic),
                None => {
                    return self.refuse(
                        packet,
                        mac,
                        nonzero(packet.ciaddr),
                        client_id,
                        "pool exhausted",
                    );
                }
            }
        };

        self.commit_lease(mac, yiaddr, hostname, lease_type, client_id)?;
        self.offers.release(mac);

        let reply = self.build_reply(packet, DhcpMessageType::Ack, yiaddr, Ipv4Addr::UNSPECIFIED);
        let bytes = reply.to_bytes();
        self.cache.insert(key, bytes.clone());
        self.counters.record(DhcpMessageType::Ack);
        info!(mac, %yiaddr, %lease_type, "ACK sent");
        Ok(Some(Reply::broadcast(bytes)))
    }

    fn handle_decline(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        hostname: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Option<Reply>> {
        let declined = match packet.requested_ip() {
            Some(ip) => ip,
            None => {
                warn!(mac, "DECLINE without requested address ignored");
                return Ok(None);
            }
        };

        match self
            .store
            .decline_lease(mac, declined, client_id, Some(&self.cfg.pool))?
        {
            Some(replacement) => {
                self.commit_lease(mac, replacement, hostname, LeaseType::Dynamic, client_id)?;
                self.counters.record(DhcpMessageType::Ack);
                info!(mac, %declined, %replacement, "ACK sent after DECLINE");
                let reply = self.build_reply(
                    packet,
                    DhcpMessageType::Ack,
                    replacement,
                    Ipv4Addr::UNSPECIFIED,
                );
                Ok(Some(Reply::broadcast(reply.to_bytes())))
            }
            None => {
                warn!(mac, %declined, "no replacement address after DECLINE");
                Ok(None)
            }
        }
    }

    fn handle_release(&self, packet: &DhcpPacket, mac: &str) -> Result<Option<Reply>> {
        let ciaddr = match nonzero(packet.ciaddr) {
            Some(ip) => ip,
            None => {
                warn!(mac, "RELEASE without client address ignored");
                return Ok(None);
            }
        };
        self.store.mark_lease_expired(mac, ciaddr)?;
        info!(mac, %ciaddr, "RELEASE processed, no response");
        Ok(None)
    }

    fn handle_inform(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        client_id: Option<&str>,
        src: SocketAddr,
    ) -> Result<Option<Reply>> {
        let key = TxnKey::inform(packet.xid, mac, packet.ciaddr);
        if let Some(bytes) = self.cache.get(&key) {
            self.counters.record(DhcpMessageType::Ack);
            info!(mac, "INFORM ACK replayed from cache");
            return Ok(Some(Reply::unicast(bytes, src.ip())));
        }

        self.store.inform_lease(mac, packet.ciaddr, client_id)?;

        // Configuration only: yiaddr stays empty, delivery is unicast
        let reply = self.build_reply(
            packet,
            DhcpMessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            packet.ciaddr,
        );
        let bytes = reply.to_bytes();
        self.cache.insert(key, bytes.clone());
        self.counters.record(DhcpMessageType::Ack);
        info!(mac, ciaddr = %packet.ciaddr, "INFORM answered");
        Ok(Some(Reply::unicast(bytes, src.ip())))
    }

    /// Fold a confirmed (mac, ip, type) into the store the way the wire
    /// path is allowed to: restore soft-deleted rows, renew unchanged
    /// leases, otherwise update exactly the fields that differ.
    fn commit_lease(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: Option<&str>,
        lease_type: LeaseType,
        client_id: Option<&str>,
    ) -> Result<()> {
        match self.store.get_lease_any(mac)? {
            None => {
                self.store.create_lease(
                    mac,
                    ip,
                    hostname,
                    lease_type,
                    client_id,
                    CreateChannel::DhcpRequest,
                    ChangeChannel::Dhcp,
                )?;
            }
            Some(row) if !row.is_live() => {
                self.store.restore_device(mac)?;
                self.store.update_ip(mac, ip, client_id, ChangeChannel::Dhcp)?;
            }
            Some(row) => {
                if row.ip == Some(ip) && row.lease_type == lease_type {
                    self.store.renew_lease(mac, client_id, ChangeChannel::Dhcp)?;
                    if let Some(hostname) = hostname {
                        self.store
                            .update_hostname(mac, hostname, client_id, ChangeChannel::Dhcp)?;
                    }
                } else {
                    if row.ip != Some(ip) {
                        self.store.update_ip(mac, ip, client_id, ChangeChannel::Dhcp)?;
                    }
                    if let Some(hostname) = hostname {
                        self.store
                            .update_hostname(mac, hostname, client_id, ChangeChannel::Dhcp)?;
                    }
                    if row.lease_type != lease_type {
                        self.store
                            .update_lease_type(mac, lease_type, client_id, ChangeChannel::Dhcp)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn refuse(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        ip: Option<Ipv4Addr>,
        client_id: Option<&str>,
        reason: &str,
    ) -> Result<Option<Reply>> {
        if let Some(ip) = ip {
            self.store.nak_lease(mac, ip, client_id)?;
        }
        self.counters.record(DhcpMessageType::Nak);
        warn!(mac, ip = ?ip, reason, "NAK sent");
        Ok(Some(Reply::broadcast(self.build_nak(packet).to_bytes())))
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        msg_type: DhcpMessageType,
        yiaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
    ) -> DhcpPacket {
        let mut options = vec![
            message_type_option(msg_type),
            ip_option(OPT_SERVER_ID, self.cfg.server_ip),
            ip_option(OPT_SUBNET_MASK, self.cfg.subnet_mask),
            ip_option(OPT_ROUTER, self.cfg.gateway),
        ];
        if !self.cfg.dns_servers.is_empty() {
            options.push(ip_list_option(OPT_DNS_SERVER, &self.cfg.dns_servers));
        }
        options.push(u32_option(OPT_LEASE_TIME, self.cfg.lease_time));
        options.push(u32_option(OPT_RENEWAL_TIME, self.cfg.lease_time / 2));
        options.push(u32_option(OPT_REBINDING_TIME, self.cfg.lease_time * 7 / 8));
        if !self.cfg.domain_name.is_empty() {
            options.push(string_option(OPT_DOMAIN_NAME, &self.cfg.domain_name));
        }

        self.reply_frame(request, yiaddr, ciaddr, options)
    }

    /// NAK carries the message type and nothing else; no address fields.
    fn build_nak(&self, request: &DhcpPacket) -> DhcpPacket {
        self.reply_frame(
            request,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            vec![message_type_option(DhcpMessageType::Nak)],
        )
    }

    fn reply_frame(
        &self,
        request: &DhcpPacket,
        yiaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        options: Vec<crate::packet::DhcpOption>,
    ) -> DhcpPacket {
        DhcpPacket {
            op: 2, // BOOTREPLY
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: 0,
            ciaddr,
            yiaddr,
            siaddr: self.cfg.server_ip,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }
}
