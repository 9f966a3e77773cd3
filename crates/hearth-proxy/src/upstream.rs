use crate::config::UpstreamConfig;
use hearth_core::error::{Error, Result};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// Mask of the /24 network inferred for every upstream.
const SUBNET_MASK: u32 = 0xffff_ff00;

/// One fronted node: its API endpoint plus the network it answers for.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub addr: String,
    token: String,
    network: u32,
}

impl Upstream {
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self> {
        let host = cfg
            .addr
            .split(':')
            .next()
            .ok_or_else(|| Error::InvalidAddress(cfg.addr.clone()))?;
        let host_ip: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::InvalidAddress(cfg.addr.clone()))?;

        Ok(Self {
            name: cfg.name.clone(),
            addr: cfg.addr.clone(),
            token: cfg.token.clone(),
            network: u32::from(host_ip) & SUBNET_MASK,
        })
    }

    /// Whether this node's inferred subnet contains the address.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & SUBNET_MASK == self.network
    }

    pub fn client_url(&self, ip: Ipv4Addr) -> String {
        format!("http://{}/api/client/{}?token={}", self.addr, ip, self.token)
    }

    pub fn clients_url(&self) -> String {
        format!("http://{}/api/clients?token={}", self.addr, self.token)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }
}

/// The one upstream responsible for an address, if any.
pub fn route_for(upstreams: &[Upstream], ip: Ipv4Addr) -> Option<&Upstream> {
    upstreams.iter().find(|u| u.contains(ip))
}

/// GET a JSON document from an upstream. Timeouts and transport failures
/// map onto the two upstream error kinds; any HTTP status with a JSON
/// body passes through.
pub async fn fetch_json(
    client: &reqwest::Client,
    url: &str,
    upstream: &str,
    timeout: Duration,
) -> Result<(u16, Value)> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, upstream))?;

    let status = response.status().as_u16();
    let value = response
        .json::<Value>()
        .await
        .map_err(|e| classify(e, upstream))?;

    debug!(upstream, status, "upstream answered");
    Ok((status, value))
}

fn classify(e: reqwest::Error, upstream: &str) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(upstream.to_string())
    } else {
        Error::UpstreamUnavailable(format!("{upstream}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(name: &str, addr: &str) -> Upstream {
        Upstream::from_config(&UpstreamConfig {
            name: name.to_string(),
            addr: addr.to_string(),
            token: "tok".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_subnet_inference() {
        let a = upstream("a", "192.168.1.10:8080");
        assert!(a.contains("192.168.1.77".parse().unwrap()));
        assert!(a.contains("192.168.1.1".parse().unwrap()));
        assert!(!a.contains("192.168.2.77".parse().unwrap()));
        assert!(!a.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_routing_picks_single_owner() {
        // Per-IP requests go to exactly the covering node
        let nodes = vec![
            upstream("a", "192.168.1.10:8080"),
            upstream("b", "192.168.2.10:8080"),
        ];

        let hit = route_for(&nodes, "192.168.1.77".parse().unwrap()).unwrap();
        assert_eq!(hit.name, "a");
        let hit = route_for(&nodes, "192.168.2.5".parse().unwrap()).unwrap();
        assert_eq!(hit.name, "b");
        assert!(route_for(&nodes, "10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_rejects_bad_addr() {
        assert!(Upstream::from_config(&UpstreamConfig {
            name: "bad".to_string(),
            addr: "not-an-ip:8080".to_string(),
            token: String::new(),
        })
        .is_err());
    }

    #[test]
    fn test_urls_carry_token() {
        let a = upstream("a", "192.168.1.10:8080");
        assert_eq!(
            a.client_url("192.168.1.77".parse().unwrap()),
            "http://192.168.1.10:8080/api/client/192.168.1.77?token=tok"
        );
        assert_eq!(
            a.clients_url(),
            "http://192.168.1.10:8080/api/clients?token=tok"
        );
        assert_eq!(a.health_url(), "http://192.168.1.10:8080/health");
    }
}
