use hearth_core::config::LoggingConfig;
use hearth_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Token guarding the proxy's own /api endpoints.
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub duplicate_mac_policy: MergePolicy,
    #[serde(default = "default_dhcp_timeout")]
    pub dhcp_timeout_seconds: u64,
    #[serde(default = "default_proxy_cache_ttl")]
    pub proxy_cache_ttl: u64,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    /// host:port of the node's read API; the node's /24 subnet is
    /// inferred from the host address.
    pub addr: String,
    /// Token for the upstream node's API.
    #[serde(default)]
    pub token: String,
}

/// What to do when several nodes report the same MAC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    KeepAll,
    #[default]
    Merge,
    PreferIp,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::KeepAll => write!(f, "keep_all"),
            MergePolicy::Merge => write!(f, "merge"),
            MergePolicy::PreferIp => write!(f, "prefer_ip"),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8090".to_string()
}
fn default_dhcp_timeout() -> u64 {
    5
}
fn default_proxy_cache_ttl() -> u64 {
    10
}

impl ProxyConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: ProxyConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        if config.upstreams.is_empty() {
            return Err(Error::Config("at least one upstream is required".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
listen = "0.0.0.0:9000"
api_token = "proxy-token"
duplicate_mac_policy = "prefer_ip"
dhcp_timeout_seconds = 3
proxy_cache_ttl = 15

[[upstreams]]
name = "vlan1"
addr = "192.168.1.10:8080"
token = "node1-token"

[[upstreams]]
name = "vlan2"
addr = "192.168.2.10:8080"
token = "node2-token"
"#;
        let config: ProxyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.duplicate_mac_policy, MergePolicy::PreferIp);
        assert_eq!(config.dhcp_timeout_seconds, 3);
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams[0].name, "vlan1");
    }

    #[test]
    fn test_defaults() {
        let toml_str = r#"
[[upstreams]]
name = "only"
addr = "10.0.0.1:8080"
"#;
        let config: ProxyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.duplicate_mac_policy, MergePolicy::Merge);
        assert_eq!(config.dhcp_timeout_seconds, 5);
        assert_eq!(config.proxy_cache_ttl, 10);
    }

    #[test]
    fn test_policy_wire_names() {
        assert_eq!(MergePolicy::KeepAll.to_string(), "keep_all");
        let parsed: MergePolicy = serde_json::from_str("\"keep_all\"").unwrap();
        assert_eq!(parsed, MergePolicy::KeepAll);
    }
}
