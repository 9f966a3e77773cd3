use crate::addr;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub interface: Option<String>,
    pub server_ip: String,
    pub pool_start: String,
    pub pool_end: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
    #[serde(default = "default_lease_time")]
    pub lease_time: u64,
    pub domain_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default = "default_expire_check_period")]
    pub expire_check_period: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            expire_check_period: default_expire_check_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_history_limit")]
    pub web_lease_history_limit: usize,
    #[serde(default = "default_api_cache_ttl")]
    pub api_cache_ttl: u64,
    #[serde(default)]
    pub api_token: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            web_host: default_web_host(),
            web_port: default_web_port(),
            web_lease_history_limit: default_history_limit(),
            api_cache_ttl: default_api_cache_ttl(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
    #[serde(default = "default_auth_db_file")]
    pub auth_db_file: PathBuf,
    #[serde(default = "default_history_db_file")]
    pub history_db_file: PathBuf,
    /// 0 disables history pruning.
    #[serde(default)]
    pub history_cleanup_days: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            auth_db_file: default_auth_db_file(),
            history_db_file: default_history_db_file(),
            history_cleanup_days: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Human duration string, e.g. "45m", "12h", "7d", "1y".
    #[serde(default = "default_inactive_period")]
    pub inactive_period: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retries: default_retries(),
            retry_interval: default_retry_interval(),
            inactive_period: default_inactive_period(),
        }
    }
}

impl NotificationConfig {
    /// Parse `inactive_period`, falling back to 7 days on bad input.
    pub fn inactive_period_duration(&self) -> chrono::Duration {
        match duration_str::parse(&self.inactive_period) {
            Ok(d) => chrono::Duration::from_std(d)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
            Err(_) => {
                tracing::warn!(
                    value = %self.inactive_period,
                    "bad inactive_period, falling back to 7d"
                );
                chrono::Duration::days(7)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            measurement: default_measurement(),
            metrics_interval: default_metrics_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_lease_time() -> u64 {
    3600
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_expire_check_period() -> u64 {
    60
}
fn default_web_host() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    8080
}
fn default_history_limit() -> usize {
    10
}
fn default_api_cache_ttl() -> u64 {
    10
}
fn default_db_file() -> PathBuf {
    PathBuf::from("data/hearth-leases.redb")
}
fn default_auth_db_file() -> PathBuf {
    PathBuf::from("data/hearth-auth.redb")
}
fn default_history_db_file() -> PathBuf {
    PathBuf::from("data/hearth-history.redb")
}
fn default_retries() -> u32 {
    3
}
fn default_retry_interval() -> u64 {
    5
}
fn default_inactive_period() -> String {
    "7d".to_string()
}
fn default_measurement() -> String {
    "dhcp".to_string()
}
fn default_metrics_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Sanity-check the network section before anything binds a socket.
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        let server_ip = addr::parse_ipv4(&net.server_ip)?;
        let mask = addr::parse_ipv4(&net.subnet_mask)?;
        let gateway = addr::parse_ipv4(&net.gateway)?;
        let pool_start = addr::parse_ipv4(&net.pool_start)?;
        let pool_end = addr::parse_ipv4(&net.pool_end)?;
        for dns in &net.dns_servers {
            addr::parse_ipv4(dns)?;
        }

        let mask_int = addr::ipv4_to_u32(mask);
        if mask_int == 0 || mask_int == u32::MAX {
            return Err(Error::Config(format!("implausible subnet_mask {mask}")));
        }
        addr::PoolRange::new(pool_start, pool_end)?;

        for (name, ip) in [
            ("gateway", gateway),
            ("pool_start", pool_start),
            ("pool_end", pool_end),
        ] {
            if !addr::in_subnet(ip, server_ip, mask) {
                return Err(Error::Config(format!(
                    "{name} {ip} is outside the server subnet"
                )));
            }
        }
        Ok(())
    }
}
