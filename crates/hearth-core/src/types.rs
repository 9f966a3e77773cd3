use crate::timefmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseType {
    Dynamic,
    Static,
}

impl std::fmt::Display for LeaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseType::Dynamic => write!(f, "DYNAMIC"),
            LeaseType::Static => write!(f, "STATIC"),
        }
    }
}

/// How the lease row came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateChannel {
    DhcpRequest,
    StaticLease,
}

impl std::fmt::Display for CreateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateChannel::DhcpRequest => write!(f, "DHCP_REQUEST"),
            CreateChannel::StaticLease => write!(f, "STATIC_LEASE"),
        }
    }
}

/// Origin of a mutation, recorded on every history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeChannel {
    Web,
    Dhcp,
}

impl std::fmt::Display for ChangeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeChannel::Web => write!(f, "WEB"),
            ChangeChannel::Dhcp => write!(f, "DHCP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    ClientCreate,
    LeaseIssued,
    LeaseRenewed,
    LeaseExpired,
    LeaseReleased,
    LeaseReset,
    StaticAssigned,
    DynamicAssigned,
    HostnameUpdated,
    DeviceBlocked,
    DeviceUnblocked,
    DeviceDeleted,
    DeviceRestored,
    Decline,
    Nak,
    Inform,
    TrustChanged,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::ClientCreate => "CLIENT_CREATE",
            HistoryAction::LeaseIssued => "LEASE_ISSUED",
            HistoryAction::LeaseRenewed => "LEASE_RENEWED",
            HistoryAction::LeaseExpired => "LEASE_EXPIRED",
            HistoryAction::LeaseReleased => "LEASE_RELEASED",
            HistoryAction::LeaseReset => "LEASE_RESET",
            HistoryAction::StaticAssigned => "STATIC_ASSIGNED",
            HistoryAction::DynamicAssigned => "DYNAMIC_ASSIGNED",
            HistoryAction::HostnameUpdated => "HOSTNAME_UPDATED",
            HistoryAction::DeviceBlocked => "DEVICE_BLOCKED",
            HistoryAction::DeviceUnblocked => "DEVICE_UNBLOCKED",
            HistoryAction::DeviceDeleted => "DEVICE_DELETED",
            HistoryAction::DeviceRestored => "DEVICE_RESTORED",
            HistoryAction::Decline => "DECLINE",
            HistoryAction::Nak => "NAK",
            HistoryAction::Inform => "INFORM",
            HistoryAction::TrustChanged => "TRUST_CHANGED",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per known client, keyed by MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: u64,
    pub mac: String,
    pub hostname: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub client_id: Option<String>,
    pub lease_type: LeaseType,
    #[serde(with = "timefmt::stored_opt")]
    pub expire_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub is_blocked: bool,
    pub trust_flag: bool,
    pub is_custom_hostname: bool,
    pub create_channel: CreateChannel,
    #[serde(with = "timefmt::stored")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timefmt::stored")]
    pub updated_at: DateTime<Utc>,
    #[serde(with = "timefmt::stored_opt")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Append-only audit record. Events are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: u64,
    pub mac: String,
    pub action: HistoryAction,
    #[serde(with = "timefmt::stored")]
    pub timestamp: DateTime<Utc>,
    pub ip: Option<Ipv4Addr>,
    pub new_ip: Option<Ipv4Addr>,
    pub name: Option<String>,
    pub new_name: Option<String>,
    pub description: Option<String>,
    pub client_id: Option<String>,
    pub change_channel: ChangeChannel,
}
