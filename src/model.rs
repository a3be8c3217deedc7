use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder file path used for connections that were adopted from an
/// already-running backend rather than started from a profile file. An
/// adopted connection can never be re-established from disk.
pub const ADOPTED_CONNECTION: &str = "adopted";

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A single stored server definition. Field names follow the backend wire
/// vocabulary; unknown keys are preserved round-trip in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Transport: tcp, ws, grpc or h2.
    #[serde(default = "default_network")]
    pub network: String,
    /// "none" or "tls".
    #[serde(default = "default_tls")]
    pub tls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_insecure: bool,

    /// Forwarding directive; set on non-terminal hops of a chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialer_proxy: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_tls() -> String {
    "none".to_string()
}

impl ServerConfig {
    pub fn new(protocol: &str, address: &str, port: u16) -> Self {
        ServerConfig {
            protocol: protocol.to_string(),
            address: address.to_string(),
            port,
            network: default_network(),
            tls: default_tls(),
            ..ServerConfig::default()
        }
    }
}

/// Structured backend-config fragment stored inside a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub outbounds: Vec<ServerConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ProfileConfig {
    /// The selected outbound of a profile is its first entry.
    pub fn selected_outbound(&self) -> Option<&ServerConfig> {
        self.outbounds.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: ProfileConfig,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Proxy,
    Vpn,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        Self::Proxy
    }
}

impl ConnectionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proxy" => Some(Self::Proxy),
            "vpn" => Some(Self::Vpn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Vpn => "vpn",
        }
    }
}

/// Named pattern buckets for routing decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub direct: Vec<String>,
    #[serde(default)]
    pub proxy: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingToggles {
    pub block_udp_443: bool,
    pub block_ads: bool,
    pub direct_private_ips: bool,
    pub direct_local_domains: bool,
}

impl Default for RoutingToggles {
    fn default() -> Self {
        RoutingToggles {
            block_udp_443: false,
            block_ads: false,
            direct_private_ips: true,
            direct_local_domains: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsEntry {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

pub fn default_dns_config() -> Vec<DnsEntry> {
    vec![
        DnsEntry {
            address: "1.1.1.1".to_string(),
            protocol: "udp".to_string(),
            domains: Vec::new(),
        },
        DnsEntry {
            address: "8.8.8.8".to_string(),
            protocol: "udp".to_string(),
            domains: Vec::new(),
        },
    ]
}

/// The connection a failure was detected on, as the monitor knew it.
#[derive(Debug, Clone, Default)]
pub struct CurrentConnection {
    pub file_path: Option<PathBuf>,
    pub mode: Option<ConnectionMode>,
}

impl CurrentConnection {
    /// True when the path names a real file-backed connection rather than
    /// the synthetic adopted placeholder.
    pub fn is_file_backed(&self) -> bool {
        self.file_path
            .as_deref()
            .map(|p| p.as_os_str() != ADOPTED_CONNECTION)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    NoInternet,
    InvalidConnection,
    ConnectFailed,
}

/// Lifecycle events emitted by the reconnect service, matched exhaustively
/// by consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconnectEvent {
    FailureDetected,
    Reconnecting,
    Reconnected {
        /// True when the existing backend recovered on its own and no
        /// restart was performed.
        recovered: bool,
    },
    ReconnectFailed {
        reason: FailReason,
    },
}

/// Result of a synchronous health probe against a candidate config.
#[derive(Debug, Clone, Default)]
pub struct TestOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}
