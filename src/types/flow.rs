//! Flow event types
//!
//! Unified record format for parsed flow events entering the engine. One
//! record is the common envelope (profile, time window, uid, timestamp) plus
//! a channel-specific payload.

use serde::{Deserialize, Serialize};

/// One parsed flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Analysis profile of the monitored host, format `profile_<ip>`
    pub profile_id: String,
    /// Time window the flow belongs to; empty when unknown, never null
    #[serde(default)]
    pub twid: String,
    /// Flow-unique id
    pub uid: String,
    /// Epoch seconds
    pub timestamp: f64,
    /// Channel-specific payload
    #[serde(flatten)]
    pub event: FlowEvent,
}

impl FlowRecord {
    /// Parse one JSON-lines record.
    pub fn from_json(line: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// The IP this profile analyzes (the part after `profile_`).
    pub fn profile_ip(&self) -> &str {
        self.profile_id
            .strip_prefix("profile_")
            .unwrap_or(&self.profile_id)
    }
}

/// Channel-specific payload of a flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum FlowEvent {
    Conn(ConnFlow),
    Dns(DnsFlow),
    Ssh(SshFlow),
    Ssl(SslFlow),
    Notice(NoticeFlow),
    Service(ServiceFlow),
}

impl FlowEvent {
    /// Channel name this payload arrived on.
    pub fn channel(&self) -> &'static str {
        match self {
            FlowEvent::Conn(_) => "conn",
            FlowEvent::Dns(_) => "dns",
            FlowEvent::Ssh(_) => "ssh",
            FlowEvent::Ssl(_) => "ssl",
            FlowEvent::Notice(_) => "notice",
            FlowEvent::Service(_) => "service",
        }
    }
}

/// Connection summary flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnFlow {
    /// Source address
    pub saddr: String,
    /// Destination address
    pub daddr: String,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: Option<u16>,
    /// Transport protocol name (tcp, udp, icmp, ...)
    #[serde(default)]
    pub proto: String,
    /// Connection duration in seconds
    #[serde(default)]
    pub dur: f64,
    /// Bytes sent by the source
    #[serde(default)]
    pub sbytes: u64,
    /// Total bytes in both directions
    #[serde(default)]
    pub allbytes: u64,
    /// Connection state (e.g. Established, NotEstablished)
    #[serde(default)]
    pub state: String,
    /// Originator state as reported by the parser (e.g. REJ)
    #[serde(default)]
    pub origstate: String,
    /// Application protocol hint, empty or "-" when unknown
    #[serde(default)]
    pub appproto: String,
    /// Flow start time, epoch seconds. Used by history scans.
    #[serde(default)]
    pub ts: f64,
}

impl ConnFlow {
    /// Application protocol, normalized: lowercase, "-" treated as unknown.
    pub fn app_protocol(&self) -> String {
        if self.appproto == "-" {
            String::new()
        } else {
            self.appproto.to_lowercase()
        }
    }
}

/// DNS answer set for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsFlow {
    /// Queried domain
    pub query: String,
    /// Answer IPs; may be empty for unanswered queries
    #[serde(default)]
    pub answers: Vec<String>,
}

/// SSH session metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshFlow {
    /// Parser asserted a successful authentication
    #[serde(default)]
    pub auth_success: bool,
}

/// TLS session metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslFlow {
    pub daddr: String,
    /// SNI, empty when absent
    #[serde(default)]
    pub server_name: String,
    /// Certificate validation outcome as reported by the parser
    #[serde(default)]
    pub validation_status: String,
    /// JA3 client fingerprint
    #[serde(default)]
    pub ja3: String,
    /// JA3S server fingerprint
    #[serde(default)]
    pub ja3s: String,
}

/// Upstream analyzer notice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoticeFlow {
    /// Free-form notice message
    #[serde(default)]
    pub msg: String,
    /// Notice category tag
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub daddr: String,
    /// Scanner address for scan notices
    #[serde(default)]
    pub scanning_ip: String,
    /// Scanned port for address-scan notices
    #[serde(default)]
    pub scanned_port: String,
}

/// Service observed on a port by the upstream parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceFlow {
    pub port_num: u16,
    pub port_proto: String,
    /// Service names, most specific first
    #[serde(default)]
    pub service: Vec<String>,
}
