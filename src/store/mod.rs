//! Flow context store interface
//!
//! The flow history, DNS cache and knowledge bases are owned by an external
//! collaborator; detectors only see this trait. A miss is `None` or an empty
//! collection, never an error - detectors degrade to "no information".

pub mod memory;

pub use memory::MemoryStore;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ConnFlow;

/// Whether the profile under analysis was the client or the server of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowRole {
    Client,
    Server,
}

/// Threat-intel entry for a JA3/JA3S fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ja3Intel {
    pub description: String,
    pub tags: String,
    pub threat_level: f64,
}

/// Read/write interface to flow history, DNS resolutions, and the port and
/// fingerprint knowledge bases.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Cached resolution for an IP, if any
    async fn get_dns_resolution(&self, ip: &str) -> Option<String>;

    /// All IPs a domain has resolved to so far
    async fn get_domain_ips(&self, domain: &str) -> Vec<String>;

    /// IPs contacted by the profile within a time window
    async fn get_all_contacted_ips(&self, profile_id: &str, twid: &str) -> HashSet<String>;

    /// Full flow history of a profile
    async fn get_all_flows(&self, profile_id: &str) -> Vec<ConnFlow>;

    /// One flow by uid
    async fn get_flow(&self, profile_id: &str, twid: &str, uid: &str) -> Option<ConnFlow>;

    /// Service name for a `port/proto` pair
    async fn get_port_info(&self, portproto: &str) -> Option<String>;

    /// Register a service name for a `port/proto` pair
    async fn set_port_info(&self, portproto: &str, service: &str);

    /// Distinct destination ports seen between the profile and `peer` within
    /// a time window, from the given role's perspective
    async fn get_contacted_ports(
        &self,
        profile_id: &str,
        twid: &str,
        role: FlowRole,
        peer: &str,
    ) -> Vec<u16>;

    /// Rejected-connection counters for a time window
    async fn get_reconnections(&self, profile_id: &str, twid: &str) -> HashMap<String, u32>;

    /// Persist rejected-connection counters for a time window
    async fn set_reconnections(&self, profile_id: &str, twid: &str, map: HashMap<String, u32>);

    /// Reverse-DNS/SNI context used in evidence descriptions; empty when
    /// nothing is known
    async fn get_ip_identification(&self, ip: &str) -> String;

    /// Malicious JA3/JA3S fingerprint map
    async fn get_ja3_intel(&self) -> HashMap<String, Ja3Intel>;

    /// Whether a port is a known FTP data port
    async fn is_ftp_port(&self, port: u16) -> bool;

    /// Default gateway of the monitored network, if known
    async fn get_default_gateway(&self) -> Option<String>;

    /// Epoch seconds the capture process started
    async fn get_process_start_time(&self) -> f64;

    /// Label a flow on behalf of a detector, for downstream consumers
    async fn set_flow_label(&self, profile_id: &str, twid: &str, uid: &str, detector: &str, label: &str);
}
