//! In-memory context store
//!
//! Backs the CLI driver and the test suite. Mirrors what the upstream
//! profiler stage would write: [`MemoryStore::record`] ingests each incoming
//! flow record so the detectors' history lookups see it.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::types::{ConnFlow, FlowEvent, FlowRecord};

use super::{ContextStore, FlowRole, Ja3Intel};

type ProfileTw = (String, String);
type FlowKey = (String, String, String);

/// HashMap-backed store guarded by per-table locks.
#[derive(Default)]
pub struct MemoryStore {
    /// ip -> resolved name
    dns: RwLock<HashMap<String, String>>,
    /// domain -> resolved ips
    domains: RwLock<HashMap<String, Vec<String>>>,
    contacted: RwLock<HashMap<ProfileTw, HashSet<String>>>,
    flows: RwLock<HashMap<String, Vec<ConnFlow>>>,
    flows_by_uid: RwLock<HashMap<FlowKey, ConnFlow>>,
    ports: RwLock<HashMap<String, String>>,
    contacted_ports: RwLock<HashMap<(String, String, FlowRole, String), HashSet<u16>>>,
    reconnections: RwLock<HashMap<ProfileTw, HashMap<String, u32>>>,
    ip_identifications: RwLock<HashMap<String, String>>,
    ja3_intel: RwLock<HashMap<String, Ja3Intel>>,
    ftp_ports: RwLock<HashSet<u16>>,
    gateway: RwLock<Option<String>>,
    start_time: RwLock<f64>,
    labels: RwLock<HashMap<FlowKey, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one incoming record the way the upstream profiler would:
    /// connection flows land in the history, contacted-IP and port sets;
    /// DNS answers land in the resolution caches.
    pub fn record(&self, rec: &FlowRecord) {
        match &rec.event {
            FlowEvent::Conn(flow) => {
                let mut flow = flow.clone();
                if flow.ts == 0.0 {
                    flow.ts = rec.timestamp;
                }

                self.flows
                    .write()
                    .entry(rec.profile_id.clone())
                    .or_default()
                    .push(flow.clone());
                self.flows_by_uid.write().insert(
                    (rec.profile_id.clone(), rec.twid.clone(), rec.uid.clone()),
                    flow.clone(),
                );
                self.contacted
                    .write()
                    .entry((rec.profile_id.clone(), rec.twid.clone()))
                    .or_default()
                    .insert(flow.daddr.clone());

                if let Some(dport) = flow.dport {
                    let profile_ip = rec.profile_ip();
                    let (role, peer) = if profile_ip == flow.saddr {
                        (FlowRole::Client, flow.daddr.clone())
                    } else {
                        (FlowRole::Server, flow.saddr.clone())
                    };
                    self.contacted_ports
                        .write()
                        .entry((rec.profile_id.clone(), rec.twid.clone(), role, peer))
                        .or_default()
                        .insert(dport);
                }
            }
            FlowEvent::Dns(dns) => {
                let mut domains = self.domains.write();
                let ips = domains.entry(dns.query.clone()).or_default();
                let mut resolutions = self.dns.write();
                for answer in &dns.answers {
                    if answer.is_empty() {
                        continue;
                    }
                    if !ips.contains(answer) {
                        ips.push(answer.clone());
                    }
                    resolutions.insert(answer.clone(), dns.query.clone());
                }
            }
            _ => {}
        }
    }

    pub fn add_dns_resolution(&self, ip: &str, name: &str) {
        self.dns.write().insert(ip.to_string(), name.to_string());
    }

    pub fn add_domain_ip(&self, domain: &str, ip: &str) {
        self.domains
            .write()
            .entry(domain.to_string())
            .or_default()
            .push(ip.to_string());
    }

    pub fn add_contacted_ip(&self, profile_id: &str, twid: &str, ip: &str) {
        self.contacted
            .write()
            .entry((profile_id.to_string(), twid.to_string()))
            .or_default()
            .insert(ip.to_string());
    }

    pub fn add_flow(&self, profile_id: &str, twid: &str, uid: &str, flow: ConnFlow) {
        self.flows
            .write()
            .entry(profile_id.to_string())
            .or_default()
            .push(flow.clone());
        self.flows_by_uid.write().insert(
            (profile_id.to_string(), twid.to_string(), uid.to_string()),
            flow,
        );
    }

    pub fn add_contacted_port(
        &self,
        profile_id: &str,
        twid: &str,
        role: FlowRole,
        peer: &str,
        port: u16,
    ) {
        self.contacted_ports
            .write()
            .entry((
                profile_id.to_string(),
                twid.to_string(),
                role,
                peer.to_string(),
            ))
            .or_default()
            .insert(port);
    }

    pub fn add_ip_identification(&self, ip: &str, identification: &str) {
        self.ip_identifications
            .write()
            .insert(ip.to_string(), identification.to_string());
    }

    pub fn add_ja3_intel(&self, fingerprint: &str, intel: Ja3Intel) {
        self.ja3_intel
            .write()
            .insert(fingerprint.to_string(), intel);
    }

    pub fn add_ftp_port(&self, port: u16) {
        self.ftp_ports.write().insert(port);
    }

    pub fn set_gateway(&self, ip: &str) {
        *self.gateway.write() = Some(ip.to_string());
    }

    pub fn set_start_time(&self, epoch_secs: f64) {
        *self.start_time.write() = epoch_secs;
    }

    /// Label a detector wrote for a flow, for test inspection.
    pub fn get_flow_label(
        &self,
        profile_id: &str,
        twid: &str,
        uid: &str,
        detector: &str,
    ) -> Option<String> {
        self.labels
            .read()
            .get(&(
                profile_id.to_string(),
                twid.to_string(),
                uid.to_string(),
            ))
            .and_then(|m| m.get(detector).cloned())
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn get_dns_resolution(&self, ip: &str) -> Option<String> {
        self.dns.read().get(ip).cloned()
    }

    async fn get_domain_ips(&self, domain: &str) -> Vec<String> {
        self.domains.read().get(domain).cloned().unwrap_or_default()
    }

    async fn get_all_contacted_ips(&self, profile_id: &str, twid: &str) -> HashSet<String> {
        self.contacted
            .read()
            .get(&(profile_id.to_string(), twid.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn get_all_flows(&self, profile_id: &str) -> Vec<ConnFlow> {
        self.flows.read().get(profile_id).cloned().unwrap_or_default()
    }

    async fn get_flow(&self, profile_id: &str, twid: &str, uid: &str) -> Option<ConnFlow> {
        self.flows_by_uid
            .read()
            .get(&(
                profile_id.to_string(),
                twid.to_string(),
                uid.to_string(),
            ))
            .cloned()
    }

    async fn get_port_info(&self, portproto: &str) -> Option<String> {
        self.ports.read().get(portproto).cloned()
    }

    async fn set_port_info(&self, portproto: &str, service: &str) {
        debug!(%portproto, %service, "registering port info");
        self.ports
            .write()
            .insert(portproto.to_string(), service.to_string());
    }

    async fn get_contacted_ports(
        &self,
        profile_id: &str,
        twid: &str,
        role: FlowRole,
        peer: &str,
    ) -> Vec<u16> {
        self.contacted_ports
            .read()
            .get(&(
                profile_id.to_string(),
                twid.to_string(),
                role,
                peer.to_string(),
            ))
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn get_reconnections(&self, profile_id: &str, twid: &str) -> HashMap<String, u32> {
        self.reconnections
            .read()
            .get(&(profile_id.to_string(), twid.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn set_reconnections(&self, profile_id: &str, twid: &str, map: HashMap<String, u32>) {
        self.reconnections
            .write()
            .insert((profile_id.to_string(), twid.to_string()), map);
    }

    async fn get_ip_identification(&self, ip: &str) -> String {
        self.ip_identifications
            .read()
            .get(ip)
            .cloned()
            .unwrap_or_default()
    }

    async fn get_ja3_intel(&self) -> HashMap<String, Ja3Intel> {
        self.ja3_intel.read().clone()
    }

    async fn is_ftp_port(&self, port: u16) -> bool {
        self.ftp_ports.read().contains(&port)
    }

    async fn get_default_gateway(&self) -> Option<String> {
        self.gateway.read().clone()
    }

    async fn get_process_start_time(&self) -> f64 {
        *self.start_time.read()
    }

    async fn set_flow_label(
        &self,
        profile_id: &str,
        twid: &str,
        uid: &str,
        detector: &str,
        label: &str,
    ) {
        self.labels
            .write()
            .entry((
                profile_id.to_string(),
                twid.to_string(),
                uid.to_string(),
            ))
            .or_default()
            .insert(detector.to_string(), label.to_string());
    }
}
