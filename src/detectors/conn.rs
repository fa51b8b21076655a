//! Connection-channel checks
//!
//! Every conn-type flow runs through all of these: long connection, unknown
//! destination port (with the P2P suppression heuristic), reconnection
//! counting, port-0 scanning, connection-without-DNS (deferred), connection
//! to multiple ports, and the data-exfiltration history scan.

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::scheduler::TaskKey;
use crate::types::{ConnFlow, DetectionTarget, Evidence, EvidenceKind, FlowRecord};

use super::{FlowAlerts, LABEL_MALICIOUS, LABEL_NORMAL};

const CONN_WITHOUT_DNS: &str = "conn-without-dns";
const LONG_CONNECTION_DETECTOR: &str = "long-connection";

/// High-port UDP peer-to-peer heuristic state.
///
/// Tracks how often each destination was contacted on >30000/udp. A
/// destination reaching six contacts classifies, and once five distinct
/// destinations have been seen any further matching flow classifies. The
/// count is updated before the per-destination test, so the sixth contact
/// itself classifies; a first sight only records the destination.
#[derive(Debug, Default)]
pub(super) struct P2pTracker {
    daddrs: HashMap<String, u32>,
}

impl P2pTracker {
    pub(super) fn classify(&mut self, dport: u16, proto: &str, daddr: &str) -> bool {
        if !proto.eq_ignore_ascii_case("udp") || dport <= 30_000 {
            return false;
        }
        match self.daddrs.get_mut(daddr) {
            Some(count) => {
                *count += 1;
                if *count >= 6 {
                    return true;
                }
            }
            None => {
                self.daddrs.insert(daddr.to_string(), 1);
            }
        }
        self.daddrs.len() >= 5
    }
}

/// Addresses never checked for missing DNS: multicast, private, loopback,
/// link-local, unspecified, reserved and broadcast ranges. An unparseable
/// address is also ignored rather than alerted on.
pub(crate) fn is_ignored_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return true;
    };
    match addr {
        IpAddr::V4(v4) => {
            v4.is_multicast()
                || v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] >= 240
                // subnet broadcast convention
                || v4.octets()[3] == 255
        }
        IpAddr::V6(v6) => {
            v6.is_multicast()
                || v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

impl FlowAlerts {
    /// Run every connection-channel check against one flow record. Checks
    /// are isolated from each other: one failing evaluation is logged and
    /// the rest still run.
    pub async fn handle_conn(&self, rec: &FlowRecord, flow: &ConnFlow) {
        if let Err(e) = self.check_long_connection(rec, flow).await {
            self.note_failure("long-connection", &e);
        }
        if let Err(e) = self.check_unknown_port(rec, flow).await {
            self.note_failure("unknown-port", &e);
        }
        if let Err(e) = self.check_reconnections(rec, flow).await {
            self.note_failure("reconnections", &e);
        }
        if let Err(e) = self.check_port0(rec, flow).await {
            self.note_failure("port0-scanning", &e);
        }
        if flow.app_protocol() != "dns" && !is_ignored_ip(&flow.daddr) {
            if let Err(e) = self.check_connection_without_dns(rec, flow).await {
                self.note_failure("conn-without-dns", &e);
            }
        }
        if let Err(e) = self.check_multiple_ports(rec, flow).await {
            self.note_failure("multiple-ports", &e);
        }
        if let Err(e) = self.check_data_exfiltration(rec).await {
            self.note_failure("data-exfiltration", &e);
        }
    }

    /// Alert when a non-multicast flow lasted longer than the configured
    /// threshold. The flow is labeled either way for downstream consumers.
    async fn check_long_connection(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        let saddr: IpAddr = flow
            .saddr
            .parse()
            .map_err(|_| anyhow!("unparseable source address {:?}", flow.saddr))?;
        let daddr: IpAddr = flow
            .daddr
            .parse()
            .map_err(|_| anyhow!("unparseable destination address {:?}", flow.daddr))?;
        if saddr.is_multicast() || daddr.is_multicast() {
            return Ok(());
        }

        let is_long = flow.dur > self.config.long_connection_threshold;
        let label = if is_long { LABEL_MALICIOUS } else { LABEL_NORMAL };
        self.store
            .set_flow_label(&rec.profile_id, &rec.twid, &rec.uid, LONG_CONNECTION_DETECTOR, label)
            .await;

        if is_long {
            // scale confidence linearly, reaching 1.0 at a 24h connection
            let confidence = (flow.dur / 86_400.0).min(1.0);
            let ident = self.store.get_ip_identification(&flow.daddr).await;
            let evidence = Evidence::new(
                EvidenceKind::LongConnection,
                DetectionTarget::DstIp,
                &flow.daddr,
                0.5,
                confidence,
            )
            .describe(format!(
                "Long connection to {} lasting {:.0} seconds. {}",
                flow.daddr, flow.dur, ident
            ))
            .from_record(rec);
            self.emit(evidence).await;
        }
        Ok(())
    }

    /// Alert on destination ports absent from the known-ports knowledge
    /// base, unless the flow looks like ICMP, P2P, or FTP data traffic.
    async fn check_unknown_port(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        let dport = match flow.dport {
            Some(p) if p != 0 => p,
            _ => return Ok(()),
        };
        let proto = flow.proto.to_lowercase();
        if proto.contains("icmp") {
            return Ok(());
        }
        if self
            .store
            .get_port_info(&format!("{dport}/{proto}"))
            .await
            .is_some()
        {
            return Ok(());
        }
        if self.p2p.lock().classify(dport, &proto, &flow.daddr) {
            return Ok(());
        }
        if self.store.is_ftp_port(dport).await {
            return Ok(());
        }

        let ident = self.store.get_ip_identification(&flow.daddr).await;
        let mut description = format!(
            "Connection to unknown destination port {dport}/{} destination IP {}. {ident}",
            proto.to_uppercase(),
            flow.daddr
        );
        if let Some(resolved) = self.store.get_dns_resolution(&flow.daddr).await {
            description.push_str(&format!(" ({resolved})"));
        }

        let evidence = Evidence::new(
            EvidenceKind::UnknownPort,
            DetectionTarget::Dport,
            dport.to_string(),
            0.6,
            1.0,
        )
        .describe(description)
        .from_record(rec);
        self.emit(evidence).await;
        Ok(())
    }

    /// Count rejected connections per (src, dst, dport) in the time window
    /// and alert once any counter reaches five; every further rejection past
    /// the threshold refires.
    async fn check_reconnections(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        let dport = match flow.dport {
            Some(p) if p != 0 => p,
            _ => return Ok(()),
        };
        if flow.origstate != "REJ" {
            return Ok(());
        }

        let key = format!("{}->{}:{}", flow.saddr, flow.daddr, dport);
        let mut reconnections = self
            .store
            .get_reconnections(&rec.profile_id, &rec.twid)
            .await;
        *reconnections.entry(key).or_insert(0) += 1;
        self.store
            .set_reconnections(&rec.profile_id, &rec.twid, reconnections.clone())
            .await;

        for (key, count) in &reconnections {
            if *count < 5 {
                continue;
            }
            let Some((pair, _)) = key.rsplit_once(':') else {
                continue;
            };
            let Some((saddr, daddr)) = pair.split_once("->") else {
                continue;
            };
            let evidence = Evidence::new(
                EvidenceKind::MultipleReconnectionAttempts,
                DetectionTarget::DstIp,
                daddr,
                20.0,
                0.5,
            )
            .describe(format!(
                "Multiple reconnection attempts ({count}) to destination IP {daddr} from IP {saddr}"
            ))
            .from_record(rec);
            self.emit(evidence).await;
        }
        Ok(())
    }

    /// Flag any non-ICMP/IGMP flow using port 0 on either side.
    async fn check_port0(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        let proto = flow.proto.to_lowercase();
        if proto == "igmp" || proto.contains("icmp") {
            return Ok(());
        }
        let source_zero = flow.sport == 0;
        let dest_zero = flow.dport == Some(0);
        if !source_zero && !dest_zero {
            return Ok(());
        }

        let evidence = if source_zero {
            let ident = self.store.get_ip_identification(&flow.daddr).await;
            Evidence::new(
                EvidenceKind::Port0Scanning,
                DetectionTarget::SrcIp,
                &flow.saddr,
                0.5,
                0.8,
            )
            .describe(format!(
                "Port 0 scanning: {} is scanning {}. {}",
                flow.saddr, flow.daddr, ident
            ))
        } else {
            let ident = self.store.get_ip_identification(&flow.saddr).await;
            Evidence::new(
                EvidenceKind::Port0Scanning,
                DetectionTarget::DstIp,
                &flow.daddr,
                0.5,
                0.8,
            )
            .describe(format!(
                "Port 0 scanning: {} is scanning {}. {}",
                flow.daddr, flow.saddr, ident
            ))
        };
        self.emit(evidence.from_record(rec)).await;
        Ok(())
    }

    /// First pass of the connection-without-DNS check: if the destination
    /// has no cached resolution, mark the uid pending and give the answer
    /// one re-check delay to arrive. The decision happens in
    /// [`Self::recheck_connection_without_dns`].
    async fn check_connection_without_dns(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        if self.config.live_capture {
            // resolutions may predate a live capture; stay quiet until the
            // warm-up has passed
            let start = self.store.get_process_start_time().await;
            let elapsed = Utc::now().timestamp() as f64 - start;
            if elapsed < self.config.conn_without_dns_warmup_secs as f64 {
                return Ok(());
            }
        }

        if self
            .store
            .get_dns_resolution(&flow.daddr)
            .await
            .is_some()
        {
            self.pending_conn_without_dns.clear(&rec.uid);
            return Ok(());
        }

        if self.pending_conn_without_dns.mark(&rec.uid) {
            let Some(me) = self.weak.upgrade() else {
                self.pending_conn_without_dns.clear(&rec.uid);
                return Ok(());
            };
            let daddr = flow.daddr.clone();
            let profile_id = rec.profile_id.clone();
            let twid = rec.twid.clone();
            let uid = rec.uid.clone();
            let timestamp = rec.timestamp;
            self.scheduler.schedule(
                TaskKey::new(CONN_WITHOUT_DNS, &rec.uid),
                self.recheck_delay(),
                Box::pin(async move {
                    me.recheck_connection_without_dns(&daddr, &profile_id, &twid, &uid, timestamp)
                        .await;
                }),
            );
        }
        Ok(())
    }

    /// Re-check pass: the defer window has elapsed. Alert exactly once if
    /// the destination is still unresolved, then resolve the pending key.
    async fn recheck_connection_without_dns(
        &self,
        daddr: &str,
        profile_id: &str,
        twid: &str,
        uid: &str,
        timestamp: f64,
    ) {
        if !self.pending_conn_without_dns.contains(uid) {
            return;
        }
        if self.store.get_dns_resolution(daddr).await.is_some() {
            self.pending_conn_without_dns.clear(uid);
            return;
        }

        let ident = self.store.get_ip_identification(daddr).await;
        let evidence = Evidence::new(
            EvidenceKind::ConnectionWithoutDns,
            DetectionTarget::DstIp,
            daddr,
            0.9,
            0.8,
        )
        .describe(format!(
            "Connection without DNS resolution to IP {daddr}. {ident}"
        ))
        .tagged(profile_id, twid, uid, timestamp);
        self.emit(evidence).await;
        self.pending_conn_without_dns.clear(uid);
    }

    /// Alert when an established TCP flow with no identifiable service
    /// reached more than one distinct port on the relevant peer within the
    /// time window.
    async fn check_multiple_ports(&self, rec: &FlowRecord, flow: &ConnFlow) -> Result<()> {
        if !flow.proto.eq_ignore_ascii_case("tcp") || flow.state != "Established" {
            return Ok(());
        }

        let mut service = flow.app_protocol();
        if service.is_empty() {
            if let Some(dport) = flow.dport {
                if let Some(name) = self
                    .store
                    .get_port_info(&format!("{dport}/{}", flow.proto.to_lowercase()))
                    .await
                {
                    service = name;
                }
            }
        }
        if !service.is_empty() {
            return Ok(());
        }

        let profile_ip = rec.profile_ip();
        let (role, peer) = if profile_ip == flow.saddr {
            (crate::store::FlowRole::Client, flow.daddr.as_str())
        } else if profile_ip == flow.daddr {
            (crate::store::FlowRole::Server, flow.saddr.as_str())
        } else {
            return Ok(());
        };

        let mut ports = self
            .store
            .get_contacted_ports(&rec.profile_id, &rec.twid, role, peer)
            .await;
        if ports.len() <= 1 {
            return Ok(());
        }
        ports.sort_unstable();

        let evidence = Evidence::new(
            EvidenceKind::ConnectionToMultiplePorts,
            DetectionTarget::DstIp,
            &flow.daddr,
            20.0,
            0.5,
        )
        .describe(format!(
            "Connection to multiple ports {ports:?} of IP {peer}"
        ))
        .from_record(rec);
        self.emit(evidence).await;
        Ok(())
    }

    /// Scan the profile's full flow history: once it spans at least twenty
    /// minutes, alert if the most-contacted non-gateway destination received
    /// more than the configured byte volume. The history is rescanned on
    /// every qualifying event; the context store is the system of record.
    async fn check_data_exfiltration(&self, rec: &FlowRecord) -> Result<()> {
        let mut flows = self.store.get_all_flows(&rec.profile_id).await;
        if flows.is_empty() {
            return Ok(());
        }
        flows.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal));

        let span_mins = (flows[flows.len() - 1].ts - flows[0].ts) / 60.0;
        if span_mins < 20.0 {
            return Ok(());
        }

        let mut contacted: HashMap<&str, u32> = HashMap::new();
        for flow in &flows {
            *contacted.entry(flow.daddr.as_str()).or_insert(0) += 1;
        }
        // the gateway is usually the most contacted address; never report it
        if let Some(gateway) = self.store.get_default_gateway().await {
            contacted.remove(gateway.as_str());
        }
        let Some((most_contacted, times_contacted)) = contacted
            .into_iter()
            .max_by_key(|(_, count)| *count)
        else {
            return Ok(());
        };

        let total_bytes: u64 = flows
            .iter()
            .filter(|f| f.daddr == most_contacted)
            .map(|f| f.sbytes)
            .sum();
        if total_bytes < self.config.data_exfiltration_threshold * 1_000_000 {
            return Ok(());
        }

        let mb_sent = total_bytes / 1_000_000;
        let ident = self.store.get_ip_identification(most_contacted).await;
        let evidence = Evidence::new(
            EvidenceKind::DataExfiltration,
            DetectionTarget::DstIp,
            most_contacted,
            60.0,
            0.6,
        )
        .describe(format!(
            "Possible data exfiltration. {mb_sent} MB sent to {most_contacted}. {ident}. IP contacted {times_contacted} times"
        ))
        .from_record(rec);
        self.emit(evidence).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::store::{ContextStore, FlowRole};
    use crate::types::EvidenceKind;

    #[test]
    fn ignored_ip_ranges() {
        assert!(is_ignored_ip("224.0.0.251"));
        assert!(is_ignored_ip("192.168.1.10"));
        assert!(is_ignored_ip("127.0.0.1"));
        assert!(is_ignored_ip("255.255.255.255"));
        assert!(is_ignored_ip("10.0.0.255"));
        assert!(is_ignored_ip("fe80::1"));
        assert!(is_ignored_ip("fd00::5"));
        assert!(is_ignored_ip("not-an-ip"));
        assert!(!is_ignored_ip("8.8.8.8"));
        assert!(!is_ignored_ip("2606:4700::1111"));
    }

    #[test]
    fn p2p_sixth_contact_to_one_destination_classifies() {
        let mut p2p = P2pTracker::default();
        for _ in 0..5 {
            assert!(!p2p.classify(40_000, "udp", "1.2.3.4"));
        }
        assert!(p2p.classify(40_000, "udp", "1.2.3.4"));
        assert!(p2p.classify(40_000, "udp", "1.2.3.4"));
    }

    #[test]
    fn p2p_fifth_distinct_destination_classifies() {
        let mut p2p = P2pTracker::default();
        for i in 0..4 {
            assert!(!p2p.classify(40_000, "udp", &format!("10.1.1.{i}")));
        }
        assert!(p2p.classify(40_000, "udp", "10.1.1.4"));
        assert!(p2p.classify(40_000, "udp", "10.1.1.5"));
    }

    #[test]
    fn p2p_ignores_low_ports_and_tcp() {
        let mut p2p = P2pTracker::default();
        for _ in 0..10 {
            assert!(!p2p.classify(443, "udp", "1.2.3.4"));
            assert!(!p2p.classify(40_000, "tcp", "1.2.3.4"));
        }
    }

    #[tokio::test]
    async fn long_connection_over_threshold_alerts_and_labels() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 443);
        flow.dur = 4000.0;
        let rec = conn_record("C1", flow.clone());

        fx.alerts.check_long_connection(&rec, &flow).await.unwrap();

        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::LongConnection);
        assert_eq!(evidence[0].value, "1.2.3.4");
        assert_eq!(evidence[0].threat_level, 0.5);
        assert!((evidence[0].confidence - 4000.0 / 86_400.0).abs() < 1e-9);
        assert_eq!(
            fx.store
                .get_flow_label(&rec.profile_id, &rec.twid, "C1", "long-connection")
                .as_deref(),
            Some("malicious")
        );
    }

    #[tokio::test]
    async fn long_connection_under_threshold_labels_normal() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 443);
        flow.dur = 1500.0;
        let rec = conn_record("C2", flow.clone());

        fx.alerts.check_long_connection(&rec, &flow).await.unwrap();

        assert!(fx.sink.is_empty());
        assert_eq!(
            fx.store
                .get_flow_label(&rec.profile_id, &rec.twid, "C2", "long-connection")
                .as_deref(),
            Some("normal")
        );
    }

    #[tokio::test]
    async fn long_connection_skips_multicast_destinations() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "224.0.0.251", 5353);
        flow.dur = 90_000.0;
        let rec = conn_record("C3", flow.clone());

        fx.alerts.check_long_connection(&rec, &flow).await.unwrap();

        assert!(fx.sink.is_empty());
        assert!(fx
            .store
            .get_flow_label(&rec.profile_id, &rec.twid, "C3", "long-connection")
            .is_none());
    }

    #[tokio::test]
    async fn unknown_port_alerts_only_without_port_info() {
        let fx = fixture();
        let flow = tcp_flow("10.0.0.5", "1.2.3.4", 5771);
        let rec = conn_record("C4", flow.clone());

        fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::UnknownPort);
        assert_eq!(evidence[0].value, "5771");
        assert_eq!(evidence[0].confidence, 1.0);
        assert_eq!(evidence[0].threat_level, 0.6);

        fx.store.set_port_info("5771/tcp", "custom").await;
        fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn unknown_port_skips_icmp_and_ftp_data_ports() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 8);
        flow.proto = "icmp".into();
        let rec = conn_record("C5", flow.clone());
        fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());

        fx.store.add_ftp_port(20_020);
        let flow = tcp_flow("10.0.0.5", "1.2.3.4", 20_020);
        let rec = conn_record("C6", flow.clone());
        fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn unknown_port_suppressed_for_p2p_traffic() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 40_123);
        flow.proto = "udp".into();

        // first five contacts alert as unknown, the sixth classifies as P2P
        for i in 0..5 {
            let rec = conn_record(&format!("U{i}"), flow.clone());
            fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        }
        assert_eq!(fx.sink.take().len(), 5);

        let rec = conn_record("U6", flow.clone());
        fx.alerts.check_unknown_port(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn four_rejected_flows_stay_quiet_five_alert() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 80);
        flow.origstate = "REJ".into();

        for i in 0..4 {
            let rec = conn_record(&format!("R{i}"), flow.clone());
            fx.alerts.check_reconnections(&rec, &flow).await.unwrap();
        }
        assert!(fx.sink.is_empty());

        let rec = conn_record("R4", flow.clone());
        fx.alerts.check_reconnections(&rec, &flow).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::MultipleReconnectionAttempts);
        assert_eq!(evidence[0].value, "1.2.3.4");
        assert_eq!(evidence[0].threat_level, 20.0);

        // past the threshold every further rejection refires
        let rec = conn_record("R5", flow.clone());
        fx.alerts.check_reconnections(&rec, &flow).await.unwrap();
        assert_eq!(fx.sink.take().len(), 1);
    }

    #[tokio::test]
    async fn rejected_flows_to_port_zero_are_not_counted() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 0);
        flow.dport = Some(0);
        flow.origstate = "REJ".into();
        for i in 0..6 {
            let rec = conn_record(&format!("Z{i}"), flow.clone());
            fx.alerts.check_reconnections(&rec, &flow).await.unwrap();
        }
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn port0_direction_follows_the_zero_port() {
        let fx = fixture();

        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 80);
        flow.sport = 0;
        let rec = conn_record("P1", flow.clone());
        fx.alerts.check_port0(&rec, &flow).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence[0].kind, EvidenceKind::Port0Scanning);
        assert_eq!(evidence[0].target, DetectionTarget::SrcIp);
        assert_eq!(evidence[0].value, "10.0.0.5");

        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 0);
        flow.dport = Some(0);
        let rec = conn_record("P2", flow.clone());
        fx.alerts.check_port0(&rec, &flow).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence[0].target, DetectionTarget::DstIp);
        assert_eq!(evidence[0].value, "1.2.3.4");
    }

    #[tokio::test]
    async fn port0_skips_igmp_and_icmp() {
        let fx = fixture();
        for proto in ["igmp", "icmp", "ipv6-icmp"] {
            let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 0);
            flow.proto = proto.into();
            flow.dport = Some(0);
            let rec = conn_record("P3", flow.clone());
            fx.alerts.check_port0(&rec, &flow).await.unwrap();
        }
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn port0_is_a_pure_check() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 80);
        flow.sport = 0;
        let rec = conn_record("P4", flow.clone());

        fx.alerts.check_port0(&rec, &flow).await.unwrap();
        fx.alerts.check_port0(&rec, &flow).await.unwrap();

        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].value, evidence[1].value);
        assert_eq!(evidence[0].description, evidence[1].description);
    }

    #[tokio::test]
    async fn conn_without_dns_defers_then_alerts_once() {
        let fx = fixture();
        let flow = tcp_flow("10.0.0.5", "8.8.4.4", 443);
        let rec = conn_record("D1", flow.clone());

        // first pass: no evidence, exactly one re-check scheduled
        fx.alerts
            .check_connection_without_dns(&rec, &flow)
            .await
            .unwrap();
        assert!(fx.sink.is_empty());
        assert_eq!(fx.scheduler.in_flight(), 1);
        assert!(fx.alerts.pending_conn_without_dns.contains("D1"));

        // a second event with the same uid must not schedule again
        fx.alerts
            .check_connection_without_dns(&rec, &flow)
            .await
            .unwrap();
        assert_eq!(fx.scheduler.in_flight(), 1);
        assert!(fx.sink.is_empty());

        // driving the re-check with the resolution still absent alerts once
        fx.alerts
            .recheck_connection_without_dns("8.8.4.4", &rec.profile_id, &rec.twid, "D1", rec.timestamp)
            .await;
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::ConnectionWithoutDns);
        assert_eq!(evidence[0].threat_level, 0.9);
        assert!(!fx.alerts.pending_conn_without_dns.contains("D1"));

        // the key is resolved; a stray re-check firing is harmless
        fx.alerts
            .recheck_connection_without_dns("8.8.4.4", &rec.profile_id, &rec.twid, "D1", rec.timestamp)
            .await;
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn conn_without_dns_resolution_arriving_in_time_clears_the_key() {
        let fx = fixture();
        let flow = tcp_flow("10.0.0.5", "8.8.4.4", 443);
        let rec = conn_record("D2", flow.clone());

        fx.alerts
            .check_connection_without_dns(&rec, &flow)
            .await
            .unwrap();
        assert!(fx.alerts.pending_conn_without_dns.contains("D2"));

        fx.store.add_dns_resolution("8.8.4.4", "dns.example");
        fx.alerts
            .recheck_connection_without_dns("8.8.4.4", &rec.profile_id, &rec.twid, "D2", rec.timestamp)
            .await;
        assert!(fx.sink.is_empty());
        assert!(!fx.alerts.pending_conn_without_dns.contains("D2"));
    }

    #[tokio::test]
    async fn conn_without_dns_honors_live_capture_warmup() {
        let mut config = crate::config::DetectionConfig::default();
        config.live_capture = true;
        let fx = fixture_with(config);
        fx.store.set_start_time(Utc::now().timestamp() as f64);

        let flow = tcp_flow("10.0.0.5", "8.8.4.4", 443);
        let rec = conn_record("D3", flow.clone());
        fx.alerts
            .check_connection_without_dns(&rec, &flow)
            .await
            .unwrap();
        assert_eq!(fx.scheduler.in_flight(), 0);
        assert!(!fx.alerts.pending_conn_without_dns.contains("D3"));

        // past the warm-up the check is live again
        fx.store
            .set_start_time(Utc::now().timestamp() as f64 - 300.0);
        fx.alerts
            .check_connection_without_dns(&rec, &flow)
            .await
            .unwrap();
        assert_eq!(fx.scheduler.in_flight(), 1);
    }

    #[tokio::test]
    async fn multiple_ports_requires_more_than_one_distinct_port() {
        let fx = fixture();
        let flow = tcp_flow("10.0.0.5", "1.2.3.4", 7000);
        let rec = conn_record("M1", flow.clone());

        fx.store
            .add_contacted_port(&rec.profile_id, &rec.twid, FlowRole::Client, "1.2.3.4", 7000);
        fx.alerts.check_multiple_ports(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());

        fx.store
            .add_contacted_port(&rec.profile_id, &rec.twid, FlowRole::Client, "1.2.3.4", 7001);
        fx.alerts.check_multiple_ports(&rec, &flow).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::ConnectionToMultiplePorts);
        assert_eq!(evidence[0].value, "1.2.3.4");
        assert_eq!(evidence[0].threat_level, 20.0);
    }

    #[tokio::test]
    async fn multiple_ports_skips_named_services() {
        let fx = fixture();
        let mut flow = tcp_flow("10.0.0.5", "1.2.3.4", 443);
        flow.appproto = "ssl".into();
        let rec = conn_record("M2", flow.clone());
        fx.store
            .add_contacted_port(&rec.profile_id, &rec.twid, FlowRole::Client, "1.2.3.4", 443);
        fx.store
            .add_contacted_port(&rec.profile_id, &rec.twid, FlowRole::Client, "1.2.3.4", 8443);

        fx.alerts.check_multiple_ports(&rec, &flow).await.unwrap();
        assert!(fx.sink.is_empty());
    }

    fn history_flow(daddr: &str, ts: f64, sbytes: u64) -> ConnFlow {
        ConnFlow {
            saddr: "10.0.0.5".into(),
            daddr: daddr.into(),
            sbytes,
            ts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exfiltration_needs_twenty_minutes_of_history() {
        let fx = fixture();
        let rec = conn_record("E1", tcp_flow("10.0.0.5", "5.6.7.8", 443));

        // nineteen minutes of history: quiet regardless of volume
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F1", history_flow("5.6.7.8", 0.0, 900_000_000));
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F2", history_flow("5.6.7.8", 1140.0, 0));
        fx.alerts.check_data_exfiltration(&rec).await.unwrap();
        assert!(fx.sink.is_empty());

        // stretching the span to exactly twenty minutes alerts
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F3", history_flow("5.6.7.8", 1200.0, 0));
        fx.alerts.check_data_exfiltration(&rec).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::DataExfiltration);
        assert_eq!(evidence[0].value, "5.6.7.8");
        assert_eq!(evidence[0].threat_level, 60.0);
    }

    #[tokio::test]
    async fn exfiltration_under_volume_threshold_is_quiet() {
        let fx = fixture();
        let rec = conn_record("E2", tcp_flow("10.0.0.5", "5.6.7.8", 443));
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F1", history_flow("5.6.7.8", 0.0, 1_000_000));
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F2", history_flow("5.6.7.8", 1300.0, 1_000_000));
        fx.alerts.check_data_exfiltration(&rec).await.unwrap();
        assert!(fx.sink.is_empty());
    }

    #[tokio::test]
    async fn exfiltration_never_reports_the_gateway() {
        let fx = fixture();
        let rec = conn_record("E3", tcp_flow("10.0.0.5", "5.6.7.8", 443));
        fx.store.set_gateway("192.168.1.1");

        // the gateway is the most contacted and the heaviest destination
        for (i, ts) in [0.0, 600.0, 1300.0].iter().enumerate() {
            fx.store.add_flow(
                &rec.profile_id,
                &rec.twid,
                &format!("G{i}"),
                history_flow("192.168.1.1", *ts, 900_000_000),
            );
        }
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F1", history_flow("5.6.7.8", 100.0, 700_000_000));
        fx.store
            .add_flow(&rec.profile_id, &rec.twid, "F2", history_flow("5.6.7.8", 200.0, 100_000_000));

        fx.alerts.check_data_exfiltration(&rec).await.unwrap();
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].value, "5.6.7.8");
    }
}
