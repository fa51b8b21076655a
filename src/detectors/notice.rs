//! Notice-channel checks
//!
//! The upstream analyzer raises notices with vendor-defined message and
//! category strings; these checks pattern-match the fixed substrings and
//! translate matches into evidence. Stateless single-shot checks.

use anyhow::Result;

use crate::types::{DetectionTarget, Evidence, EvidenceKind, FlowRecord, NoticeFlow};

use super::FlowAlerts;

impl FlowAlerts {
    /// Run every notice-channel check against one notice record.
    pub async fn handle_notice(&self, rec: &FlowRecord, notice: &NoticeFlow) {
        if let Err(e) = self.check_notice(rec, notice).await {
            self.note_failure("notice", &e);
        }
    }

    async fn check_notice(&self, rec: &FlowRecord, notice: &NoticeFlow) -> Result<()> {
        let msg = &notice.msg;
        let note = &notice.note;

        if msg.contains("self signed") || msg.contains("self-signed") {
            let ident = self.store.get_ip_identification(&notice.daddr).await;
            let evidence = Evidence::new(
                EvidenceKind::SelfSignedCertificate,
                DetectionTarget::DstIp,
                &notice.daddr,
                30.0,
                0.5,
            )
            .describe(format!(
                "Self-signed certificate. Destination IP {}. {}",
                notice.daddr, ident
            ))
            .from_record(rec);
            self.emit(evidence).await;
        }

        if note.contains("Port_Scan") {
            let evidence = Evidence::new(
                EvidenceKind::PortScanType1,
                DetectionTarget::DstIp,
                &notice.scanning_ip,
                60.0,
                1.0,
            )
            .describe(format!("Vertical port scan reported upstream. {msg}"))
            .from_record(rec);
            self.emit(evidence).await;
        }

        if msg.contains("SSL certificate validation failed") {
            let ident = self.store.get_ip_identification(&notice.daddr).await;
            let evidence = Evidence::new(
                EvidenceKind::InvalidCertificate,
                DetectionTarget::DstIp,
                &notice.daddr,
                0.2,
                0.5,
            )
            .describe(format!("{msg} Destination IP: {}. {}", notice.daddr, ident))
            .from_record(rec);
            self.emit(evidence).await;
        }

        if note.contains("Address_Scan") {
            let evidence = Evidence::new(
                EvidenceKind::PortScanType2,
                DetectionTarget::Dport,
                &notice.scanned_port,
                60.0,
                1.0,
            )
            .describe(format!("Horizontal port scan reported upstream. {msg}"))
            .from_record(rec);
            self.emit(evidence).await;
        }

        if note.contains("Password_Guessing") {
            let evidence = Evidence::new(
                EvidenceKind::PasswordGuessing,
                DetectionTarget::DstIp,
                &notice.scanning_ip,
                0.6,
                1.0,
            )
            .describe(format!("Password guessing reported upstream. {msg}"))
            .from_record(rec);
            self.emit(evidence).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::types::FlowEvent;

    fn notice_record(uid: &str, notice: NoticeFlow) -> FlowRecord {
        FlowRecord {
            profile_id: "profile_10.0.0.5".into(),
            twid: "timewindow1".into(),
            uid: uid.into(),
            timestamp: 1_700_000_000.0,
            event: FlowEvent::Notice(notice),
        }
    }

    #[tokio::test]
    async fn port_scan_notice_targets_the_scanner() {
        let fx = fixture();
        let notice = NoticeFlow {
            msg: "192.168.1.200 has scanned 60 ports of 192.168.1.102".into(),
            note: "Scan::Port_Scan".into(),
            scanning_ip: "192.168.1.200".into(),
            ..Default::default()
        };
        let rec = notice_record("N1", notice.clone());

        fx.alerts.handle_notice(&rec, &notice).await;
        let evidence = fx.sink.take();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::PortScanType1);
        assert_eq!(evidence[0].value, "192.168.1.200");
        assert_eq!(evidence[0].confidence, 1.0);
        assert_eq!(evidence[0].threat_level, 60.0);
    }

    #[tokio::test]
    async fn address_scan_notice_targets_the_port() {
        let fx = fixture();
        let notice = NoticeFlow {
            msg: "scanned 30 hosts on 23/tcp".into(),
            note: "Scan::Address_Scan".into(),
            scanned_port: "23".into(),
            ..Default::default()
        };
        let rec = notice_record("N2", notice.clone());

        fx.alerts.handle_notice(&rec, &notice).await;
        let evidence = fx.sink.take();
        assert_eq!(evidence[0].kind, EvidenceKind::PortScanType2);
        assert_eq!(evidence[0].target, DetectionTarget::Dport);
        assert_eq!(evidence[0].value, "23");
    }

    #[tokio::test]
    async fn password_guessing_notice_alerts() {
        let fx = fixture();
        let notice = NoticeFlow {
            msg: "198.51.100.3 appears to be guessing SSH passwords".into(),
            note: "SSH::Password_Guessing".into(),
            scanning_ip: "198.51.100.3".into(),
            ..Default::default()
        };
        let rec = notice_record("N3", notice.clone());

        fx.alerts.handle_notice(&rec, &notice).await;
        let evidence = fx.sink.take();
        assert_eq!(evidence[0].kind, EvidenceKind::PasswordGuessing);
        assert_eq!(evidence[0].threat_level, 0.6);
    }

    #[tokio::test]
    async fn certificate_notices_alert_on_the_destination() {
        let fx = fixture();
        let notice = NoticeFlow {
            msg: "SSL certificate validation failed with (self signed certificate)".into(),
            note: "SSL::Invalid_Server_Cert".into(),
            daddr: "203.0.113.4".into(),
            ..Default::default()
        };
        let rec = notice_record("N4", notice.clone());

        fx.alerts.handle_notice(&rec, &notice).await;
        let evidence = fx.sink.take();
        // the message carries both patterns; both checks fire
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].kind, EvidenceKind::SelfSignedCertificate);
        assert_eq!(evidence[0].threat_level, 30.0);
        assert_eq!(evidence[1].kind, EvidenceKind::InvalidCertificate);
        assert_eq!(evidence[1].threat_level, 0.2);
    }

    #[tokio::test]
    async fn scan_notice_without_a_scanner_address_is_dropped() {
        let fx = fixture();
        let notice = NoticeFlow {
            msg: "scan with no attribution".into(),
            note: "Scan::Port_Scan".into(),
            ..Default::default()
        };
        let rec = notice_record("N5", notice.clone());

        fx.alerts.handle_notice(&rec, &notice).await;
        // empty detection value violates the evidence invariant; dropped
        assert!(fx.sink.is_empty());
    }
}
