//! SSL-channel checks
//!
//! Self-signed certificates reported by the TLS parser, and JA3/JA3S
//! fingerprint matches against the threat-intel mapping. Stateless
//! single-shot checks.

use anyhow::Result;

use crate::types::{DetectionTarget, Evidence, EvidenceKind, FlowRecord, SslFlow};

use super::FlowAlerts;

impl FlowAlerts {
    /// Run the SSL-channel checks for one TLS session record.
    pub async fn handle_ssl(&self, rec: &FlowRecord, ssl: &SslFlow) {
        if let Err(e) = self.check_self_signed(rec, ssl).await {
            self.note_failure("self-signed-certificate", &e);
        }
        if let Err(e) = self.check_malicious_fingerprints(rec, ssl).await {
            self.note_failure("malicious-fingerprint", &e);
        }
    }

    async fn check_self_signed(&self, rec: &FlowRecord, ssl: &SslFlow) -> Result<()> {
        if !ssl.validation_status.contains("self signed") {
            return Ok(());
        }
        let ident = self.store.get_ip_identification(&ssl.daddr).await;
        let description = if ssl.server_name.is_empty() {
            format!("Self-signed certificate. Destination IP: {}. {}", ssl.daddr, ident)
        } else {
            format!(
                "Self-signed certificate. Destination IP: {}, SNI: {}. {}",
                ssl.daddr, ssl.server_name, ident
            )
        };
        let evidence = Evidence::new(
            EvidenceKind::SelfSignedCertificate,
            DetectionTarget::DstIp,
            &ssl.daddr,
            0.3,
            0.5,
        )
        .describe(description)
        .from_record(rec);
        self.emit(evidence).await;
        Ok(())
    }

    async fn check_malicious_fingerprints(&self, rec: &FlowRecord, ssl: &SslFlow) -> Result<()> {
        if ssl.ja3.is_empty() && ssl.ja3s.is_empty() {
            return Ok(());
        }
        let intel = self.store.get_ja3_intel().await;

        if !ssl.ja3.is_empty() {
            if let Some(entry) = intel.get(&ssl.ja3) {
                let evidence = Evidence::new(
                    EvidenceKind::MaliciousJa3,
                    DetectionTarget::DstIp,
                    &ssl.daddr,
                    80.0,
                    1.0,
                )
                .describe(format!(
                    "Malicious JA3: {} to daddr {} description: {} [{}]",
                    ssl.ja3, ssl.daddr, entry.description, entry.tags
                ))
                .from_record(rec);
                self.emit(evidence).await;
            }
        }

        if !ssl.ja3s.is_empty() {
            if let Some(entry) = intel.get(&ssl.ja3s) {
                let evidence = Evidence::new(
                    EvidenceKind::MaliciousJa3s,
                    DetectionTarget::DstIp,
                    &ssl.daddr,
                    80.0,
                    1.0,
                )
                .describe(format!(
                    "Malicious JA3s (possible C&C server): {} on server {} description: {} [{}]",
                    ssl.ja3s, ssl.daddr, entry.description, entry.tags
                ))
                .from_record(rec);
                self.emit(evidence).await;
            }
        }
        Ok(())
    }
}
