//! DNS-without-connection check
//!
//! A resolved query whose answer IPs are never contacted within the time
//! window is suspicious. Connections and their resolutions arrive in either
//! order, so the first sight of an unmatched resolution only defers; the
//! re-check pass decides.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::scheduler::TaskKey;
use crate::types::{DetectionTarget, DnsFlow, Evidence, EvidenceKind, FlowRecord};

use super::FlowAlerts;

const DNS_WITHOUT_CONN: &str = "dns-without-conn";

/// Domains with benign unmatched resolutions: reverse lookups, link-local
/// names, wildcards, the ASN lookup service, single labels, and the proxy
/// autodiscovery name.
fn is_ignored_domain(domain: &str) -> bool {
    domain.contains("arpa")
        || domain.contains(".local")
        || domain.contains('*')
        || domain.ends_with(".cymru.com")
        || !domain.contains('.')
        || domain == "WPAD"
}

impl FlowAlerts {
    /// Run the DNS-channel check for one answered query.
    pub async fn handle_dns(&self, rec: &FlowRecord, dns: &DnsFlow) {
        // unanswered queries cannot be expected to produce a connection
        if dns.answers.is_empty() {
            return;
        }
        if let Err(e) = self
            .check_dns_without_connection(
                &dns.query,
                &dns.answers,
                &rec.profile_id,
                &rec.twid,
                &rec.uid,
                rec.timestamp,
                false,
            )
            .await
        {
            self.note_failure("dns-without-connection", &e);
        }
    }

    /// Two-phase check: when no candidate IP of the query appears in the
    /// window's contacted set, the first pass defers and the re-check pass
    /// (`is_recheck`) alerts. Candidate IPs merge previously cached
    /// resolutions of the same domain, covering A/AAAA splits across
    /// separate queries.
    #[allow(clippy::too_many_arguments)]
    fn check_dns_without_connection<'a>(
        &'a self,
        domain: &'a str,
        answers: &'a [String],
        profile_id: &'a str,
        twid: &'a str,
        uid: &'a str,
        timestamp: f64,
        is_recheck: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        if is_ignored_domain(domain) {
            return Ok(());
        }

        let mut candidates: Vec<String> =
            answers.iter().filter(|a| !a.is_empty()).cloned().collect();
        for ip in self.store.get_domain_ips(domain).await {
            if !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let contacted = self.store.get_all_contacted_ips(profile_id, twid).await;
        if candidates.iter().any(|ip| contacted.contains(ip)) {
            // the connection exists (or arrived during the defer window)
            self.pending_dns_without_conn.clear(uid);
            return Ok(());
        }

        if is_recheck {
            if self.pending_dns_without_conn.clear(uid) {
                let evidence = Evidence::new(
                    EvidenceKind::DnsWithoutConnection,
                    DetectionTarget::DstDomain,
                    domain,
                    0.3,
                    0.8,
                )
                .describe(format!("Domain {domain} resolved with no connection"))
                .tagged(profile_id, twid, uid, timestamp);
                self.emit(evidence).await;
            }
            return Ok(());
        }

        if self.pending_dns_without_conn.mark(uid) {
            let Some(me) = self.weak.upgrade() else {
                self.pending_dns_without_conn.clear(uid);
                return Ok(());
            };
            let domain = domain.to_string();
            let answers = answers.to_vec();
            let profile_id = profile_id.to_string();
            let twid = twid.to_string();
            let uid_owned = uid.to_string();
            self.scheduler.schedule(
                TaskKey::new(DNS_WITHOUT_CONN, uid),
                self.recheck_delay(),
                Box::pin(async move {
                    if let Err(e) = me
                        .check_dns_without_connection(
                            &domain,
                            &answers,
                            &profile_id,
                            &twid,
                            &uid_owned,
                            timestamp,
                            true,
                        )
                        .await
                    {
                        me.note_failure("dns-without-connection", &e);
                    }
                }),
            );
        }
        Ok(())
        })
    }
}
