//! Heuristic flow detectors
//!
//! Each check is a self-contained function of one flow record plus context.
//! Stateless checks decide immediately; the three deferred checks
//! (connection-without-DNS, DNS-without-connection, successful-SSH) mark the
//! flow uid pending, schedule a one-shot re-check through the shared
//! scheduler, and decide on the re-check pass. Re-check tasks race the main
//! loop, so every piece of shared state here is lock-guarded.

mod conn;
mod dns;
mod notice;
mod ssh;
mod ssl;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::DetectionConfig;
use crate::scheduler::RecheckScheduler;
use crate::sink::EvidenceSink;
use crate::store::ContextStore;
use crate::tracker::PendingSet;
use crate::types::{Evidence, FlowRecord, ServiceFlow};

use conn::P2pTracker;

pub(crate) const LABEL_MALICIOUS: &str = "malicious";
pub(crate) const LABEL_NORMAL: &str = "normal";

/// The detector set: heuristics plus the state they share with their
/// re-check tasks.
pub struct FlowAlerts {
    /// Self-handle cloned into scheduled re-check tasks
    weak: Weak<FlowAlerts>,
    config: DetectionConfig,
    store: Arc<dyn ContextStore>,
    sink: Arc<dyn EvidenceSink>,
    scheduler: Arc<RecheckScheduler>,
    /// uids mid-defer waiting for a DNS answer to arrive
    pending_conn_without_dns: PendingSet,
    /// uids mid-defer waiting for a connection to a resolved domain
    pending_dns_without_conn: PendingSet,
    /// uids mid-defer waiting for the original SSH conn flow
    pending_ssh: PendingSet,
    /// High-port UDP peer-to-peer heuristic counters
    p2p: Mutex<P2pTracker>,
    check_failures: AtomicU64,
}

impl FlowAlerts {
    pub fn new(
        config: DetectionConfig,
        store: Arc<dyn ContextStore>,
        sink: Arc<dyn EvidenceSink>,
        scheduler: Arc<RecheckScheduler>,
    ) -> Arc<Self> {
        info!(
            "Initializing flow detectors (long_conn={}s, ssh_bytes={}, exfil={}MB, recheck={}s)",
            config.long_connection_threshold,
            config.ssh_successful_detection_threshold,
            config.data_exfiltration_threshold,
            config.recheck_delay_secs,
        );

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            store,
            sink,
            scheduler,
            pending_conn_without_dns: PendingSet::new(),
            pending_dns_without_conn: PendingSet::new(),
            pending_ssh: PendingSet::new(),
            p2p: Mutex::new(P2pTracker::default()),
            check_failures: AtomicU64::new(0),
        })
    }

    /// Failed check invocations so far. One failure never stops the loop.
    pub fn check_failures(&self) -> u64 {
        self.check_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.config.recheck_delay_secs)
    }

    pub(crate) fn note_failure(&self, check: &str, err: &anyhow::Error) {
        self.check_failures.fetch_add(1, Ordering::Relaxed);
        warn!("{check} check failed: {err:#}");
    }

    /// Submit evidence, enforcing the non-empty detection value invariant.
    pub(crate) async fn emit(&self, evidence: Evidence) {
        if evidence.value.is_empty() {
            warn!(kind = %evidence.kind, "dropping evidence with empty detection value");
            return;
        }
        debug!(kind = %evidence.kind, value = %evidence.value, "evidence");
        self.sink.submit(evidence).await;
    }

    /// Learn a service observed on a port/proto pair the knowledge base does
    /// not cover yet. Side-channel write, produces no evidence.
    pub async fn handle_service(&self, _rec: &FlowRecord, svc: &ServiceFlow) {
        let portproto = format!("{}/{}", svc.port_num, svc.port_proto.to_lowercase());
        if self.store.get_port_info(&portproto).await.is_some() {
            return;
        }
        if let Some(name) = svc.service.first().filter(|n| !n.is_empty()) {
            debug!(%portproto, service = %name, "learning service for unknown port");
            self.store.set_port_info(&portproto, name).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use crate::store::ContextStore;
    use crate::types::{FlowEvent, ServiceFlow};

    #[tokio::test]
    async fn service_learning_registers_unknown_ports() {
        let fx = fixture();
        let mut rec = conn_record("S1", tcp_flow("10.0.0.5", "1.2.3.4", 9999));
        rec.event = FlowEvent::Service(ServiceFlow {
            port_num: 9999,
            port_proto: "TCP".into(),
            service: vec!["custom-rpc".into()],
        });
        let svc = match &rec.event {
            FlowEvent::Service(s) => s.clone(),
            _ => unreachable!(),
        };

        fx.alerts.handle_service(&rec, &svc).await;
        assert_eq!(
            fx.store.get_port_info("9999/tcp").await.as_deref(),
            Some("custom-rpc")
        );

        // a known pair is left untouched
        fx.store.set_port_info("22/tcp", "ssh").await;
        let svc = ServiceFlow {
            port_num: 22,
            port_proto: "tcp".into(),
            service: vec!["other".into()],
        };
        fx.alerts.handle_service(&rec, &svc).await;
        assert_eq!(fx.store.get_port_info("22/tcp").await.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn empty_detection_values_never_reach_the_sink() {
        use crate::types::{DetectionTarget, Evidence, EvidenceKind};
        let fx = fixture();
        fx.alerts
            .emit(Evidence::new(
                EvidenceKind::PortScanType1,
                DetectionTarget::DstIp,
                "",
                60.0,
                1.0,
            ))
            .await;
        assert!(fx.sink.is_empty());
    }
}
