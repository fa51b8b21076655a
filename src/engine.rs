//! Event dispatch engine
//!
//! One sequential loop consumes the event stream and routes each record to
//! the detectors for its channel, which keeps per-window counters and dedup
//! sets consistent without locking in the hot path. Deferred re-checks run
//! outside the loop on scheduler tasks. A stop sentinel terminates the loop
//! gracefully; pending re-checks are then aborted best-effort.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, EngineConfig};
use crate::detectors::FlowAlerts;
use crate::error::FlowsentryError;
use crate::scheduler::RecheckScheduler;
use crate::sink::EvidenceSink;
use crate::store::ContextStore;
use crate::types::{FlowEvent, FlowRecord};
use crate::whitelist::{FilteredSink, Whitelist};

/// Message consumed by the engine loop.
#[derive(Debug)]
pub enum EngineMsg {
    Flow(Box<FlowRecord>),
    /// Sentinel: flush and terminate
    Stop,
}

/// Sending half of the engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
}

impl EngineHandle {
    /// Queue one record for dispatch.
    pub async fn send(&self, rec: FlowRecord) -> crate::error::Result<()> {
        self.tx
            .send(EngineMsg::Flow(Box::new(rec)))
            .await
            .map_err(|_| FlowsentryError::ChannelClosed)
    }

    /// Send the stop sentinel.
    pub async fn stop(&self) -> crate::error::Result<()> {
        self.tx
            .send(EngineMsg::Stop)
            .await
            .map_err(|_| FlowsentryError::ChannelClosed)
    }
}

/// Counters kept by the engine loop.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    pub events: u64,
    pub conn: u64,
    pub dns: u64,
    pub ssh: u64,
    pub ssl: u64,
    pub notice: u64,
    pub service: u64,
    pub evidence_emitted: u64,
    pub evidence_suppressed: u64,
    pub check_failures: u64,
}

/// The dispatcher: owns the event loop and the detector set.
pub struct Engine {
    alerts: Arc<FlowAlerts>,
    scheduler: Arc<RecheckScheduler>,
    sink: Arc<FilteredSink>,
    store: Arc<dyn ContextStore>,
    engine_config: EngineConfig,
    rx: mpsc::Receiver<EngineMsg>,
    stats: EngineStats,
}

impl Engine {
    /// Build an engine wired to the given store and evidence sink. Returns
    /// the engine and the handle feeding its event loop.
    pub fn new(
        config: &Config,
        store: Arc<dyn ContextStore>,
        sink: Arc<dyn EvidenceSink>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(config.engine.buffer_size);
        let scheduler = Arc::new(RecheckScheduler::new());
        let sink = Arc::new(FilteredSink::new(Whitelist::new(&config.whitelist), sink));
        let alerts = FlowAlerts::new(
            config.detection.clone(),
            store.clone(),
            sink.clone(),
            scheduler.clone(),
        );

        (
            Self {
                alerts,
                scheduler,
                sink,
                store,
                engine_config: config.engine.clone(),
                rx,
                stats: EngineStats::default(),
            },
            EngineHandle { tx },
        )
    }

    /// Run the event loop until a stop sentinel arrives or every sender is
    /// dropped. Returns the final counters.
    pub async fn run(mut self) -> Result<EngineStats> {
        if let Some(path) = self.engine_config.ports_info_path.clone() {
            match self.load_port_knowledge(&path).await {
                Ok(count) => {
                    info!("Loaded {count} known port/service pairs from {}", path.display())
                }
                Err(e) => warn!("Failed to load port knowledge from {}: {e:#}", path.display()),
            }
        }

        info!("Engine started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                EngineMsg::Stop => {
                    info!("Stop sentinel received, shutting down");
                    break;
                }
                EngineMsg::Flow(rec) => self.dispatch(&rec).await,
            }
        }

        let pending = self.scheduler.in_flight();
        if pending > 0 {
            debug!("Aborting {pending} pending re-checks");
        }
        self.scheduler.shutdown();

        self.stats.evidence_emitted = self.sink.emitted();
        self.stats.evidence_suppressed = self.sink.suppressed();
        self.stats.check_failures = self.alerts.check_failures();
        info!(
            events = self.stats.events,
            evidence = self.stats.evidence_emitted,
            suppressed = self.stats.evidence_suppressed,
            failures = self.stats.check_failures,
            "Engine stopped"
        );
        Ok(self.stats)
    }

    /// Route one record to the detectors for its channel. Detector failures
    /// are logged and counted inside the detector set; nothing here can
    /// abort the loop.
    async fn dispatch(&mut self, rec: &FlowRecord) {
        self.stats.events += 1;
        match &rec.event {
            FlowEvent::Conn(flow) => {
                self.stats.conn += 1;
                self.alerts.handle_conn(rec, flow).await;
            }
            FlowEvent::Dns(dns) => {
                self.stats.dns += 1;
                self.alerts.handle_dns(rec, dns).await;
            }
            FlowEvent::Ssh(ssh) => {
                self.stats.ssh += 1;
                self.alerts.handle_ssh(rec, ssh).await;
            }
            FlowEvent::Ssl(ssl) => {
                self.stats.ssl += 1;
                self.alerts.handle_ssl(rec, ssl).await;
            }
            FlowEvent::Notice(notice) => {
                self.stats.notice += 1;
                self.alerts.handle_notice(rec, notice).await;
            }
            FlowEvent::Service(svc) => {
                self.stats.service += 1;
                self.alerts.handle_service(rec, svc).await;
            }
        }
    }

    /// Load operator-known `port/proto,service` rows into the store so they
    /// never raise Unknown Port. Malformed rows are skipped.
    async fn load_port_knowledge(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ports info file: {}", path.display()))?;

        let mut loaded = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = line
                .split_once(',')
                .filter(|(portproto, _)| portproto.contains('/'));
            let Some((portproto, service)) = parsed else {
                warn!("Skipping malformed ports info line {}", lineno + 1);
                continue;
            };
            self.store
                .set_port_info(portproto.trim(), service.trim())
                .await;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use crate::store::MemoryStore;
    use crate::types::ConnFlow;
    use std::io::Write;

    fn port0_record(saddr: &str) -> FlowRecord {
        FlowRecord {
            profile_id: format!("profile_{saddr}"),
            twid: "timewindow1".into(),
            uid: "C1".into(),
            timestamp: 1_700_000_000.0,
            event: FlowEvent::Conn(ConnFlow {
                saddr: saddr.into(),
                daddr: "192.168.1.7".into(),
                sport: 0,
                dport: Some(0),
                proto: "tcp".into(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn stop_sentinel_terminates_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let (engine, tx) = Engine::new(&Config::default(), store, sink.clone());
        let handle = tokio::spawn(engine.run());

        tx.send(port0_record("10.0.0.9")).await.unwrap();
        tx.stop().await.unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.conn, 1);
        assert_eq!(stats.evidence_emitted, 1);
        assert_eq!(sink.len(), 1);

        // the loop is gone; further sends surface as a typed error
        assert!(matches!(
            tx.send(port0_record("10.0.0.9")).await,
            Err(FlowsentryError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn dropping_every_handle_also_terminates() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let (engine, tx) = Engine::new(&Config::default(), store, sink);
        let handle = tokio::spawn(engine.run());
        drop(tx);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.events, 0);
    }

    #[tokio::test]
    async fn whitelisted_evidence_is_suppressed() {
        let mut config = Config::default();
        config.whitelist.ips.push("10.0.0.9".into());

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let (engine, tx) = Engine::new(&config, store, sink.clone());
        let handle = tokio::spawn(engine.run());

        tx.send(port0_record("10.0.0.9")).await.unwrap();
        tx.stop().await.unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.evidence_emitted, 0);
        assert_eq!(stats.evidence_suppressed, 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn port_knowledge_bootstrap_feeds_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# operator-known services").unwrap();
        writeln!(file, "5771/tcp,custom-agent").unwrap();
        writeln!(file, "not a valid row").unwrap();
        drop(file);

        let mut config = Config::default();
        config.engine.ports_info_path = Some(path);

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let (engine, tx) = Engine::new(&config, store, sink.clone());
        let handle = tokio::spawn(engine.run());

        // 5771/tcp is known now; an established flow there raises nothing
        let mut rec = port0_record("10.0.0.9");
        if let FlowEvent::Conn(ref mut flow) = rec.event {
            flow.sport = 50_000;
            flow.dport = Some(5771);
            flow.daddr = "192.168.1.7".into();
        }
        tx.send(rec).await.unwrap();
        tx.stop().await.unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.evidence_emitted, 0);
        assert!(sink.is_empty());
    }
}
