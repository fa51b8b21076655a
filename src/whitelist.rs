//! Evidence whitelist
//!
//! Operator-listed IPs and domains whose evidence is suppressed before it
//! reaches the sink. Domain entries match the domain itself and its
//! subdomains.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sink::EvidenceSink;
use crate::types::{DetectionTarget, Evidence};

/// Whitelist configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub domains: Vec<String>,
}

/// Compiled whitelist with set lookups.
#[derive(Debug, Default)]
pub struct Whitelist {
    ips: HashSet<String>,
    domains: HashSet<String>,
}

impl Whitelist {
    pub fn new(config: &WhitelistConfig) -> Self {
        Self {
            ips: config.ips.iter().cloned().collect(),
            domains: config.domains.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.domains.is_empty()
    }

    /// Should this evidence be suppressed?
    pub fn matches(&self, evidence: &Evidence) -> bool {
        match evidence.target {
            DetectionTarget::SrcIp | DetectionTarget::DstIp => {
                self.ips.contains(&evidence.value)
            }
            DetectionTarget::Dport => false,
            DetectionTarget::DstDomain => {
                self.domains.contains(&evidence.value)
                    || self
                        .domains
                        .iter()
                        .any(|d| evidence.value.ends_with(&format!(".{d}")))
            }
        }
    }
}

/// Sink wrapper applying the whitelist and counting what passes through.
pub struct FilteredSink {
    whitelist: Whitelist,
    inner: Arc<dyn EvidenceSink>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

impl FilteredSink {
    pub fn new(whitelist: Whitelist, inner: Arc<dyn EvidenceSink>) -> Self {
        Self {
            whitelist,
            inner,
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EvidenceSink for FilteredSink {
    async fn submit(&self, evidence: Evidence) {
        if self.whitelist.matches(&evidence) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %evidence.kind, value = %evidence.value, "evidence suppressed by whitelist");
            return;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.inner.submit(evidence).await;
    }
}
