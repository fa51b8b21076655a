//! Evidence output
//!
//! Detectors hand finished evidence to an [`EvidenceSink`]; delivery is
//! fire-and-forget, the core never waits for an acknowledgement.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::Evidence;

/// Downstream receiver of detection evidence.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    async fn submit(&self, evidence: Evidence);
}

/// Sink forwarding evidence into a tokio channel, for embedding the engine
/// in a larger pipeline.
pub struct ChannelSink {
    tx: mpsc::Sender<Evidence>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Evidence>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EvidenceSink for ChannelSink {
    async fn submit(&self, evidence: Evidence) {
        if self.tx.send(evidence).await.is_err() {
            warn!("evidence channel closed, dropping evidence");
        }
    }
}

/// Buffering sink used by tests and small embedders.
#[derive(Default)]
pub struct CollectingSink {
    inner: Mutex<Vec<Evidence>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current evidence, cloned.
    pub fn snapshot(&self) -> Vec<Evidence> {
        self.inner.lock().clone()
    }

    /// Drain the buffer.
    pub fn take(&self) -> Vec<Evidence> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[async_trait]
impl EvidenceSink for CollectingSink {
    async fn submit(&self, evidence: Evidence) {
        self.inner.lock().push(evidence);
    }
}
