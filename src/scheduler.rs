//! Deferred re-check scheduling
//!
//! One shared scheduler replaces per-check timer threads: each scheduled
//! re-check becomes an independent tokio timer task tracked in a single
//! registry keyed by (detector, id). The dedup tracker, not this registry,
//! is what guarantees at most one pending re-check per key; aborting a
//! superseded task here is belt-only cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed future driven by a re-check task.
pub type RecheckFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Identifies one scheduled re-check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub detector: &'static str,
    pub id: String,
}

impl TaskKey {
    pub fn new(detector: &'static str, id: impl Into<String>) -> Self {
        Self {
            detector,
            id: id.into(),
        }
    }
}

/// One-shot delayed re-evaluation scheduler shared by all detectors.
#[derive(Default)]
pub struct RecheckScheduler {
    tasks: Mutex<HashMap<TaskKey, JoinHandle<()>>>,
}

impl RecheckScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for `fut` to run once, after at least `delay`, without
    /// blocking the caller or any other scheduled re-check.
    pub fn schedule(&self, key: TaskKey, delay: Duration, fut: RecheckFuture) {
        debug!(detector = key.detector, id = %key.id, delay_secs = delay.as_secs(), "scheduling re-check");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(old) = tasks.insert(key.clone(), handle) {
            if !old.is_finished() {
                warn!(detector = key.detector, id = %key.id, "replacing pending re-check");
                old.abort();
            }
        }
    }

    /// Number of re-checks scheduled but not yet completed.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        tasks.len()
    }

    /// Abort every pending re-check. Best-effort: a task that already fired
    /// is harmless because the re-check logic is idempotent.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for (key, handle) in tasks.drain() {
            if !handle.is_finished() {
                debug!(detector = key.detector, id = %key.id, "aborting pending re-check");
                handle.abort();
            }
        }
    }
}
