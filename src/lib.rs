//! flowsentry - behavioral analysis of parsed network flows
//!
//! Consumes a stream of already-parsed flow records (connection summaries,
//! DNS answers, TLS/SSH/service metadata), runs each through a set of
//! independent heuristic detectors, and emits structured [`types::Evidence`]
//! when a threshold or pattern is met. Detectors that depend on a correlated
//! event that may arrive later (a DNS answer, the original connection flow)
//! defer their decision through a one-shot delayed re-check instead of
//! alerting immediately.
//!
//! The flow history, DNS cache and threat-intel knowledge bases live behind
//! the [`store::ContextStore`] trait; evidence leaves through
//! [`sink::EvidenceSink`]. Both are injected, keeping this crate a pure
//! pipeline stage.

pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod tracker;
pub mod types;
pub mod whitelist;

pub use config::Config;
pub use engine::{Engine, EngineHandle, EngineMsg, EngineStats};
pub use error::FlowsentryError;
pub use types::{Evidence, FlowEvent, FlowRecord};
