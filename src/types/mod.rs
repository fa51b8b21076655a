//! Core data types
//!
//! Flow records entering the engine and evidence records leaving it.

pub mod evidence;
pub mod flow;

pub use evidence::{DetectionTarget, Evidence, EvidenceKind, SshModel};
pub use flow::{ConnFlow, DnsFlow, FlowEvent, FlowRecord, NoticeFlow, ServiceFlow, SshFlow, SslFlow};
