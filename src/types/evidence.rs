//! Detection evidence
//!
//! Output format shared by all detectors. Threat levels are raw
//! detector-defined severities and are deliberately not normalized across
//! detectors; downstream aggregation owns that decision.

use std::fmt;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::flow::FlowRecord;

/// What a piece of evidence points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionTarget {
    SrcIp,
    DstIp,
    Dport,
    DstDomain,
}

impl fmt::Display for DetectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionTarget::SrcIp => write!(f, "srcip"),
            DetectionTarget::DstIp => write!(f, "dstip"),
            DetectionTarget::Dport => write!(f, "dport"),
            DetectionTarget::DstDomain => write!(f, "dstdomain"),
        }
    }
}

/// Which model inferred a successful SSH login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshModel {
    /// The upstream parser flagged the authentication as successful
    AuthFlag,
    /// Inferred from the transferred byte count
    ByteThreshold,
}

impl SshModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SshModel::AuthFlag => "AuthFlag",
            SshModel::ByteThreshold => "ByteThreshold",
        }
    }
}

/// Detector-specific evidence tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    LongConnection,
    UnknownPort,
    MultipleReconnectionAttempts,
    ConnectionToMultiplePorts,
    Port0Scanning,
    ConnectionWithoutDns,
    DnsWithoutConnection,
    SshSuccessful(SshModel),
    SelfSignedCertificate,
    InvalidCertificate,
    MaliciousJa3,
    MaliciousJa3s,
    DataExfiltration,
    PortScanType1,
    PortScanType2,
    PasswordGuessing,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceKind::LongConnection => write!(f, "LongConnection"),
            EvidenceKind::UnknownPort => write!(f, "UnknownPort"),
            EvidenceKind::MultipleReconnectionAttempts => {
                write!(f, "MultipleReconnectionAttempts")
            }
            EvidenceKind::ConnectionToMultiplePorts => write!(f, "ConnectionToMultiplePorts"),
            EvidenceKind::Port0Scanning => write!(f, "Port0Scanning"),
            EvidenceKind::ConnectionWithoutDns => write!(f, "ConnectionWithoutDNS"),
            EvidenceKind::DnsWithoutConnection => write!(f, "DNSWithoutConnection"),
            EvidenceKind::SshSuccessful(model) => write!(f, "SSHSuccessful-by-{}", model.as_str()),
            EvidenceKind::SelfSignedCertificate => write!(f, "SelfSignedCertificate"),
            EvidenceKind::InvalidCertificate => write!(f, "InvalidCertificate"),
            EvidenceKind::MaliciousJa3 => write!(f, "MaliciousJA3"),
            EvidenceKind::MaliciousJa3s => write!(f, "MaliciousJA3s"),
            EvidenceKind::DataExfiltration => write!(f, "DataExfiltration"),
            EvidenceKind::PortScanType1 => write!(f, "PortScanType1"),
            EvidenceKind::PortScanType2 => write!(f, "PortScanType2"),
            EvidenceKind::PasswordGuessing => write!(f, "PasswordGuessing"),
        }
    }
}

impl Serialize for EvidenceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One detector's structured output asserting an observed behavior.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub id: Uuid,
    #[serde(rename = "detection_type")]
    pub target: DetectionTarget,
    /// Detection target value; always non-empty
    #[serde(rename = "detection_value")]
    pub value: String,
    #[serde(rename = "evidence_type")]
    pub kind: EvidenceKind,
    /// Detector-defined raw severity, not normalized across detectors
    pub threat_level: f64,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub description: String,
    /// Epoch seconds of the triggering event
    pub timestamp: f64,
    pub profile_id: String,
    /// Empty string when unknown, never null
    pub twid: String,
    pub uid: String,
}

impl Evidence {
    pub fn new(
        kind: EvidenceKind,
        target: DetectionTarget,
        value: impl Into<String>,
        threat_level: f64,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            value: value.into(),
            kind,
            threat_level,
            confidence,
            description: String::new(),
            timestamp: 0.0,
            profile_id: String::new(),
            twid: String::new(),
            uid: String::new(),
        }
    }

    /// Attach the human-readable description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach the envelope of the record that triggered this evidence.
    pub fn from_record(self, rec: &FlowRecord) -> Self {
        self.tagged(&rec.profile_id, &rec.twid, &rec.uid, rec.timestamp)
    }

    /// Attach envelope fields individually (used by deferred re-checks).
    pub fn tagged(mut self, profile_id: &str, twid: &str, uid: &str, timestamp: f64) -> Self {
        self.profile_id = profile_id.to_string();
        self.twid = twid.to_string();
        self.uid = uid.to_string();
        self.timestamp = timestamp;
        self
    }
}
