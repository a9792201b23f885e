use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use ::time::{format_description::well_known, OffsetDateTime};

/// An IP address under consideration, tagged with the source it was collected from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub ip: IpAddr,
    pub source: CandidateSource,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Provider(String),
    Range(String),
    TestIp,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Provider(name) => write!(f, "provider:{name}"),
            CandidateSource::Range(cidr) => write!(f, "range:{cidr}"),
            CandidateSource::TestIp => write!(f, "test-ip"),
        }
    }
}

/// Outcome of one TCP reachability probe. Exactly one per submitted candidate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProbeResult {
    pub candidate: Candidate,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
}

/// Why a speed test attempt produced no usable measurement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unreachable,
    ProcessStart,
    ReadinessTimeout,
    ProxyConnect,
    NoData,
    TransferError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::Unreachable => "tcp connection failed",
            FailureReason::ProcessStart => "tunnel process failed to start",
            FailureReason::ReadinessTimeout => "tunnel did not become ready in time",
            FailureReason::ProxyConnect => "proxy connection refused",
            FailureReason::NoData => "zero bytes transferred",
            FailureReason::TransferError => "transfer error mid-stream",
        };
        f.write_str(text)
    }
}

/// Outcome of one tunnel-proxied speed test. One attempt per reachable candidate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpeedResult {
    pub ip: IpAddr,
    pub source: CandidateSource,
    pub success: bool,
    pub speed_mbps: Option<f64>,
    pub latency_ms: Option<u64>,
    pub operator: String,
    pub failure: Option<FailureReason>,
    pub tested_at: String,
}

impl SpeedResult {
    pub fn success(candidate: &Candidate, speed_mbps: f64, latency_ms: u64) -> Self {
        Self {
            ip: candidate.ip,
            source: candidate.source.clone(),
            success: true,
            speed_mbps: Some(speed_mbps),
            latency_ms: Some(latency_ms),
            operator: crate::operators::classify(candidate.ip).to_string(),
            failure: None,
            tested_at: now_rfc3339(),
        }
    }

    pub fn failure(candidate: &Candidate, reason: FailureReason) -> Self {
        Self {
            ip: candidate.ip,
            source: candidate.source.clone(),
            success: false,
            speed_mbps: None,
            latency_ms: None,
            operator: crate::operators::classify(candidate.ip).to_string(),
            failure: Some(reason),
            tested_at: now_rfc3339(),
        }
    }
}

/// One entry of the sorted, deduplicated view exposed at scan completion.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RankedResult {
    pub rank: usize,
    pub ip: IpAddr,
    pub speed_mbps: f64,
    pub latency_ms: u64,
    pub operator: String,
    pub success: bool,
}

/// Serializable result snapshot: the ranked view plus the raw per-candidate
/// records (failures included) for diagnostics and export.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResultSnapshot {
    pub generated_at: String,
    pub ranked: Vec<RankedResult>,
    pub raw: Vec<SpeedResult>,
}

pub fn now_rfc3339() -> String {
    // RFC3339 UTC timestamp using `time` crate for correctness without heavy deps.
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
