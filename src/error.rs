use thiserror::Error;

/// Scan-level error taxonomy. Per-candidate failures are data
/// (`FailureReason` inside `SpeedResult`), never errors.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("candidate collection failed: {0}")]
    Collection(String),

    #[error("connectivity probing failed: {0}")]
    Probe(String),

    #[error("a scan is already running")]
    AlreadyRunning,
}
