//! Scan state machine, exclusive session handle, and phase sequencing.

use crate::collector;
use crate::config::{ScanConfiguration, ScanParameters};
use crate::error::ScanError;
use crate::prober;
use crate::speedtest;
use crate::tunnel;
use crate::types::{now_rfc3339, Candidate, CandidateSource, FailureReason, SpeedResult};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The event log keeps only the most recent lines; old ones are dropped.
pub const EVENT_LOG_CAP: usize = 100;

/// Lifecycle of one scan session.
///
/// `Collecting → Probing → SpeedTesting → Completed`, with `Cancelled` and
/// `Failed` reachable from any non-terminal state. A new scan may start only
/// while no session is active.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Collecting,
    Probing,
    SpeedTesting,
    Completed,
    Cancelled,
    Failed,
}

impl ScanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::Cancelled | ScanPhase::Failed
        )
    }
}

#[derive(Default, Debug)]
struct Counters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Attempted/succeeded/failed counters for one phase, shared between the
/// pipeline and any number of status readers without locking.
#[derive(Clone, Default, Debug)]
pub struct PhaseCounters {
    inner: Arc<Counters>,
}

impl PhaseCounters {
    pub fn add_attempted(&self) {
        self.inner.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            attempted: self.inner.attempted.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, Default)]
pub struct PhaseSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub collecting: PhaseSnapshot,
    pub probing: PhaseSnapshot,
    pub speed_testing: PhaseSnapshot,
}

/// Per-phase counters plus the textual event log, cheap to clone and safe to
/// read while the pipeline runs.
#[derive(Clone, Default, Debug)]
pub struct ScanProgress {
    pub collecting: PhaseCounters,
    pub probing: PhaseCounters,
    pub speed_testing: PhaseCounters,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScanProgress {
    pub async fn push_event(&self, message: impl Into<String>) {
        let line = format!("{} {}", now_rfc3339(), message.into());
        let mut log = self.log.lock().await;
        log.push(line);
        if log.len() > EVENT_LOG_CAP {
            let overflow = log.len() - EVENT_LOG_CAP;
            log.drain(..overflow);
        }
    }

    pub async fn recent_events(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            collecting: self.collecting.snapshot(),
            probing: self.probing.snapshot(),
            speed_testing: self.speed_testing.snapshot(),
        }
    }
}

/// Poll-friendly view of a session for front ends.
#[derive(Serialize, Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ScanPhase,
    pub error: Option<String>,
    pub progress: ProgressSnapshot,
    pub log: Vec<String>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            state: ScanPhase::Idle,
            error: None,
            progress: ProgressSnapshot::default(),
            log: Vec::new(),
        }
    }
}

/// Exclusive ownership of the process-wide scan slot. Dropping the guard
/// releases the slot, including on panic inside the driver task.
struct SessionGuard {
    slot: Arc<AtomicBool>,
}

impl SessionGuard {
    fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { slot: slot.clone() })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// One scan from start to terminal state: parameters, live progress,
/// cancellation signal, and accumulated results.
#[derive(Debug)]
pub struct ScanSession {
    pub params: ScanParameters,
    pub progress: ScanProgress,
    pub cancel: CancellationToken,
    phase: RwLock<ScanPhase>,
    error: RwLock<Option<String>>,
    results: RwLock<Vec<SpeedResult>>,
}

impl ScanSession {
    fn new(params: ScanParameters) -> Arc<Self> {
        Arc::new(Self {
            params,
            progress: ScanProgress::default(),
            cancel: CancellationToken::new(),
            phase: RwLock::new(ScanPhase::Collecting),
            error: RwLock::new(None),
            results: RwLock::new(Vec::new()),
        })
    }

    pub async fn phase(&self) -> ScanPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: ScanPhase) {
        *self.phase.write().await = phase;
    }

    async fn fail(&self, err: ScanError) {
        tracing::warn!("scan failed: {err}");
        self.progress.push_event(format!("scan failed: {err}")).await;
        *self.error.write().await = Some(err.to_string());
        self.set_phase(ScanPhase::Failed).await;
    }

    async fn finish_cancelled(&self) {
        self.progress.push_event("scan cancelled").await;
        self.set_phase(ScanPhase::Cancelled).await;
    }

    pub async fn results(&self) -> Vec<SpeedResult> {
        self.results.read().await.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.phase().await,
            error: self.error.read().await.clone(),
            progress: self.progress.snapshot(),
            log: self.progress.recent_events().await,
        }
    }
}

/// Owns the configuration and enforces the single-flight invariant: at most
/// one session may be active process-wide at any time.
pub struct Orchestrator {
    config: ScanConfiguration,
    slot: Arc<AtomicBool>,
    current: RwLock<Option<Arc<ScanSession>>>,
}

impl Orchestrator {
    pub fn new(config: ScanConfiguration) -> Self {
        Self {
            config,
            slot: Arc::new(AtomicBool::new(false)),
            current: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ScanConfiguration {
        &self.config
    }

    /// Validate parameters, claim the scan slot, and drive a full scan on a
    /// background task. Returns `AlreadyRunning` when a session is active.
    pub async fn start_scan(
        &self,
        params: ScanParameters,
    ) -> Result<(Arc<ScanSession>, JoinHandle<()>), ScanError> {
        params.validate()?;
        self.config.validate()?;
        let guard = SessionGuard::acquire(&self.slot).ok_or(ScanError::AlreadyRunning)?;

        let session = ScanSession::new(params);
        *self.current.write().await = Some(session.clone());

        let config = self.config.clone();
        let driver = session.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard; // released when the scan reaches a terminal state
            run_scan(config, driver).await;
        });
        Ok((session, handle))
    }

    /// Signal cancellation of the active session, if any.
    pub async fn cancel(&self) -> bool {
        let session = match self.current.read().await.clone() {
            Some(session) => session,
            None => return false,
        };
        if session.phase().await.is_terminal() {
            return false;
        }
        session.cancel.cancel();
        true
    }

    pub async fn current_session(&self) -> Option<Arc<ScanSession>> {
        self.current.read().await.clone()
    }

    /// Diagnostic one-candidate scan: probe + speed test, skipping collection.
    /// An unreachable IP short-circuits without ever launching the tunnel.
    pub async fn single_ip_test(
        &self,
        ip: IpAddr,
        params: ScanParameters,
    ) -> Result<SpeedResult, ScanError> {
        params.validate()?;
        self.config.validate()?;
        let _guard = SessionGuard::acquire(&self.slot).ok_or(ScanError::AlreadyRunning)?;

        let candidate = Candidate {
            ip,
            source: CandidateSource::TestIp,
        };
        let probe =
            prober::probe_one(candidate.clone(), self.config.vless_port, params.tcp_timeout())
                .await;
        if !probe.reachable {
            return Ok(SpeedResult::failure(&candidate, FailureReason::Unreachable));
        }
        if let Err(err) = tunnel::ensure_port_free(self.config.local_socks_port).await {
            tracing::warn!("{err}");
        }
        Ok(speedtest::test_candidate(&self.config, &params, &probe).await)
    }
}

async fn run_scan(config: ScanConfiguration, session: Arc<ScanSession>) {
    let progress = session.progress.clone();

    progress.push_event("collecting candidate IPs").await;
    let candidates = match collector::collect_candidates(
        &config,
        &session.params,
        &session.cancel,
        &progress,
    )
    .await
    {
        Ok(candidates) => candidates,
        Err(err) => {
            session.fail(err).await;
            return;
        }
    };
    if session.cancel.is_cancelled() {
        session.finish_cancelled().await;
        return;
    }
    progress
        .push_event(format!("collected {} candidates", candidates.len()))
        .await;

    session.set_phase(ScanPhase::Probing).await;
    progress
        .push_event(format!(
            "probing {} candidates on port {}",
            candidates.len(),
            config.vless_port
        ))
        .await;
    let probes = match prober::probe_candidates(
        &candidates,
        config.vless_port,
        session.params.tcp_timeout(),
        session.params.probe_concurrency,
        session.cancel.clone(),
        progress.probing.clone(),
    )
    .await
    {
        Ok(probes) => probes,
        Err(err) => {
            session.fail(err).await;
            return;
        }
    };
    if session.cancel.is_cancelled() {
        session.finish_cancelled().await;
        return;
    }

    let mut reachable: Vec<_> = probes.into_iter().filter(|p| p.reachable).collect();
    reachable.sort_by_key(|p| p.latency_ms.unwrap_or(u64::MAX));
    let reachable_total = reachable.len();
    reachable.truncate(session.params.target_ip_count);
    progress
        .push_event(format!(
            "{reachable_total} candidates reachable, speed testing the fastest {}",
            reachable.len()
        ))
        .await;

    session.set_phase(ScanPhase::SpeedTesting).await;
    let results = speedtest::speed_test_candidates(
        &config,
        &session.params,
        &reachable,
        &session.cancel,
        &progress,
    )
    .await;
    *session.results.write().await = results;

    if session.cancel.is_cancelled() {
        session.finish_cancelled().await;
        return;
    }

    let results = session.results.read().await;
    let successes = results.iter().filter(|r| r.success).count();
    if successes == 0 {
        progress
            .push_event(
                "completed with no working candidates; check tunnel credentials, \
                 server reachability, and ISP filtering",
            )
            .await;
    }
    if let (true, Some(test_ip)) = (config.include_test_ip, config.test_ip) {
        if let Some(result) = results.iter().find(|r| r.ip == test_ip) {
            if !result.success {
                let reason = result
                    .failure
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".into());
                progress
                    .push_event(format!(
                        "known-good test IP {test_ip} failed ({reason}); this points at \
                         tunnel/server configuration rather than network conditions"
                    ))
                    .await;
            }
        }
    }
    drop(results);

    progress
        .push_event(format!("scan completed with {successes} working candidates"))
        .await;
    session.set_phase(ScanPhase::Completed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_log_is_capped() {
        let progress = ScanProgress::default();
        for i in 0..150 {
            progress.push_event(format!("event {i}")).await;
        }
        let events = progress.recent_events().await;
        assert_eq!(events.len(), EVENT_LOG_CAP);
        assert!(events.last().unwrap().contains("event 149"));
        assert!(events.first().unwrap().contains("event 50"));
    }

    #[test]
    fn session_guard_is_exclusive_until_dropped() {
        let slot = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::acquire(&slot).expect("first acquire");
        assert!(SessionGuard::acquire(&slot).is_none());
        drop(guard);
        assert!(SessionGuard::acquire(&slot).is_some());
    }
}
