use crate::error::ScanError;
use crate::orchestrator::PhaseCounters;
use crate::types::{Candidate, ProbeResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROBE_CONCURRENCY: usize = 64;

/// Probe each candidate with a bounded-concurrency TCP handshake on `port`.
///
/// - Limits concurrent socket attempts using a `Semaphore`.
/// - Uses `tokio::time::timeout` to bound connect time per socket.
/// - Every submitted candidate yields exactly one `ProbeResult`; a refused or
///   timed-out connect is `reachable=false`, which is data, not an error.
/// - Fails with `ProbeError` only when zero candidates are reachable.
pub async fn probe_candidates(
    candidates: &[Candidate],
    port: u16,
    timeout: Duration,
    concurrency: usize,
    cancel: CancellationToken,
    counters: PhaseCounters,
) -> Result<Vec<ProbeResult>, ScanError> {
    let results = Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 1024)));
    let mut set = JoinSet::new();

    for candidate in candidates.iter().cloned() {
        if cancel.is_cancelled() {
            break;
        }
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");
        let results = results.clone();
        let counters = counters.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            let result = if cancel.is_cancelled() {
                ProbeResult {
                    candidate,
                    reachable: false,
                    latency_ms: None,
                }
            } else {
                probe_with_cancel(candidate, port, timeout, &cancel).await
            };

            counters.add_attempted();
            if result.reachable {
                counters.add_succeeded();
            } else {
                counters.add_failed();
            }
            results.lock().await.push(result);
        });
    }

    while set.join_next().await.is_some() {}

    let results = match Arc::try_unwrap(results) {
        Ok(mutex) => mutex.into_inner(),
        // All tasks are joined, so this branch shouldn't trigger; clone out if it does.
        Err(arc) => arc.lock().await.clone(),
    };

    if !cancel.is_cancelled() && !results.iter().any(|r| r.reachable) {
        return Err(ScanError::Probe(format!(
            "none of the {} candidates accepted a TCP connection on port {port}",
            results.len()
        )));
    }
    Ok(results)
}

/// Probe a single candidate, used by the single-IP diagnostic path.
pub async fn probe_one(candidate: Candidate, port: u16, timeout: Duration) -> ProbeResult {
    probe_with_cancel(candidate, port, timeout, &CancellationToken::new()).await
}

async fn probe_with_cancel(
    candidate: Candidate,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProbeResult {
    let addr = SocketAddr::new(candidate.ip, port);
    let start = Instant::now();
    let reachable = tokio::select! {
        // Abandon the in-flight connect instead of waiting out its timeout.
        _ = cancel.cancelled() => false,
        res = time::timeout(timeout, TcpStream::connect(addr)) => matches!(res, Ok(Ok(_))),
    };
    let latency_ms = reachable.then(|| start.elapsed().as_millis() as u64);
    ProbeResult {
        candidate,
        reachable,
        latency_ms,
    }
}
