//! Sequential tunnel-proxied speed testing of reachable candidates.
//!
//! Only one tunnel process may bind the shared local proxy port at a time,
//! which is why this phase runs strictly one candidate after another.

use crate::config::{ScanConfiguration, ScanParameters};
use crate::orchestrator::ScanProgress;
use crate::tunnel::{self, TunnelProcess};
use crate::types::{FailureReason, ProbeResult, SpeedResult};
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

pub const LATENCY_TEST_URL: &str = "http://www.gstatic.com/generate_204";
pub const DOWNLOAD_TEST_URL: &str = "https://speed.cloudflare.com/__down?bytes=10000000";

const SETTLE_BETWEEN_ATTEMPTS: Duration = Duration::from_millis(500);

/// Speed test the given reachable candidates one at a time, recording one
/// `SpeedResult` per attempt. Per-candidate failures never abort the phase;
/// cancellation stops after tearing down the in-flight tunnel.
pub async fn speed_test_candidates(
    config: &ScanConfiguration,
    params: &ScanParameters,
    targets: &[ProbeResult],
    cancel: &CancellationToken,
    progress: &ScanProgress,
) -> Vec<SpeedResult> {
    let mut results = Vec::with_capacity(targets.len());

    if let Err(err) = tunnel::ensure_port_free(config.local_socks_port).await {
        progress
            .push_event(format!(
                "proxy port {} could not be reclaimed: {err}",
                config.local_socks_port
            ))
            .await;
    }

    for (idx, probe) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        progress
            .push_event(format!(
                "[{}/{}] speed testing {} (probe {} ms)",
                idx + 1,
                targets.len(),
                probe.candidate.ip,
                probe.latency_ms.unwrap_or(0)
            ))
            .await;
        progress.speed_testing.add_attempted();

        // Dropping the in-flight future on cancel kills the child process
        // via kill_on_drop, so the proxy port comes back within the grace
        // period either way.
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = test_candidate(config, params, probe) => result,
        };

        if result.success {
            progress.speed_testing.add_succeeded();
            progress
                .push_event(format!(
                    "{} ok: {:.2} MB/s, {} ms",
                    result.ip,
                    result.speed_mbps.unwrap_or(0.0),
                    result.latency_ms.unwrap_or(0)
                ))
                .await;
        } else {
            progress.speed_testing.add_failed();
            let reason = result
                .failure
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into());
            progress
                .push_event(format!("{} failed: {reason}", result.ip))
                .await;
        }
        results.push(result);

        // Let the freed port settle before the next tunnel binds it.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(SETTLE_BETWEEN_ATTEMPTS) => {}
        }
    }
    results
}

/// Run one candidate through launch → proxied transfer → guaranteed teardown.
pub async fn test_candidate(
    config: &ScanConfiguration,
    params: &ScanParameters,
    probe: &ProbeResult,
) -> SpeedResult {
    let candidate = &probe.candidate;
    let tunnel =
        match TunnelProcess::launch(config, candidate.ip, params.connect_timeout()).await {
            Ok(tunnel) => tunnel,
            Err(reason) => return SpeedResult::failure(candidate, reason),
        };
    let outcome = run_transfer(tunnel.socks_port(), params).await;
    tunnel.shutdown().await;
    match outcome {
        Ok((speed_mbps, latency_ms)) => SpeedResult::success(candidate, speed_mbps, latency_ms),
        Err(reason) => SpeedResult::failure(candidate, reason),
    }
}

async fn run_transfer(socks_port: u16, params: &ScanParameters) -> Result<(f64, u64), FailureReason> {
    let connect_timeout = params.connect_timeout();
    let client = proxied_client(socks_port, connect_timeout).map_err(|err| {
        tracing::warn!("failed to build proxied client: {err}");
        FailureReason::ProxyConnect
    })?;

    // First-byte latency against a tiny well-known endpoint.
    let start = Instant::now();
    let response = match client
        .get(LATENCY_TEST_URL)
        .timeout(connect_timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("latency probe failed: {err}");
            return Err(FailureReason::ProxyConnect);
        }
    };
    let latency_ms = start.elapsed().as_millis() as u64;
    if response.status() != reqwest::StatusCode::NO_CONTENT {
        return Err(FailureReason::TransferError);
    }

    let window = params.speed_test_duration();
    let mut response = match client
        .get(DOWNLOAD_TEST_URL)
        .timeout(connect_timeout + window + connect_timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("download request failed: {err}");
            return Err(FailureReason::ProxyConnect);
        }
    };

    let start = Instant::now();
    let mut downloaded: u64 = 0;
    loop {
        if start.elapsed() >= window {
            break;
        }
        match response.chunk().await {
            Ok(Some(chunk)) => downloaded += chunk.len() as u64,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("download interrupted: {err}");
                return Err(if downloaded == 0 {
                    FailureReason::NoData
                } else {
                    FailureReason::TransferError
                });
            }
        }
    }
    if downloaded == 0 {
        return Err(FailureReason::NoData);
    }
    let elapsed = start.elapsed().as_secs_f64().max(0.001);
    let speed_mbps = (downloaded as f64 / (1024.0 * 1024.0)) / elapsed;
    Ok((speed_mbps, latency_ms))
}

fn proxied_client(socks_port: u16, connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    // socks5h so remote names resolve through the tunnel, not the local resolver.
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))?)
        .connect_timeout(connect_timeout)
        .user_agent("Mozilla/5.0")
        .build()
}
